// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! # LUKS2 volume unlocking
//!
//! This crate implements the unlock path for LUKS2 (Linux Unified Key Setup 2)
//! encrypted volumes: locating and validating the binary header, decoding the
//! JSON metadata area, and recovering the volume master key from a passphrase
//! or key file.
//!
//! LUKS2 is the disk encryption format used by `cryptsetup` with the dm-crypt
//! subsystem. Metadata such as encryption parameters, key slots and segment
//! information is stored as JSON behind a fixed binary header kept in two
//! redundant copies.
//!
//! ## Unlock flow
//!
//! [`scan`] performs a header-only probe and allocates the target
//! [`cryptodisk::CryptoDisk`]; [`recover_key`] then derives an area key from
//! the passphrase for each candidate keyslot, decrypts and merges the
//! anti-forensically split key material, verifies the candidate against the
//! stored digest, and on success installs the master key and sector layout
//! into the crypto disk.

use snafu::Snafu;

pub mod af;
pub mod hash;
pub mod header;
pub mod metadata;
pub mod resolve;
mod unlock;

#[cfg(test)]
mod testimage;

pub use unlock::{recover_key, scan};

/// Upper bound on interactive passphrase length, excluding the terminator
pub const MAX_PASSPHRASE: usize = 256;

/// Errors that can occur while probing or unlocking a LUKS2 volume
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// An I/O error from the source device or detached header file
    #[snafu(display("io"))]
    Io { source: std::io::Error },

    /// Magic or version check failed on a header copy
    #[snafu(display("bad {copy} signature"))]
    BadSignature { copy: header::HeaderCopy },

    /// Error decoding UTF-8 string data from the binary header
    #[snafu(display("invalid utf8 in decode"), context(false))]
    InvalidUtf8 { source: std::str::Utf8Error },

    /// The JSON area carried no NUL terminator within the header region
    #[snafu(display("unterminated JSON header"))]
    UnterminatedJson,

    /// The JSON area did not parse as LUKS2 metadata
    #[snafu(display("invalid LUKS2 JSON header"))]
    InvalidJson { source: serde_json::Error },

    /// A keyslot object failed structural validation
    #[snafu(display("could not parse keyslot {index}"))]
    InvalidKeyslot { index: u32, source: serde_json::Error },

    /// A digest object failed structural validation
    #[snafu(display("could not parse digest {index}"))]
    InvalidDigest { index: u32, source: serde_json::Error },

    /// A segment object failed structural validation
    #[snafu(display("could not parse segment {index}"))]
    InvalidSegment { index: u32, source: serde_json::Error },

    /// Keyslot position past the end of the keyslots object
    #[snafu(display("no keyslot at position {position}"))]
    MissingKeyslot { position: usize },

    /// No digest object references the keyslot under trial
    #[snafu(display("no digest for keyslot \"{keyslot}\""))]
    MissingDigest { keyslot: u32 },

    /// No segment object is referenced by the matched digest
    #[snafu(display("no segment for digest \"{digest}\""))]
    MissingSegment { digest: u32 },

    /// A metadata value was rejected outside structural parsing
    #[snafu(display("{what}"))]
    InvalidMetadata { what: String },

    /// A base64 field failed to decode
    #[snafu(display("invalid {what}"))]
    Base64 {
        what: &'static str,
        source: base64::DecodeError,
    },

    /// The named message digest is not provided by this build
    #[snafu(display("couldn't load {name} hash"))]
    UnknownHash { name: String },

    /// Argon2 keyslots are recognized but not derivable
    #[snafu(display("Argon2 not supported"))]
    Argon2Unsupported,

    /// Candidate master key digest did not match the stored digest
    #[snafu(display("mismatching digests"))]
    DigestMismatch,

    /// Every candidate keyslot was tried without success
    #[snafu(display("invalid passphrase"))]
    AccessDenied,

    /// Cipher setup or sector decryption failed
    #[snafu(display("cipher"))]
    Cipher { source: cryptodisk::Error },
}
