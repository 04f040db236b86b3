// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Generic crypto-disk handling
//!
//! A [`CryptoDisk`] is the target object an encrypted-volume backend (such as
//! LUKS2) fills in while unlocking: the backend configures a cipher and IV
//! generation mode, installs a key, and records the sector layout of the
//! decrypted payload. The same [`CryptoDisk::decrypt`] routine serves both the
//! backend's own metadata decryption (key areas) and transparent sector reads
//! once the volume is open.
//!
//! Key material handed to [`CryptoDisk::set_key`] is copied into zeroizing
//! storage and wiped when replaced or cleared.

use thiserror::Error;

mod cipher;
mod source;

pub use cipher::{BlockMode, CipherKind, CipherSpec, IvMode};
pub use source::{BlockSource, ImageSource, ReadSeek};

use cipher::CipherState;

/// Upper bound on key lengths accepted by any supported cipher
pub const MAX_KEY_LEN: usize = 128;

/// Error type for cipher configuration and sector decryption
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown cipher \"{0}\"")]
    UnknownCipher(String),

    #[error("unknown cipher mode \"{0}\"")]
    UnknownMode(String),

    #[error("unknown IV mode \"{0}\"")]
    UnknownIvMode(String),

    #[error("invalid key size {0}")]
    InvalidKeySize(usize),

    #[error("no cipher configured")]
    NoCipher,

    #[error("no key installed")]
    NoKey,

    #[error("buffer is not a whole number of sectors")]
    UnalignedBuffer,
}

/// Decryption state and sector layout for one encrypted volume
///
/// Layout fields are measured in the volume's own sectors, whose size is
/// `1 << log_sector_size` bytes and need not match the source device's.
pub struct CryptoDisk {
    backend: &'static str,
    uuid: String,

    /// First payload sector on the source device
    pub offset_sectors: u64,
    /// Payload length in volume sectors
    pub total_sectors: u64,
    /// log2 of the volume sector size
    pub log_sector_size: u32,

    spec: Option<CipherSpec>,
    state: Option<CipherState>,
}

impl CryptoDisk {
    /// Create a disk with no cipher configured and a zeroed sector layout
    pub fn new(backend: &'static str, uuid: String) -> Self {
        Self {
            backend,
            uuid,
            offset_sectors: 0,
            total_sectors: 0,
            log_sector_size: 0,
            spec: None,
            state: None,
        }
    }

    /// Name of the backend that created this disk, e.g. "luks2"
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Volume UUID as advertised by the backend
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Configure the cipher from its on-disk name and mode specifier,
    /// e.g. ("aes", "xts-plain64"). Discards any installed key.
    pub fn set_cipher(&mut self, cipher: &str, mode: &str) -> Result<(), Error> {
        let spec = CipherSpec::parse(cipher, mode)?;
        log::trace!("cipher configured: {cipher}-{mode}");
        self.state = None;
        self.spec = Some(spec);
        Ok(())
    }

    /// Install a key for the configured cipher. The previous key, if any,
    /// is zeroized when dropped.
    pub fn set_key(&mut self, key: &[u8]) -> Result<(), Error> {
        let spec = self.spec.ok_or(Error::NoCipher)?;
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidKeySize(key.len()));
        }
        self.state = Some(CipherState::from_key(spec, key)?);
        Ok(())
    }

    /// Whether a cipher has been configured
    pub fn has_cipher(&self) -> bool {
        self.spec.is_some()
    }

    /// Length in bytes of the installed key, if one is present
    pub fn key_len(&self) -> Option<usize> {
        self.state.as_ref().map(CipherState::key_len)
    }

    /// Drop cipher configuration and key state, zeroizing key material
    pub fn clear_cipher(&mut self) {
        self.state = None;
        self.spec = None;
    }

    /// Decrypt `buf` in place as consecutive sectors of `1 << log_sector_size`
    /// bytes, the first having IV/tweak index `first_sector`.
    ///
    /// The buffer must be a whole number of sectors.
    pub fn decrypt(&self, buf: &mut [u8], first_sector: u64, log_sector_size: u32) -> Result<(), Error> {
        let state = self.state.as_ref().ok_or(Error::NoKey)?;
        state.decrypt(buf, first_sector, log_sector_size)
    }
}
