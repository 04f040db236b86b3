// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Message digest registry
//!
//! LUKS2 metadata names digests by their `cryptsetup` string ("sha256" and
//! friends). Everything downstream — keyslot KDFs, stored digests and the
//! anti-forensic merge — resolves those names through [`HashAlg`].

use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroize;

/// Message digests available to keyslot KDFs, stored digests, and the
/// anti-forensic merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlg {
    /// Look up a digest by its on-disk name
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Output length in bytes
    pub fn digest_size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// PBKDF2-HMAC with this digest, filling all of `out`
    pub fn pbkdf2(self, password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
        match self {
            Self::Sha1 => pbkdf2_hmac::<Sha1>(password, salt, iterations, out),
            Self::Sha256 => pbkdf2_hmac::<Sha256>(password, salt, iterations, out),
            Self::Sha512 => pbkdf2_hmac::<Sha512>(password, salt, iterations, out),
        }
    }

    /// One-shot digest over the concatenation of `parts`, truncated to
    /// `out.len()` bytes
    pub(crate) fn digest_into(self, parts: &[&[u8]], out: &mut [u8]) {
        match self {
            Self::Sha1 => digest_into::<Sha1>(parts, out),
            Self::Sha256 => digest_into::<Sha256>(parts, out),
            Self::Sha512 => digest_into::<Sha512>(parts, out),
        }
    }
}

fn digest_into<D: Digest>(parts: &[&[u8]], out: &mut [u8]) {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    let mut digest = hasher.finalize();
    let len = out.len().min(digest.len());
    out[..len].copy_from_slice(&digest[..len]);
    digest.as_mut_slice().zeroize();
}
