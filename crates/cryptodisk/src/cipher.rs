// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Cipher configuration and sector decryption kernels
//!
//! Encryption specifiers follow the dm-crypt convention used on disk:
//! a cipher name ("aes") and a mode string of the form
//! `<blockmode>-<ivmode>`, e.g. `xts-plain64` or `cbc-essiv:sha256`.
//! The IV mode decides how a sector index is turned into the per-sector
//! IV or XTS tweak.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, KeyInit, KeyIvInit};
use aes::{Aes128, Aes256};
use sha2::{Digest, Sha256};
use xts_mode::{Xts128, get_tweak_default};
use zeroize::{Zeroize, Zeroizing};

use crate::Error;

const BLOCK_LEN: usize = 16;

/// Block cipher families supported for volume decryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes,
}

/// Chaining modes supported for volume decryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    Xts,
    Cbc,
}

/// Per-sector IV generation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvMode {
    /// 32-bit little-endian sector number, zero padded
    Plain,
    /// 64-bit little-endian sector number, zero padded
    Plain64,
    /// Sector number encrypted with AES-256 keyed by SHA-256 of the data key
    EssivSha256,
}

/// A parsed cipher specifier, not yet keyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSpec {
    pub cipher: CipherKind,
    pub mode: BlockMode,
    pub iv: IvMode,
}

impl CipherSpec {
    /// Parse an on-disk cipher name and mode specifier
    pub fn parse(cipher: &str, mode: &str) -> Result<Self, Error> {
        let kind = match cipher {
            "aes" => CipherKind::Aes,
            _ => return Err(Error::UnknownCipher(cipher.into())),
        };

        let (block, iv) = mode.split_once('-').ok_or_else(|| Error::UnknownMode(mode.into()))?;
        let block = match block {
            "xts" => BlockMode::Xts,
            "cbc" => BlockMode::Cbc,
            _ => return Err(Error::UnknownMode(mode.into())),
        };
        let iv = match iv {
            "plain" => IvMode::Plain,
            "plain64" => IvMode::Plain64,
            "essiv:sha256" => IvMode::EssivSha256,
            _ => return Err(Error::UnknownIvMode(iv.into())),
        };

        // XTS carries its own tweak schedule; ESSIV only pairs with CBC
        if block == BlockMode::Xts && iv == IvMode::EssivSha256 {
            return Err(Error::UnknownIvMode(format!("{mode} (ESSIV requires CBC)")));
        }

        Ok(Self {
            cipher: kind,
            mode: block,
            iv,
        })
    }
}

enum Kernel {
    XtsAes128(Box<Xts128<Aes128>>),
    XtsAes256(Box<Xts128<Aes256>>),
    CbcAes128(Zeroizing<Vec<u8>>),
    CbcAes256(Zeroizing<Vec<u8>>),
}

/// A keyed cipher ready to decrypt sectors
pub(crate) struct CipherState {
    iv: IvMode,
    kernel: Kernel,
    essiv: Option<Box<Aes256>>,
    key_len: usize,
}

impl CipherState {
    /// Key a cipher kernel according to `spec`. XTS keys carry both halves
    /// back to back; CBC keys are used as-is.
    pub(crate) fn from_key(spec: CipherSpec, key: &[u8]) -> Result<Self, Error> {
        let CipherKind::Aes = spec.cipher;

        let kernel = match (spec.mode, key.len()) {
            (BlockMode::Xts, 32) => Kernel::XtsAes128(Box::new(Xts128::new(
                Aes128::new(GenericArray::from_slice(&key[..16])),
                Aes128::new(GenericArray::from_slice(&key[16..])),
            ))),
            (BlockMode::Xts, 64) => Kernel::XtsAes256(Box::new(Xts128::new(
                Aes256::new(GenericArray::from_slice(&key[..32])),
                Aes256::new(GenericArray::from_slice(&key[32..])),
            ))),
            (BlockMode::Cbc, 16) => Kernel::CbcAes128(Zeroizing::new(key.to_vec())),
            (BlockMode::Cbc, 32) => Kernel::CbcAes256(Zeroizing::new(key.to_vec())),
            (_, len) => return Err(Error::InvalidKeySize(len)),
        };

        let essiv = match spec.iv {
            IvMode::EssivSha256 => {
                let mut digest = Sha256::digest(key);
                let cipher = Aes256::new(&digest);
                digest.as_mut_slice().zeroize();
                Some(Box::new(cipher))
            }
            _ => None,
        };

        Ok(Self {
            iv: spec.iv,
            kernel,
            essiv,
            key_len: key.len(),
        })
    }

    pub(crate) fn key_len(&self) -> usize {
        self.key_len
    }

    pub(crate) fn decrypt(&self, buf: &mut [u8], first_sector: u64, log_sector_size: u32) -> Result<(), Error> {
        let sector_size = 1usize << log_sector_size;
        if sector_size < BLOCK_LEN || buf.len() % sector_size != 0 {
            return Err(Error::UnalignedBuffer);
        }

        macro_rules! cbc_sectors {
            ($cipher:ty, $key:expr) => {
                for (i, sector) in buf.chunks_exact_mut(sector_size).enumerate() {
                    let iv = self.sector_iv(first_sector + i as u64);
                    let mut dec = cbc::Decryptor::<$cipher>::new_from_slices($key, &iv)
                        .map_err(|_| Error::InvalidKeySize($key.len()))?;
                    for block in sector.chunks_exact_mut(BLOCK_LEN) {
                        dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
                    }
                }
            };
        }

        match &self.kernel {
            Kernel::XtsAes128(xts) => self.decrypt_xts(xts, buf, sector_size, first_sector),
            Kernel::XtsAes256(xts) => self.decrypt_xts(xts, buf, sector_size, first_sector),
            Kernel::CbcAes128(key) => cbc_sectors!(Aes128, key),
            Kernel::CbcAes256(key) => cbc_sectors!(Aes256, key),
        }

        Ok(())
    }

    fn decrypt_xts<C: BlockEncrypt + BlockDecrypt + aes::cipher::BlockCipher>(
        &self,
        xts: &Xts128<C>,
        buf: &mut [u8],
        sector_size: usize,
        first_sector: u64,
    ) {
        match self.iv {
            IvMode::Plain64 => xts.decrypt_area(buf, sector_size, u128::from(first_sector), get_tweak_default),
            IvMode::Plain => xts.decrypt_area(buf, sector_size, u128::from(first_sector), |sector| {
                let mut tweak = [0u8; 16];
                tweak[..4].copy_from_slice(&(sector as u32).to_le_bytes());
                tweak
            }),
            // Unreachable: rejected in CipherSpec::parse
            IvMode::EssivSha256 => {}
        }
    }

    fn sector_iv(&self, sector: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        match self.iv {
            IvMode::Plain => iv[..4].copy_from_slice(&(sector as u32).to_le_bytes()),
            IvMode::Plain64 => iv[..8].copy_from_slice(&sector.to_le_bytes()),
            IvMode::EssivSha256 => {
                iv[..8].copy_from_slice(&sector.to_le_bytes());
                if let Some(essiv) = &self.essiv {
                    essiv.encrypt_block(GenericArray::from_mut_slice(&mut iv));
                }
            }
        }
        iv
    }
}
