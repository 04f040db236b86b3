// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Anti-forensic merge
//!
//! LUKS stores keyslot key material expanded into `stripes` pseudo-random
//! blocks so that recovering a subset of the blocks from a partially wiped
//! disk leaks nothing about the key. The merge direction implemented here is
//! the LUKS1 definition, which LUKS2 keyslots reuse (`af.type == "luks1"`):
//! all stripes except the last are XOR-folded into an accumulator that is
//! diffused after each fold, and the final stripe XORs the key out.

use zeroize::Zeroizing;

use crate::Error;
use crate::hash::HashAlg;

/// Merge `stripes` split blocks of `key_len` bytes from `split` into `out`
///
/// `split` must hold at least `key_len * stripes` bytes; trailing bytes
/// (sector padding of the key area) are ignored.
pub fn merge(hash: HashAlg, split: &[u8], key_len: usize, stripes: usize, out: &mut [u8]) -> Result<(), Error> {
    if key_len == 0 || stripes == 0 || out.len() != key_len {
        return Err(Error::InvalidMetadata {
            what: "invalid anti-forensic geometry".into(),
        });
    }
    let needed = key_len.checked_mul(stripes).ok_or_else(|| Error::InvalidMetadata {
        what: "invalid anti-forensic geometry".into(),
    })?;
    if split.len() < needed {
        return Err(Error::InvalidMetadata {
            what: "key area smaller than split key".into(),
        });
    }

    let mut acc = Zeroizing::new(vec![0u8; key_len]);
    for stripe in 0..stripes - 1 {
        xor_into(&mut acc, &split[stripe * key_len..][..key_len]);
        diffuse(hash, &mut acc);
    }

    let last = &split[(stripes - 1) * key_len..][..key_len];
    for (out, (acc, last)) in out.iter_mut().zip(acc.iter().zip(last)) {
        *out = acc ^ last;
    }
    Ok(())
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (dst, src) in dst.iter_mut().zip(src) {
        *dst ^= src;
    }
}

/// Replace `buf` with its diffusion: each digest-sized chunk is hashed
/// together with its big-endian chunk counter, the final partial chunk
/// taking a truncated digest.
fn diffuse(hash: HashAlg, buf: &mut [u8]) {
    let digest_size = hash.digest_size();
    let mut chunk_in = Zeroizing::new([0u8; 64]);

    for (counter, chunk) in buf.chunks_mut(digest_size).enumerate() {
        let counter = (counter as u32).to_be_bytes();
        chunk_in[..chunk.len()].copy_from_slice(chunk);
        hash.digest_into(&[&counter, &chunk_in[..chunk.len()]], chunk);
    }
}

/// Inverse of [`merge`], for fabricating key areas in tests
#[cfg(test)]
pub(crate) fn split(hash: HashAlg, key: &[u8], stripes: usize, out: &mut [u8]) {
    use rand::RngCore;

    let key_len = key.len();
    assert!(stripes > 0);
    assert_eq!(out.len(), key_len * stripes);

    let mut rng = rand::thread_rng();
    let mut acc = vec![0u8; key_len];
    for stripe in 0..stripes - 1 {
        let block = &mut out[stripe * key_len..][..key_len];
        rng.fill_bytes(block);
        xor_into(&mut acc, block);
        diffuse(hash, &mut acc);
    }

    let last = &mut out[(stripes - 1) * key_len..][..key_len];
    for (last, (acc, key)) in last.iter_mut().zip(acc.iter().zip(key)) {
        *last = acc ^ key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn merge_inverts_split() {
        for hash in [HashAlg::Sha1, HashAlg::Sha256, HashAlg::Sha512] {
            for key_len in [16usize, 32, 64] {
                for stripes in [1usize, 2, 7, 64] {
                    let key: Vec<u8> = (0..key_len).map(|i| (i * 13 + 5) as u8).collect();
                    let mut material = vec![0u8; key_len * stripes];
                    split(hash, &key, stripes, &mut material);

                    let mut recovered = vec![0u8; key_len];
                    merge(hash, &material, key_len, stripes, &mut recovered).unwrap();
                    assert_eq!(recovered, key, "{hash:?} key_len={key_len} stripes={stripes}");
                }
            }
        }
    }

    #[test]
    fn single_stripe_is_the_key_itself() {
        let key = [0xabu8; 32];
        let mut material = vec![0u8; 32];
        split(HashAlg::Sha256, &key, 1, &mut material);
        assert_eq!(material, key);
    }

    #[test]
    fn corrupt_stripe_changes_the_key() {
        let key = [0x5au8; 32];
        let mut material = vec![0u8; 32 * 4];
        split(HashAlg::Sha256, &key, 4, &mut material);
        material[40] ^= 1;

        let mut recovered = vec![0u8; 32];
        merge(HashAlg::Sha256, &material, 32, 4, &mut recovered).unwrap();
        assert_ne!(recovered, key);
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let key = [9u8; 16];
        let mut material = vec![0u8; 16 * 3];
        split(HashAlg::Sha1, &key, 3, &mut material);
        // Key areas are sector padded on disk
        material.extend_from_slice(&[0u8; 512]);

        let mut recovered = vec![0u8; 16];
        merge(HashAlg::Sha1, &material, 16, 3, &mut recovered).unwrap();
        assert_eq!(recovered, key);
    }

    #[test]
    fn undersized_area_is_rejected() {
        let material = vec![0u8; 63];
        let mut out = vec![0u8; 16];
        assert!(merge(HashAlg::Sha256, &material, 16, 4, &mut out).is_err());
        assert!(merge(HashAlg::Sha256, &material, 16, 0, &mut out).is_err());
    }
}
