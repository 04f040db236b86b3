// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory LUKS2 volume fabrication for tests
//!
//! Builds bit-exact miniature volumes: two binary header copies with their
//! JSON areas, anti-forensically split and XTS-encrypted keyslot areas, a
//! PBKDF2 digest over the master key, and one encrypted payload sector.
//! Geometry is deliberately small so derivation stays fast.

use aes::Aes256;
use aes::cipher::{KeyInit, generic_array::GenericArray};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use xts_mode::{Xts128, get_tweak_default};

use crate::af;
use crate::hash::HashAlg;
use crate::header::HeaderCopy;

/// Header region size: 4096 byte binary header + JSON area
pub(crate) const HDR_SIZE: u64 = 16384;
/// First keyslot area, leaving room for both header regions
const AREA_BASE: u64 = 32768;
/// Key area per slot, 512-byte aligned with generous padding
const AREA_SIZE: u64 = 16384;
/// Payload segment start
pub(crate) const SEGMENT_OFFSET: u64 = 131072;
/// Whole image: headers, key areas, one 4096-byte payload sector and slack
const IMAGE_LEN: usize = 196608;
const SECTOR_SIZE: u64 = 4096;

pub(crate) const KEY_LEN: usize = 64;
const STRIPES: usize = 4;
const ITERATIONS: u32 = 42;

pub(crate) const UUID: &str = "8f0a33f1-4fbd-4a29-98f3-5e7c2a6b3d10";

/// One keyslot to fabricate
pub(crate) struct SlotSpec {
    pub passphrase: &'static [u8],
    pub priority: Option<i64>,
    pub argon2: bool,
}

impl SlotSpec {
    pub fn pbkdf2(passphrase: &'static [u8]) -> Self {
        Self {
            passphrase,
            priority: None,
            argon2: false,
        }
    }

    /// An Argon2id slot; its key area is left unwritten since no passphrase
    /// can reach it through this implementation
    pub fn argon2() -> Self {
        Self {
            passphrase: b"",
            priority: None,
            argon2: true,
        }
    }
}

/// A fabricated volume with the secrets used to build it
pub(crate) struct TestVolume {
    pub image: Vec<u8>,
    pub master_key: Vec<u8>,
    /// Plaintext of the first payload sector
    pub payload: Vec<u8>,
}

/// Write one bare header copy (no JSON) into `image`
pub(crate) fn write_bare_header(image: &mut [u8], copy: HeaderCopy, seqid: u64, uuid: &str) {
    let (offset, magic): (usize, &[u8; 6]) = match copy {
        HeaderCopy::Primary => (0, b"LUKS\xba\xbe"),
        HeaderCopy::Secondary => (HDR_SIZE as usize, b"SKUL\xba\xbe"),
    };

    let header = &mut image[offset..offset + 4096];
    header.fill(0);
    header[..6].copy_from_slice(magic);
    header[6..8].copy_from_slice(&2u16.to_be_bytes());
    header[8..16].copy_from_slice(&HDR_SIZE.to_be_bytes());
    header[16..24].copy_from_slice(&seqid.to_be_bytes());
    header[72..78].copy_from_slice(b"sha256");
    header[168..168 + uuid.len()].copy_from_slice(uuid.as_bytes());
    header[256..264].copy_from_slice(&(offset as u64).to_be_bytes());
}

/// Write NUL-terminated JSON text into the given copy's JSON area
pub(crate) fn write_json(image: &mut [u8], copy: HeaderCopy, text: &str) {
    let offset = match copy {
        HeaderCopy::Primary => 4096usize,
        HeaderCopy::Secondary => HDR_SIZE as usize + 4096,
    };
    let region = &mut image[offset..offset + (HDR_SIZE as usize - 4096)];
    assert!(text.len() < region.len(), "JSON too large for header region");
    region.fill(0);
    region[..text.len()].copy_from_slice(text.as_bytes());
}

/// Metadata describing no keyslots at all
pub(crate) fn empty_metadata() -> String {
    json!({ "keyslots": {}, "segments": {}, "digests": {} }).to_string()
}

fn xts(key: &[u8]) -> Xts128<Aes256> {
    Xts128::new(
        Aes256::new(GenericArray::from_slice(&key[..32])),
        Aes256::new(GenericArray::from_slice(&key[32..])),
    )
}

fn slot_salt(index: usize) -> [u8; 32] {
    [0x40 + index as u8; 32]
}

pub(crate) fn build(slots: &[SlotSpec]) -> TestVolume {
    build_with_segment(slots, "dynamic")
}

/// Build a volume whose single segment advertises `segment_size`
/// ("dynamic" or a decimal byte count)
pub(crate) fn build_with_segment(slots: &[SlotSpec], segment_size: &str) -> TestVolume {
    assert!(AREA_BASE + slots.len() as u64 * AREA_SIZE <= SEGMENT_OFFSET);

    let mut image = vec![0u8; IMAGE_LEN];
    let master_key: Vec<u8> = (0..KEY_LEN).map(|i| (i as u8).wrapping_mul(29).wrapping_add(11)).collect();

    let digest_salt = [0xd5u8; 32];
    let mut digest_value = vec![0u8; 32];
    HashAlg::Sha256.pbkdf2(&master_key, &digest_salt, ITERATIONS, &mut digest_value);

    let mut keyslots = serde_json::Map::new();
    for (index, slot) in slots.iter().enumerate() {
        let area_offset = AREA_BASE + index as u64 * AREA_SIZE;
        let salt = slot_salt(index);

        if !slot.argon2 {
            let mut area_key = vec![0u8; KEY_LEN];
            HashAlg::Sha256.pbkdf2(slot.passphrase, &salt, ITERATIONS, &mut area_key);

            let mut area = vec![0u8; AREA_SIZE as usize];
            af::split(HashAlg::Sha256, &master_key, STRIPES, &mut area[..KEY_LEN * STRIPES]);
            xts(&area_key).encrypt_area(&mut area, 512, 0, get_tweak_default);
            image[area_offset as usize..][..AREA_SIZE as usize].copy_from_slice(&area);
        }

        let kdf = if slot.argon2 {
            json!({
                "type": "argon2id", "time": 4, "memory": 235980, "cpus": 2,
                "salt": BASE64.encode(salt)
            })
        } else {
            json!({
                "type": "pbkdf2", "hash": "sha256", "iterations": ITERATIONS,
                "salt": BASE64.encode(salt)
            })
        };
        let mut object = json!({
            "type": "luks2",
            "key_size": KEY_LEN,
            "af": { "type": "luks1", "stripes": STRIPES, "hash": "sha256" },
            "area": {
                "type": "raw",
                "offset": area_offset.to_string(),
                "size": AREA_SIZE.to_string(),
                "encryption": "aes-xts-plain64",
                "key_size": KEY_LEN
            },
            "kdf": kdf
        });
        if let Some(priority) = slot.priority {
            object["priority"] = json!(priority);
        }
        keyslots.insert(index.to_string(), object);
    }

    let slot_refs: Vec<String> = (0..slots.len()).map(|index| index.to_string()).collect();
    let metadata = json!({
        "keyslots": keyslots,
        "segments": {
            "0": {
                "type": "crypt",
                "offset": SEGMENT_OFFSET.to_string(),
                "size": segment_size,
                "encryption": "aes-xts-plain64",
                "sector_size": SECTOR_SIZE
            }
        },
        "digests": {
            "0": {
                "type": "pbkdf2",
                "keyslots": slot_refs,
                "segments": ["0"],
                "hash": "sha256",
                "iterations": ITERATIONS,
                "salt": BASE64.encode(digest_salt),
                "digest": BASE64.encode(&digest_value)
            }
        },
        "config": { "json_size": (HDR_SIZE - 4096).to_string(), "keyslots_size": "98304" }
    })
    .to_string();

    write_bare_header(&mut image, HeaderCopy::Primary, 1, UUID);
    write_bare_header(&mut image, HeaderCopy::Secondary, 1, UUID);
    write_json(&mut image, HeaderCopy::Primary, &metadata);
    write_json(&mut image, HeaderCopy::Secondary, &metadata);

    // One recognizable payload sector encrypted under the master key
    let payload: Vec<u8> = (0..SECTOR_SIZE as usize).map(|i| (i % 241) as u8).collect();
    let mut encrypted = payload.clone();
    xts(&master_key).encrypt_area(&mut encrypted, SECTOR_SIZE as usize, 0, get_tweak_default);
    image[SEGMENT_OFFSET as usize..][..SECTOR_SIZE as usize].copy_from_slice(&encrypted);

    TestVolume {
        image,
        master_key,
        payload,
    }
}
