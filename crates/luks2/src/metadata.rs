// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! JSON metadata decoding
//!
//! The JSON area behind each binary header describes the volume as three
//! collections of numbered objects: `keyslots`, `segments` and `digests`,
//! each keyed by stringified integers. A digest commits to the master key
//! and cross-references the keyslots that can produce it and the segments
//! it unlocks.
//!
//! The top level is decoded eagerly but individual objects are only decoded
//! on demand: a keyslot this build cannot interpret (say, a new KDF type)
//! must not prevent the other keyslots from being tried.
//!
//! Quantities that may exceed 2^53 are written as decimal strings by
//! `cryptsetup`; the decoders here accept both string and integer forms.

use std::collections::BTreeMap;

use serde::de::{self, SeqAccess, Unexpected, Visitor};
use serde::{Deserialize, Deserializer};
use snafu::{OptionExt, ResultExt};

use crate::{Error, InvalidJsonSnafu, UnterminatedJsonSnafu};

/// Top-level LUKS2 metadata, with member objects left undecoded
///
/// Iteration order of the maps is ascending by index, which for metadata
/// written by `cryptsetup` matches document order. `tokens` and `config`
/// are not consumed by the unlock path and are ignored.
#[derive(Debug, Deserialize)]
pub struct Metadata {
    pub keyslots: BTreeMap<u32, serde_json::Value>,
    pub segments: BTreeMap<u32, serde_json::Value>,
    pub digests: BTreeMap<u32, serde_json::Value>,
}

impl Metadata {
    /// Decode the JSON area of a header region
    ///
    /// The JSON text is NUL-terminated within its allotted region; a missing
    /// terminator means the header region is truncated or corrupt.
    pub fn from_json_region(region: &[u8]) -> Result<Self, Error> {
        let nul = region.iter().position(|&b| b == 0).context(UnterminatedJsonSnafu)?;
        serde_json::from_slice(&region[..nul]).context(InvalidJsonSnafu)
    }
}

/// One keyslot: everything needed to turn a passphrase into a candidate
/// master key
#[derive(Debug, Deserialize)]
pub struct Keyslot {
    #[serde(rename = "type")]
    pub slot_type: KeyslotType,
    /// Bytes of master key this slot produces
    pub key_size: i64,
    /// Slots with priority 0 are ignored during automatic trials
    #[serde(default = "default_priority")]
    pub priority: i64,
    pub area: Area,
    pub kdf: Kdf,
    pub af: Af,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum KeyslotType {
    #[serde(rename = "luks2")]
    Luks2,
}

fn default_priority() -> i64 {
    1
}

/// Location and encryption of a keyslot's split key material
#[derive(Debug, Deserialize)]
pub struct Area {
    #[serde(rename = "type")]
    pub area_type: AreaType,
    #[serde(deserialize_with = "u64_lenient")]
    pub offset: u64,
    #[serde(deserialize_with = "u64_lenient")]
    pub size: u64,
    /// Cipher and mode specifier, e.g. "aes-xts-plain64"
    pub encryption: String,
    /// Bytes of area key derived by the KDF
    pub key_size: i64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum AreaType {
    #[serde(rename = "raw")]
    Raw,
}

/// Anti-forensic splitter parameters
#[derive(Debug, Deserialize)]
pub struct Af {
    #[serde(rename = "type")]
    pub af_type: AfType,
    pub stripes: i64,
    pub hash: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum AfType {
    #[serde(rename = "luks1")]
    Luks1,
}

/// Key derivation function parameters
///
/// Argon2 slots are decoded so the trial loop can recognize and skip them;
/// this implementation only derives keys with PBKDF2.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Kdf {
    #[serde(rename = "pbkdf2")]
    Pbkdf2 {
        salt: String,
        hash: String,
        iterations: i64,
    },
    #[serde(rename = "argon2i", alias = "argon2id")]
    Argon2 {
        salt: String,
        time: i64,
        memory: i64,
        cpus: i64,
    },
}

impl Kdf {
    /// The base64 KDF salt, common to all variants
    pub fn salt(&self) -> &str {
        match self {
            Kdf::Pbkdf2 { salt, .. } => salt,
            Kdf::Argon2 { salt, .. } => salt,
        }
    }
}

/// One region of encrypted payload on the device
#[derive(Debug, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub segment_type: SegmentType,
    #[serde(deserialize_with = "u64_lenient")]
    pub offset: u64,
    pub size: SegmentSize,
    pub encryption: String,
    /// Power of two, typically 512 or 4096
    pub sector_size: i64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    #[serde(rename = "crypt")]
    Crypt,
}

/// Payload extent: everything to the end of the device, or a byte count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentSize {
    Dynamic,
    Bytes(u64),
}

impl<'de> Deserialize<'de> for SegmentSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text == "dynamic" {
            return Ok(SegmentSize::Dynamic);
        }
        text.parse()
            .map(SegmentSize::Bytes)
            .map_err(|_| de::Error::invalid_value(Unexpected::Str(&text), &"\"dynamic\" or a decimal byte count"))
    }
}

/// PBKDF2 commitment to the master key
#[derive(Debug, Deserialize)]
pub struct Digest {
    #[serde(rename = "type")]
    pub digest_type: DigestType,
    /// Keyslots able to produce the committed key
    pub keyslots: IndexSet,
    /// Segments unlocked by the committed key
    pub segments: IndexSet,
    pub salt: String,
    pub digest: String,
    pub hash: String,
    pub iterations: i64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DigestType {
    #[serde(rename = "pbkdf2")]
    Pbkdf2,
}

/// A set of object indices stored as a 64-bit bitmap
///
/// LUKS2 encodes cross references as arrays of stringified integers. Indices
/// past 63 cannot be represented and are treated as absent rather than
/// rejected; a reference to such an index simply never matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSet(u64);

impl IndexSet {
    pub fn contains(self, index: u32) -> bool {
        index < u64::BITS && self.0 & (1 << index) != 0
    }

    pub fn insert(&mut self, index: u64) {
        if index < u64::BITS as u64 {
            self.0 |= 1 << index;
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl<'de> Deserialize<'de> for IndexSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IndexSetVisitor;

        impl<'de> Visitor<'de> for IndexSetVisitor {
            type Value = IndexSet;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("an array of object indices")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut set = IndexSet::default();
                while let Some(LenientU64(index)) = seq.next_element()? {
                    set.insert(index);
                }
                Ok(set)
            }
        }

        deserializer.deserialize_seq(IndexSetVisitor)
    }
}

/// A u64 accepting both JSON number and decimal string forms
struct LenientU64(u64);

impl<'de> Deserialize<'de> for LenientU64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LenientU64Visitor;

        impl Visitor<'_> for LenientU64Visitor {
            type Value = LenientU64;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("an unsigned integer, numeric or stringified")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(LenientU64(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                u64::try_from(value)
                    .map(LenientU64)
                    .map_err(|_| E::invalid_value(Unexpected::Signed(value), &self))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value
                    .parse()
                    .map(LenientU64)
                    .map_err(|_| E::invalid_value(Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_any(LenientU64Visitor)
    }
}

fn u64_lenient<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(LenientU64::deserialize(deserializer)?.0)
}
