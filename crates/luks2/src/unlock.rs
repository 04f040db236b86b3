// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Unlock orchestration
//!
//! [`recover_key`] drives the whole attempt: read and select a binary header,
//! decode the JSON area, then try each keyslot in ascending index order. A
//! keyslot trial derives the area key from the passphrase, decrypts the
//! keyslot's key area, merges the anti-forensic stripes into a candidate
//! master key and verifies it against the digest. The first verified slot
//! wins; its segment decides the sector layout and cipher installed into the
//! target [`CryptoDisk`].
//!
//! Per-slot failures (unsupported KDF, malformed objects, mismatching
//! digests) only skip that slot. Failures before the trial loop abort the
//! attempt.

use std::io::{Read, Seek, SeekFrom};

use cryptodisk::{BlockSource, CryptoDisk, ReadSeek};
use snafu::{OptionExt, ResultExt};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::af;
use crate::hash::HashAlg;
use crate::header::{self, HEADER_LEN};
use crate::metadata::{Digest, Kdf, Keyslot, Metadata, Segment, SegmentSize};
use crate::resolve;
use crate::{
    AccessDeniedSnafu, Argon2UnsupportedSnafu, Base64Snafu, CipherSnafu, DigestMismatchSnafu, Error,
    InvalidMetadataSnafu, IoSnafu, UnknownHashSnafu,
};

/// Keyslot areas are always encrypted with 512-byte sectors, regardless of
/// the payload segment's sector size.
const AREA_LOG_SECTOR_SIZE: u32 = 9;

fn read_exact_at(reader: &mut dyn ReadSeek, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
    reader.seek(SeekFrom::Start(offset)).context(IoSnafu)?;
    reader.read_exact(buf).context(IoSnafu)
}

fn decode_base64(what: &'static str, input: &str) -> Result<Zeroizing<Vec<u8>>, Error> {
    use base64::Engine;

    base64::engine::general_purpose::STANDARD
        .decode(input)
        .map(Zeroizing::new)
        .context(Base64Snafu { what })
}

fn split_encryption(encryption: &str) -> Result<(&str, &str), Error> {
    encryption
        .split_once('-')
        .context(InvalidMetadataSnafu { what: "invalid encryption" })
}

fn checked_len(what: &'static str, value: i64) -> Result<usize, Error> {
    usize::try_from(value)
        .ok()
        .filter(|len| *len > 0)
        .with_context(|| InvalidMetadataSnafu {
            what: format!("invalid {what} {value}"),
        })
}

/// Derive the area key from the passphrase, decrypt this keyslot's key area
/// and merge the anti-forensic stripes into a candidate master key
fn decrypt_key(
    source: &mut dyn ReadSeek,
    crypt: &mut CryptoDisk,
    hdr_file: &mut Option<&mut dyn ReadSeek>,
    keyslot: &Keyslot,
    passphrase: &[u8],
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let salt = decode_base64("keyslot salt", keyslot.kdf.salt())?;

    let mut area_key = Zeroizing::new(vec![0u8; checked_len("area key size", keyslot.area.key_size)?]);
    match &keyslot.kdf {
        Kdf::Argon2 { .. } => return Argon2UnsupportedSnafu.fail(),
        Kdf::Pbkdf2 { hash, iterations, .. } => {
            let hash = HashAlg::by_name(hash).context(UnknownHashSnafu { name: hash.clone() })?;
            let iterations = u32::try_from(*iterations).map_err(|_| Error::InvalidMetadata {
                what: format!("invalid iteration count {iterations}"),
            })?;
            hash.pbkdf2(passphrase, &salt, iterations, &mut area_key);
        }
    }

    let (cipher, mode) = split_encryption(&keyslot.area.encryption)?;
    crypt.set_cipher(cipher, mode).context(CipherSnafu)?;
    crypt.set_key(&area_key).context(CipherSnafu)?;

    let area_size = usize::try_from(keyslot.area.size).map_err(|_| Error::InvalidMetadata {
        what: format!("invalid area size {}", keyslot.area.size),
    })?;
    let mut split_key = Zeroizing::new(vec![0u8; area_size]);
    let reader = match hdr_file {
        Some(file) => &mut **file,
        None => source,
    };
    read_exact_at(reader, keyslot.area.offset, &mut split_key)?;

    crypt
        .decrypt(&mut split_key, 0, AREA_LOG_SECTOR_SIZE)
        .context(CipherSnafu)?;

    let af_hash = HashAlg::by_name(&keyslot.af.hash).context(UnknownHashSnafu {
        name: keyslot.af.hash.clone(),
    })?;

    let mut candidate = Zeroizing::new(vec![0u8; checked_len("key size", keyslot.key_size)?]);
    let stripes = checked_len("stripe count", keyslot.af.stripes)?;
    af::merge(af_hash, &split_key, candidate.len(), stripes, &mut candidate)?;

    log::debug!("candidate key recovered");
    Ok(candidate)
}

/// Check a candidate master key against the stored PBKDF2 digest
fn verify_key(digest: &Digest, candidate: &[u8]) -> Result<(), Error> {
    use subtle::ConstantTimeEq;

    let stored = decode_base64("digest", &digest.digest)?;
    let salt = decode_base64("digest salt", &digest.salt)?;
    let hash = HashAlg::by_name(&digest.hash).context(UnknownHashSnafu {
        name: digest.hash.clone(),
    })?;
    let iterations = u32::try_from(digest.iterations).map_err(|_| Error::InvalidMetadata {
        what: format!("invalid iteration count {}", digest.iterations),
    })?;

    let mut computed = Zeroizing::new(vec![0u8; stored.len()]);
    hash.pbkdf2(candidate, &salt, iterations, &mut computed);

    if bool::from(computed.as_slice().ct_eq(stored.as_slice())) {
        Ok(())
    } else {
        DigestMismatchSnafu.fail()
    }
}

/// Install the payload sector layout described by `segment`
///
/// "dynamic" extents run from the segment offset to the end of the source
/// device, converted from source sectors into the segment's own sector size.
fn apply_segment_layout<S: BlockSource>(crypt: &mut CryptoDisk, segment: &Segment, source: &S) -> Result<(), Error> {
    let sector_size = u64::try_from(segment.sector_size)
        .ok()
        .filter(|size| size.is_power_of_two())
        .with_context(|| InvalidMetadataSnafu {
            what: format!("invalid sector size {}", segment.sector_size),
        })?;
    let log_sector_size = sector_size.ilog2();

    crypt.offset_sectors = segment.offset / sector_size;
    crypt.log_sector_size = log_sector_size;
    crypt.total_sectors = match segment.size {
        SegmentSize::Dynamic => {
            let shift = log_sector_size
                .checked_sub(source.log_sector_size())
                .context(InvalidMetadataSnafu {
                    what: "sector size below source sector size",
                })?;
            (source.total_sectors() >> shift)
                .checked_sub(crypt.offset_sectors)
                .context(InvalidMetadataSnafu {
                    what: "segment offset past end of device",
                })?
        }
        SegmentSize::Bytes(bytes) => bytes >> log_sector_size,
    };
    Ok(())
}

/// Recover the master key for the volume on `source` and install it
///
/// The secret is tried against every keyslot in ascending index order;
/// keyslots this build cannot use are skipped. On success the opened slot's
/// position is returned and `crypt` holds the payload cipher, master key and
/// sector layout. On failure no key material is left in `crypt`.
///
/// A detached header file, when given, supplies the binary headers, JSON
/// area and keyslot areas; only the payload stays on `source`.
pub fn recover_key<S: BlockSource>(
    source: &mut S,
    crypt: &mut CryptoDisk,
    mut hdr_file: Option<&mut dyn ReadSeek>,
    passphrase: &[u8],
) -> Result<usize, Error> {
    let header = header::read_header(source, &mut hdr_file)?;

    let json_len = header
        .hdr_size
        .get()
        .checked_sub(HEADER_LEN as u64)
        .context(InvalidMetadataSnafu {
            what: "header size smaller than binary header",
        })?;
    let mut json_region = vec![0u8; json_len as usize];
    {
        let reader: &mut dyn ReadSeek = match hdr_file.as_deref_mut() {
            Some(file) => file,
            None => source,
        };
        read_exact_at(reader, header.hdr_offset.get() + HEADER_LEN as u64, &mut json_region)?;
    }
    let metadata = Metadata::from_json_region(&json_region)?;

    let mut opened = None;
    for position in 0..metadata.keyslots.len() {
        let resolved = match resolve::get_keyslot(&metadata, position) {
            Ok(resolved) => resolved,
            Err(err) => {
                // Unusable keyslots (new KDF types and the like) must not
                // prevent the remaining slots from being tried.
                log::debug!("failed to get keyslot {position}: {err}");
                continue;
            }
        };

        if resolved.keyslot.priority == 0 {
            log::debug!("ignoring keyslot {position} due to priority");
            continue;
        }

        log::debug!("trying keyslot {position}");

        if let Err(err) = apply_segment_layout(crypt, &resolved.segment, source) {
            log::debug!("bad segment for keyslot {position}: {err}");
            continue;
        }

        let candidate = match decrypt_key(source, crypt, &mut hdr_file, &resolved.keyslot, passphrase) {
            Ok(candidate) => candidate,
            Err(err) => {
                log::debug!("decryption with keyslot {position} failed: {err}");
                continue;
            }
        };

        if let Err(err) = verify_key(&resolved.digest, &candidate) {
            log::debug!("could not open keyslot {position}: {err}");
            continue;
        }

        log::info!("Slot {position} opened");
        opened = Some((position, candidate, resolved.segment));
        break;
    }

    let Some((position, master_key, segment)) = opened else {
        crypt.clear_cipher();
        return AccessDeniedSnafu.fail();
    };

    install_payload_cipher(crypt, &segment, &master_key).inspect_err(|_| crypt.clear_cipher())?;
    Ok(position)
}

fn install_payload_cipher(crypt: &mut CryptoDisk, segment: &Segment, master_key: &[u8]) -> Result<(), Error> {
    let (cipher, mode) = split_encryption(&segment.encryption)?;
    crypt.set_cipher(cipher, mode).context(CipherSnafu)?;
    crypt.set_key(master_key).context(CipherSnafu)
}

/// Header-only probe advertising the volume UUID without unlocking
///
/// Returns a fresh [`CryptoDisk`] tagged for this backend, or `None` when
/// the device does not carry a usable LUKS2 header or the UUID filter does
/// not match. Probe failures are swallowed; probing foreign disks is routine.
pub fn scan<S: BlockSource>(
    source: &mut S,
    check_uuid: Option<&str>,
    check_boot: bool,
    mut hdr_file: Option<&mut dyn ReadSeek>,
) -> Option<CryptoDisk> {
    // This backend never supplies boot-volume hints
    if check_boot {
        return None;
    }

    let header = header::read_header(source, &mut hdr_file).ok()?;
    let uuid = header.uuid().ok()?;

    if let Some(expected) = check_uuid {
        if !uuid_matches(expected, &uuid) {
            return None;
        }
    }

    Some(CryptoDisk::new("luks2", uuid))
}

/// LUKS2 stores the UUID as text; compare case-insensitively, canonically
/// where both sides parse as UUIDs.
fn uuid_matches(expected: &str, found: &str) -> bool {
    match (Uuid::parse_str(expected), Uuid::parse_str(found)) {
        (Ok(expected), Ok(found)) => expected == found,
        _ => expected.eq_ignore_ascii_case(found),
    }
}
