// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Binary header codec
//!
//! A LUKS2 device carries two redundant copies of a fixed 4096-byte binary
//! header: the primary at byte 0 and the secondary at `primary.hdr_size`.
//! Each copy is followed by its JSON metadata area, padding the header region
//! to `hdr_size` bytes. Multi-byte fields are big-endian.
//!
//! Header selection follows `cryptsetup`: the primary copy must validate for
//! the device to be considered LUKS2 at all; when both copies validate, the
//! one with the larger sequence id is used (primary on a tie).

use std::io::{Seek, SeekFrom};

use cryptodisk::ReadSeek;
use snafu::ResultExt;
use zerocopy::*;

use crate::{BadSignatureSnafu, Error, IoSnafu};

/// Length of the magic number field in bytes
pub const MAGIC_LEN: usize = 6;
/// Length of the label field in bytes
pub const LABEL_LEN: usize = 48;
/// Length of the checksum algorithm field in bytes
pub const CHECKSUM_ALG_LEN: usize = 32;
/// Length of the salt field in bytes
pub const SALT_LEN: usize = 64;
/// Length of the UUID field in bytes
pub const UUID_LEN: usize = 40;
/// Length of the checksum field in bytes
pub const CHECKSUM_LEN: usize = 64;

/// Size in bytes of one binary header copy
pub const HEADER_LEN: usize = 4096;

/// The only format version this codec accepts
pub const VERSION: u16 = 2;

/// LUKS2 on-disk header format
///
/// The header contains metadata about the encrypted volume including magic
/// number, version, sequence id and the extent of the JSON area that follows.
#[derive(FromBytes, Unaligned, Debug)]
#[repr(C, packed)]
pub struct Header {
    /// Magic number identifying LUKS2 format
    pub magic: [u8; MAGIC_LEN],
    /// LUKS format version
    pub version: U16<BigEndian>,
    /// Size of the header region (binary header plus JSON area) in bytes
    pub hdr_size: U64<BigEndian>,
    /// Header sequence ID for rewrite protection
    pub seqid: U64<BigEndian>,
    /// Volume label
    pub label: [u8; LABEL_LEN],
    /// Checksum algorithm identifier
    pub checksum_alg: [u8; CHECKSUM_ALG_LEN],
    /// Salt used for checksum
    pub salt: [u8; SALT_LEN],
    /// Volume UUID
    pub uuid: [u8; UUID_LEN],
    /// Subsystem label
    pub subsystem: [u8; LABEL_LEN],
    /// Byte offset of this header copy within the device
    pub hdr_offset: U64<BigEndian>,
    /// Padding bytes
    pub padding: [u8; 184],
    /// Header checksum
    pub csum: [u8; CHECKSUM_LEN],
    /// Additional padding to 4096 bytes
    pub padding4096: [u8; 7 * 512],
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_LEN);

/// Magic number constants for LUKS2 format identification
struct Magic;

// The secondary copy reverses the letters. Guess BigEndian came later?
impl Magic {
    const PRIMARY: [u8; MAGIC_LEN] = [b'L', b'U', b'K', b'S', 0xba, 0xbe];
    const SECONDARY: [u8; MAGIC_LEN] = [b'S', b'K', b'U', b'L', 0xba, 0xbe];
}

/// Which of the two redundant header copies is meant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCopy {
    Primary,
    Secondary,
}

impl std::fmt::Display for HeaderCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderCopy::Primary => f.write_str("primary"),
            HeaderCopy::Secondary => f.write_str("secondary"),
        }
    }
}

impl Header {
    /// Get the UUID of the LUKS2 volume
    ///
    /// Note: LUKS2 stores string UUID rather than 128-bit sequence
    pub fn uuid(&self) -> Result<String, Error> {
        Ok(str::from_utf8(&self.uuid)?.trim_end_matches('\0').to_owned())
    }

    /// Get the label of the LUKS2 volume
    ///
    /// Note: Label is often empty, set in config instead
    pub fn label(&self) -> Result<String, Error> {
        Ok(str::from_utf8(&self.label)?.trim_end_matches('\0').to_owned())
    }
}

fn read_copy(reader: &mut dyn ReadSeek, offset: u64) -> Result<Header, Error> {
    reader.seek(SeekFrom::Start(offset)).context(IoSnafu)?;
    Header::read_from_io(&mut *reader).context(IoSnafu)
}

fn validate(header: &Header, copy: HeaderCopy) -> Result<(), Error> {
    let magic = match copy {
        HeaderCopy::Primary => Magic::PRIMARY,
        HeaderCopy::Secondary => Magic::SECONDARY,
    };
    if header.magic != magic || header.version.get() != VERSION {
        return BadSignatureSnafu { copy }.fail();
    }
    Ok(())
}

/// Read both header copies and return the one to use
///
/// When a detached header file is supplied, all header reads go to it instead
/// of the device. The primary copy must validate; a device whose primary copy
/// is damaged is not unlockable even if the secondary is intact.
pub fn read_header(source: &mut dyn ReadSeek, hdr_file: &mut Option<&mut dyn ReadSeek>) -> Result<Header, Error> {
    let mut taken = hdr_file.take();
    let reader = match taken.as_deref_mut() {
        Some(file) => file,
        None => source,
    };

    let result = read_header_from(reader);
    *hdr_file = taken;
    result
}

fn read_header_from(reader: &mut dyn ReadSeek) -> Result<Header, Error> {
    let primary = read_copy(reader, 0)?;
    validate(&primary, HeaderCopy::Primary)?;

    let secondary = read_copy(reader, primary.hdr_size.get())?;
    validate(&secondary, HeaderCopy::Secondary)?;

    if secondary.seqid.get() > primary.seqid.get() {
        log::trace!("using secondary header, seqid {}", secondary.seqid.get());
        Ok(secondary)
    } else {
        Ok(primary)
    }
}
