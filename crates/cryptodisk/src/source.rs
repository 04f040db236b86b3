// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Read abstractions for unlock sources
//!
//! Backends read from two kinds of sources: the device (or image) holding the
//! encrypted payload, and an optional detached header file. The device side
//! additionally advertises its size in native sectors so backends can compute
//! payload extents for "dynamic" sized volumes.

use std::io::{self, Read, Seek, SeekFrom};

/// Object-safe Read + Seek, used for detached header files
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// A seekable byte source with a known size in native sectors
pub trait BlockSource: Read + Seek {
    /// Device size in native sectors
    fn total_sectors(&self) -> u64;

    /// log2 of the native sector size
    fn log_sector_size(&self) -> u32 {
        9
    }
}

/// Adapter presenting any `Read + Seek` (a disk image file, an in-memory
/// cursor) as a [`BlockSource`] with 512-byte native sectors.
pub struct ImageSource<R> {
    inner: R,
    bytes: u64,
}

impl<R: Read + Seek> ImageSource<R> {
    /// Wrap a reader, determining its length with a seek to the end
    pub fn new(mut inner: R) -> io::Result<Self> {
        let bytes = inner.seek(SeekFrom::End(0))?;
        inner.rewind()?;
        Ok(Self { inner, bytes })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Read for ImageSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Read + Seek> Seek for ImageSource<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl<R: Read + Seek> BlockSource for ImageSource<R> {
    fn total_sectors(&self) -> u64 {
        self.bytes >> self.log_sector_size()
    }
}
