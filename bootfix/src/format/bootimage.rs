// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read};

use thiserror::Error;
use zerocopy::{FromBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::stream::FromReader;

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";

/// The only header revision the signing tool understands.
pub const SUPPORTED_HEADER_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 8]),
    #[error("Unsupported header version: {0}")]
    UnsupportedHeaderVersion(u32),
    #[error("Failed to read boot image data: {0}")]
    DataRead(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the header fields up to and including
/// `header_version`. The full header is much longer, but nothing past the
/// version field is ever inspected or modified here.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawPrefix {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    magic: [u8; 8],
    /// Size and address fields for the kernel, ramdisk, second stage
    /// bootloader, and tags, followed by the page size. All opaque payload
    /// metadata as far as trailer repair is concerned.
    _opaque: [little_endian::U32; 8],
    header_version: little_endian::U32,
}

/// The subset of the boot image header that trailer repair inspects. The
/// header is validated for its magic and version only; payload metadata is
/// never interpreted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderPrefix {
    pub header_version: u32,
}

impl<R: Read> FromReader<R> for HeaderPrefix {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let raw = RawPrefix::read_from_io(&mut reader)
            .map_err(|e| Error::DataRead("Boot::header", e))?;

        if raw.magic != BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw.magic));
        }

        let header_version = raw.header_version.get();
        if header_version != SUPPORTED_HEADER_VERSION {
            return Err(Error::UnsupportedHeaderVersion(header_version));
        }

        Ok(Self { header_version })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn raw_header(magic: &[u8; 8], version: u32) -> Vec<u8> {
        let mut data = vec![0u8; 44];
        data[..8].copy_from_slice(magic);
        data[40..44].copy_from_slice(&version.to_le_bytes());
        data
    }

    #[test]
    fn valid_header() {
        let data = raw_header(&BOOT_MAGIC, 1);
        let header = HeaderPrefix::from_reader(Cursor::new(data)).unwrap();
        assert_eq!(header.header_version, 1);
    }

    #[test]
    fn bad_magic() {
        let data = raw_header(b"VNDRBOOT", 1);
        let err = HeaderPrefix::from_reader(Cursor::new(data)).unwrap_err();
        assert_matches!(err, Error::UnknownMagic(_));
    }

    #[test]
    fn unsupported_version() {
        for version in [0, 2, 3, u32::MAX] {
            let data = raw_header(&BOOT_MAGIC, version);
            let err = HeaderPrefix::from_reader(Cursor::new(data)).unwrap_err();
            assert_matches!(err, Error::UnsupportedHeaderVersion(v) if v == version);
        }
    }

    #[test]
    fn truncated_header() {
        let err = HeaderPrefix::from_reader(Cursor::new(&BOOT_MAGIC)).unwrap_err();
        assert_matches!(err, Error::DataRead("Boot::header", _));
    }
}
