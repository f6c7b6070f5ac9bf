// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use bstr::ByteSlice;
use thiserror::Error;
use tracing::debug;

use crate::{
    format::{
        avb::{self, Footer},
        bootimage::{self, HeaderPrefix},
        signer,
    },
    stream::{FromReader, ReadFixedSizeExt, SetLen, ToWriter, WriteZerosExt},
    util::{self, NumBytes},
};

/// Fixed size of the boot and recovery partitions. An image that does not
/// span the partition exactly is not accepted by the signing tool.
pub const PARTITION_SIZE: u64 = 64 * 1024 * 1024;

/// Tag some builds append directly after the image content. When present, it
/// must stay in place in front of the signer marker block.
const SEANDROID_MAGIC: [u8; 16] = *b"SEANDROIDENFORCE";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image size {0} exceeds partition size {PARTITION_SIZE}")]
    ImageTooLarge(u64),
    #[error("Image with footer must span the full partition: {0} != {PARTITION_SIZE}")]
    SizeMismatch(u64),
    #[error("Unsupported AVB footer version: {0}.{1}")]
    UnsupportedFooterVersion(u32, u32),
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("Cannot reclaim {excess} trailing bytes: data is not zero padding")]
    InsufficientSpace { excess: u64 },
    #[error("Only {available} bytes free before the footer; marker block needs {}", signer::BLOCK_SIZE)]
    InsufficientTrailerSpace { available: u64 },
    #[error("Unexpected data after image content at offset {offset}: {data:?}", data = .bytes.as_bstr())]
    UnexpectedTrailingData { offset: u64, bytes: Vec<u8> },
    #[error("Repaired image size {0} does not match partition size {PARTITION_SIZE}")]
    SizeInvariantViolated(u64),
    #[error("AVB error")]
    Avb(#[from] avb::Error),
    #[error("Boot image error")]
    BootImage(#[from] bootimage::Error),
    #[error("Failed to read image data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write image data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

impl Error {
    /// Stable exit code for this failure. Scripts match on these codes, so
    /// the mapping must not change between releases.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ImageTooLarge(_) => 5,
            Self::SizeMismatch(_) => 10,
            Self::UnsupportedFooterVersion(..) => 11,
            Self::FieldOutOfBounds(_) => 12,
            Self::InsufficientSpace { .. } => 9,
            Self::InsufficientTrailerSpace { .. } => 13,
            Self::UnexpectedTrailingData { .. } => 14,
            Self::SizeInvariantViolated(_) => 16,
            Self::Avb(_) => 8,
            Self::BootImage(e) => match e {
                bootimage::Error::UnknownMagic(_) => 6,
                bootimage::Error::UnsupportedHeaderVersion(_) => 7,
                bootimage::Error::DataRead(..) => 8,
            },
            Self::DataRead(..) => 8,
            Self::DataWrite(..) => 15,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Outcome of a successful repair pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RepairOutcome {
    /// No footer was present. The signer marker block and a fresh footer
    /// were appended.
    Appended { original_image_size: u64 },
    /// A footer was present without the marker. The marker block was
    /// inserted and the footer rewritten to account for it.
    Rewritten { original_image_size: u64 },
    /// The marker is already in place. Nothing was written.
    AlreadyFixed,
}

impl RepairOutcome {
    /// Stable exit code for this outcome. A run that wrote nothing is
    /// distinguishable from a repair.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Appended { .. } | Self::Rewritten { .. } => 0,
            Self::AlreadyFixed => 3,
        }
    }
}

/// Validate the boot image in `file` and append or complete the trailer
/// (signer marker block + AVB footer) expected by the signing tool. Every
/// validation runs before the first write, so a rejected image is left
/// byte-for-byte untouched.
pub fn repair(mut file: impl Read + Write + Seek + SetLen) -> Result<RepairOutcome> {
    let image_size = file
        .seek(SeekFrom::End(0))
        .map_err(|e| Error::DataRead("image_size", e))?;

    if image_size > PARTITION_SIZE {
        return Err(Error::ImageTooLarge(image_size));
    }

    file.rewind().map_err(|e| Error::DataRead("header", e))?;
    let header = HeaderPrefix::from_reader(&mut file)?;
    debug!("Validated boot image header: {header:?}");

    match read_footer(&mut file, image_size)? {
        Some(footer) => {
            debug!("Found existing AVB footer: {footer:?}");
            complete_trailer(file, image_size, footer)
        }
        None => {
            debug!("No AVB footer present");
            append_trailer(file, image_size)
        }
    }
}

/// Try to parse a footer from the last 64 bytes of the image. A missing or
/// mismatched magic means the image carries no footer; only I/O failures are
/// fatal here.
fn read_footer(mut file: impl Read + Seek, image_size: u64) -> Result<Option<Footer>> {
    if image_size < Footer::SIZE as u64 {
        return Ok(None);
    }

    file.seek(SeekFrom::End(-(Footer::SIZE as i64)))
        .map_err(|e| Error::DataRead("footer", e))?;

    match Footer::from_reader(&mut file) {
        Ok(f) => Ok(Some(f)),
        Err(e @ avb::Error::Io(_)) => Err(e.into()),
        Err(_) => Ok(None),
    }
}

/// Repair an image that carries no footer at all: reclaim trailing zero
/// padding if the trailer would not fit, then append the marker block, zero
/// fill, and a fresh footer.
fn append_trailer(
    mut file: impl Read + Write + Seek + SetLen,
    image_size: u64,
) -> Result<RepairOutcome> {
    let trailer_size = (signer::BLOCK_SIZE + Footer::SIZE) as u64;
    let mut content_size = image_size;

    // Since image_size <= PARTITION_SIZE, the excess never exceeds the
    // trailer size itself.
    let new_total = image_size + trailer_size;
    if new_total > PARTITION_SIZE {
        let excess = new_total - PARTITION_SIZE;

        file.seek(SeekFrom::End(-(excess as i64)))
            .map_err(|e| Error::DataRead("trailing_padding", e))?;
        let tail = file
            .read_vec_exact(excess as usize)
            .map_err(|e| Error::DataRead("trailing_padding", e))?;

        if !util::is_zero(&tail) {
            return Err(Error::InsufficientSpace { excess });
        }

        debug!("Reclaiming {:?} of trailing zero padding", NumBytes(excess));

        content_size = image_size - excess;
        file.set_len(content_size)
            .map_err(|e| Error::DataWrite("truncate", e))?;
    }

    file.seek(SeekFrom::Start(content_size))
        .map_err(|e| Error::DataWrite("signer_block", e))?;
    file.write_all(&signer::build_block())
        .map_err(|e| Error::DataWrite("signer_block", e))?;

    let original_image_size = content_size + signer::BLOCK_SIZE as u64;
    let footer_offset = PARTITION_SIZE - Footer::SIZE as u64;

    file.write_zeros_exact(footer_offset - original_image_size)
        .map_err(|e| Error::DataWrite("zero_fill", e))?;

    write_footer(&mut file, &Footer::new(original_image_size))?;

    check_final_size(&mut file)?;

    Ok(RepairOutcome::Appended {
        original_image_size,
    })
}

/// Repair an image that already carries a footer: verify it, and insert the
/// marker block at the recorded content end unless it is already there.
fn complete_trailer(
    mut file: impl Read + Write + Seek,
    image_size: u64,
    mut footer: Footer,
) -> Result<RepairOutcome> {
    if image_size != PARTITION_SIZE {
        return Err(Error::SizeMismatch(image_size));
    }

    if (footer.version_major, footer.version_minor)
        != (avb::FOOTER_VERSION_MAJOR, avb::FOOTER_VERSION_MINOR)
    {
        return Err(Error::UnsupportedFooterVersion(
            footer.version_major,
            footer.version_minor,
        ));
    }

    let footer_offset = PARTITION_SIZE - Footer::SIZE as u64;

    // A content end that leaves no room for even one marker block in front
    // of it, or that sits inside the footer, cannot be meaningful for this
    // partition layout.
    if footer.original_image_size < signer::BLOCK_SIZE as u64
        || footer.original_image_size > footer_offset
    {
        return Err(Error::FieldOutOfBounds("original_image_size"));
    }

    // A marker directly in front of the recorded content end means a
    // previous run already processed this image.
    let probe_offset = footer.original_image_size - signer::BLOCK_SIZE as u64;
    file.seek(SeekFrom::Start(probe_offset))
        .map_err(|e| Error::DataRead("signer_probe", e))?;
    let probe = file
        .read_array_exact::<{ signer::SIGNER_MAGIC.len() }>()
        .map_err(|e| Error::DataRead("signer_probe", e))?;

    if probe == signer::SIGNER_MAGIC {
        debug!("Signer marker already present at {probe_offset}");
        return Ok(RepairOutcome::AlreadyFixed);
    }

    let mut content_end = footer.original_image_size;

    file.seek(SeekFrom::Start(content_end))
        .map_err(|e| Error::DataRead("seandroid_tag", e))?;
    let tag = file
        .read_array_exact::<{ SEANDROID_MAGIC.len() }>()
        .map_err(|e| Error::DataRead("seandroid_tag", e))?;

    if tag == SEANDROID_MAGIC {
        debug!("Preserving SEANDROIDENFORCE tag");
        content_end += SEANDROID_MAGIC.len() as u64;
    }

    let available = footer_offset
        .checked_sub(content_end)
        .ok_or(Error::FieldOutOfBounds("original_image_size"))?;
    if available < signer::BLOCK_SIZE as u64 {
        return Err(Error::InsufficientTrailerSpace { available });
    }

    check_zero_region(&mut file, content_end, footer_offset)?;

    file.seek(SeekFrom::Start(content_end))
        .map_err(|e| Error::DataWrite("signer_block", e))?;
    file.write_all(&signer::build_block())
        .map_err(|e| Error::DataWrite("signer_block", e))?;

    footer.original_image_size = content_end + signer::BLOCK_SIZE as u64;

    file.seek(SeekFrom::Start(footer_offset))
        .map_err(|e| Error::DataWrite("footer", e))?;
    write_footer(&mut file, &footer)?;

    check_final_size(&mut file)?;

    Ok(RepairOutcome::Rewritten {
        original_image_size: footer.original_image_size,
    })
}

/// Verify that every byte in `[start, end)` is zero. Non-zero bytes there
/// are foreign data that must never be overwritten.
fn check_zero_region(mut file: impl Read + Seek, start: u64, end: u64) -> Result<()> {
    file.seek(SeekFrom::Start(start))
        .map_err(|e| Error::DataRead("trailer_region", e))?;

    let mut buf = [0u8; 16384];
    let mut offset = start;

    while offset < end {
        let to_read = (end - offset).min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..to_read])
            .map_err(|e| Error::DataRead("trailer_region", e))?;

        if let Some(pos) = buf[..to_read].iter().position(|b| *b != 0) {
            let window_end = to_read.min(pos + 16);

            return Err(Error::UnexpectedTrailingData {
                offset: offset + pos as u64,
                bytes: buf[pos..window_end].to_vec(),
            });
        }

        offset += to_read as u64;
    }

    Ok(())
}

/// Serialize `footer` and write it at the current position.
fn write_footer(mut file: impl Write, footer: &Footer) -> Result<()> {
    let mut buf = Cursor::new(Vec::with_capacity(Footer::SIZE));
    footer.to_writer(&mut buf)?;

    file.write_all(buf.get_ref())
        .map_err(|e| Error::DataWrite("footer", e))?;

    Ok(())
}

/// Verify that the stream still spans the partition exactly.
fn check_final_size(mut file: impl Seek) -> Result<()> {
    let final_size = file
        .seek(SeekFrom::End(0))
        .map_err(|e| Error::DataRead("final_size", e))?;

    if final_size != PARTITION_SIZE {
        return Err(Error::SizeInvariantViolated(final_size));
    }

    Ok(())
}
