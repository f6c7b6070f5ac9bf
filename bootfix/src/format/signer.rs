// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

/// Tag the signing tool looks for immediately before the AVB footer.
pub const SIGNER_MAGIC: [u8; 11] = *b"SignerVer02";

/// Total size of the marker block: the tag followed by zero padding.
pub const BLOCK_SIZE: usize = 512;

/// Build the full marker block. The padding bytes must stay zero; the
/// signing tool rejects anything else after the tag.
pub fn build_block() -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[..SIGNER_MAGIC.len()].copy_from_slice(&SIGNER_MAGIC);
    block
}
