/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fs::OpenOptions, io, path::PathBuf};

use thiserror::Error;

use crate::{
    cli::{args::Cli, status},
    patch::trailer::{self, RepairOutcome},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open image for read-write: {0:?}")]
    Open(PathBuf, #[source] io::Error),
    #[error("Failed to repair image: {0:?}")]
    Repair(PathBuf, #[source] trailer::Error),
    #[error("Failed to sync writes: {0:?}")]
    Sync(PathBuf, #[source] io::Error),
}

impl Error {
    /// Stable exit code for this failure. Scripts match on these codes, so
    /// the mapping must not change between releases.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Open(..) => 4,
            Self::Repair(_, e) => e.exit_code(),
            Self::Sync(..) => 15,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

pub fn fix_main(cli: &Cli) -> Result<RepairOutcome> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cli.image)
        .map_err(|e| Error::Open(cli.image.clone(), e))?;

    let outcome =
        trailer::repair(&mut file).map_err(|e| Error::Repair(cli.image.clone(), e))?;

    if !matches!(outcome, RepairOutcome::AlreadyFixed) {
        file.sync_all()
            .map_err(|e| Error::Sync(cli.image.clone(), e))?;
    }

    match outcome {
        RepairOutcome::Appended {
            original_image_size,
        } => {
            status!("Appended signer marker and AVB footer; content ends at {original_image_size}");
        }
        RepairOutcome::Rewritten {
            original_image_size,
        } => {
            status!("Inserted signer marker and updated AVB footer; content ends at {original_image_size}");
        }
        RepairOutcome::AlreadyFixed => {
            status!("Signer marker already present; nothing to do");
        }
    }

    Ok(outcome)
}
