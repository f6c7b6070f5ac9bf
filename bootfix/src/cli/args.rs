/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use clap::Parser;
use tracing::Level;

use crate::{cli::fix, patch::trailer::RepairOutcome};

/// Repair a boot or recovery image so the signing tool accepts it.
///
/// The image is patched in place: a SignerVer02 marker block and an AVB
/// footer are appended (or completed) so the image spans the 64 MiB
/// partition exactly.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the boot or recovery image to repair in place.
    #[arg(value_name = "IMAGE", value_parser)]
    pub image: PathBuf,

    /// Lowest log message severity to output.
    #[arg(long, value_name = "LEVEL", default_value_t = Level::WARN)]
    pub log_level: Level,
}

fn init_logging(level: Level) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

pub fn main(logging_initialized: &AtomicBool) -> Result<RepairOutcome, fix::Error> {
    let cli = Cli::parse();

    init_logging(cli.log_level);
    logging_initialized.store(true, Ordering::SeqCst);

    fix::fix_main(&cli)
}
