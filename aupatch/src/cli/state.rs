// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::{
    performer::DeltaPerformer,
    prefs::{FilePrefs, Prefs, UPDATE_STATE_KEYS},
};

fn show_subcommand(cli: &ShowCli) -> Result<()> {
    let prefs = FilePrefs::new(&cli.prefs_dir);

    for key in UPDATE_STATE_KEYS {
        let value = prefs
            .get_string(key)
            .with_context(|| format!("Failed to read preference: {key}"))?;

        match value {
            Some(v) => println!("{key} = {:?}", v.trim()),
            None => println!("{key} is unset"),
        }
    }

    if let Some(point) =
        DeltaPerformer::resume_point(&prefs).context("Failed to read update progress")?
    {
        println!(
            "resume offset = {} (metadata {} + data {})",
            point.payload_offset(),
            point.metadata_size,
            point.data_offset,
        );
    }

    Ok(())
}

fn reset_subcommand(cli: &ResetCli) -> Result<()> {
    let mut prefs = FilePrefs::new(&cli.prefs_dir);

    DeltaPerformer::reset_update_progress(&mut prefs, cli.quick)
        .with_context(|| format!("Failed to reset update progress: {:?}", cli.prefs_dir))?;

    info!("Reset update progress in {:?}", cli.prefs_dir);

    Ok(())
}

pub fn state_main(cli: &StateCli) -> Result<()> {
    match &cli.command {
        StateCommand::Show(c) => show_subcommand(c),
        StateCommand::Reset(c) => reset_subcommand(c),
    }
}

/// Show the saved update progress.
#[derive(Debug, Parser)]
struct ShowCli {
    /// Directory containing update progress.
    #[arg(long, value_name = "DIR", value_parser)]
    prefs_dir: PathBuf,
}

/// Erase the saved update progress.
#[derive(Debug, Parser)]
struct ResetCli {
    /// Directory containing update progress.
    #[arg(long, value_name = "DIR", value_parser)]
    prefs_dir: PathBuf,

    /// Only invalidate the next operation index.
    #[arg(long)]
    quick: bool,
}

#[derive(Debug, Subcommand)]
enum StateCommand {
    Show(ShowCli),
    Reset(ResetCli),
}

/// Inspect or reset the saved update progress.
#[derive(Debug, Parser)]
pub struct StateCli {
    #[command(subcommand)]
    command: StateCommand,
}
