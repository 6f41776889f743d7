// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Runs the external bspatch utility. The patcher reads and writes the
//! partitions by path, using position lists to map the extents.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};

use thiserror::Error;
use tracing::debug;

use crate::util::DebugString;

pub const DEFAULT_BSPATCH_PATH: &str = "bspatch";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to run command: {0:?}")]
    CommandSpawn(DebugString, #[source] io::Error),
    #[error("Command failed with status: {1}: {0:?}")]
    CommandExecution(DebugString, ExitStatus),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub struct Bspatch {
    program: PathBuf,
}

impl Default for Bspatch {
    fn default() -> Self {
        Self::new(DEFAULT_BSPATCH_PATH)
    }
}

impl Bspatch {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(
        &self,
        input: &Path,
        output: &Path,
        patch: &Path,
        input_positions: &str,
        output_positions: &str,
    ) -> Command {
        let mut command = Command::new(&self.program);
        command.args([
            OsString::from(input),
            OsString::from(output),
            OsString::from(patch),
            OsString::from(input_positions),
            OsString::from(output_positions),
        ]);
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::inherit());
        command
    }

    /// Apply `patch` to the byte ranges of `input` given by `input_positions`
    /// and write the output to the ranges of `output` given by
    /// `output_positions`. The position strings use the `offset:length,...`
    /// syntax.
    pub fn apply(
        &self,
        input: &Path,
        output: &Path,
        patch: &Path,
        input_positions: &str,
        output_positions: &str,
    ) -> Result<()> {
        let mut command = self.command(input, output, patch, input_positions, output_positions);

        debug!("Running: {command:?}");

        let status = command
            .status()
            .map_err(|e| Error::CommandSpawn(DebugString::new(&command), e))?;

        if !status.success() {
            return Err(Error::CommandExecution(DebugString::new(&command), status));
        }

        Ok(())
    }
}
