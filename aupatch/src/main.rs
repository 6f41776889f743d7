// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use aupatch::terminator::Terminator;
use tracing::error;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

fn main() -> ExitCode {
    // Termination requests are deferred while the update state is being
    // modified. The apply loop stops at the next safe point.
    let terminator = Arc::new(Terminator::new());
    {
        let terminator = terminator.clone();

        ctrlc::set_handler(move || {
            terminator.request_exit();
        })
        .expect("Failed to set signal handler");
    }

    match aupatch::cli::args::main(&LOGGING_INITIALIZED, &terminator) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
                error!("{e:?}");
            } else {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
