// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Deferred termination. While exit is blocked, a termination request is only
//! recorded and the caller is expected to act on it once the engine unblocks
//! exit again at the next operation boundary.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing::info;

#[derive(Debug, Default)]
pub struct Terminator {
    exit_blocked: AtomicBool,
    exit_requested: AtomicBool,
}

impl Terminator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_exit_blocked(&self, blocked: bool) {
        self.exit_blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn exit_blocked(&self) -> bool {
        self.exit_blocked.load(Ordering::SeqCst)
    }

    /// Record a termination request. Returns whether it is safe to exit right
    /// away.
    pub fn request_exit(&self) -> bool {
        self.exit_requested.store(true, Ordering::SeqCst);

        let blocked = self.exit_blocked();
        if blocked {
            info!("Exit requested while blocked; deferring until the current operation finishes");
        }

        !blocked
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// Whether a pending termination request can be honored now.
    pub fn should_exit(&self) -> bool {
        self.exit_requested() && !self.exit_blocked()
    }

    /// The exit request flag, for use with [`crate::stream::check_cancel`] in
    /// loops that do not touch the update state.
    pub fn cancel_signal(&self) -> &AtomicBool {
        &self.exit_requested
    }

    /// Return a guard that unblocks exit when dropped.
    pub fn unblocker(self: &Arc<Self>) -> ExitUnblocker {
        ExitUnblocker(self.clone())
    }
}

#[must_use]
pub struct ExitUnblocker(Arc<Terminator>);

impl Drop for ExitUnblocker {
    fn drop(&mut self) {
        self.0.set_exit_blocked(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_exit() {
        let terminator = Arc::new(Terminator::new());
        assert!(!terminator.should_exit());

        {
            let _unblocker = terminator.unblocker();
            terminator.set_exit_blocked(true);

            assert!(!terminator.request_exit());
            assert!(terminator.exit_requested());
            assert!(!terminator.should_exit());
        }

        assert!(!terminator.exit_blocked());
        assert!(terminator.should_exit());
        assert!(terminator.request_exit());
    }
}
