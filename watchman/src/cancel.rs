/*
 * Copyright (c) Watchman Contributors.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The cancellation gate: converts Ctrl-C into a single, idempotent
//! transition into the shutdown path.
//!
//! The SIGINT handler does nothing but store a flag (plus, once shutdown has
//! been latched, one async-signal-safe `write(2)` so the user knows further
//! Ctrl-C is ignored). The dispatcher reads the flag once per loop
//! iteration; the handler is installed without SA_RESTART so a pending wait
//! returns EINTR and the loop regains control even when the target is idle.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use nix::sys::signal::SaFlags;
use nix::sys::signal::SigAction;
use nix::sys::signal::SigHandler;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;
use nix::sys::signal::sigaction;
use watchman_trace::Errno;

static CANCEL_REQUESTED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_LATCHED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signo: libc::c_int) {
    if SHUTDOWN_LATCHED.load(Ordering::SeqCst) {
        // Already detaching; only a single write(2) is safe here.
        let msg = b"watchman: ignoring Ctrl-C while detaching\n";
        unsafe { libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len()) };
        return;
    }
    CANCEL_REQUESTED.store(true, Ordering::SeqCst);
}

/// Read side of the cancellation flag. Obtained by installing the SIGINT
/// handler; there is one underlying flag per process.
#[derive(Debug)]
pub struct CancelToken(());

impl CancelToken {
    /// Installs the SIGINT handler. SA_RESTART is deliberately absent so
    /// that an in-flight wait is interrupted rather than transparently
    /// restarted.
    pub fn install() -> Result<CancelToken, Errno> {
        let action = SigAction::new(
            SigHandler::Handler(on_sigint),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGINT, &action) }?;
        Ok(CancelToken(()))
    }

    /// Whether cancellation has been requested. Checked once per dispatcher
    /// iteration; it never preempts an in-flight event.
    pub fn cancel_requested(&self) -> bool {
        CANCEL_REQUESTED.load(Ordering::SeqCst)
    }

    /// One-way transition into shutdown. After this, further Ctrl-C presses
    /// are acknowledged to the user and otherwise ignored, so overlapping
    /// shutdown passes can never be triggered.
    pub fn latch_shutdown(&self) {
        SHUTDOWN_LATCHED.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The flags are process-wide statics, so the whole latch lifecycle lives
    // in one test.
    #[test]
    fn latch_is_one_way() {
        let token = CancelToken(());
        CANCEL_REQUESTED.store(false, Ordering::SeqCst);
        SHUTDOWN_LATCHED.store(false, Ordering::SeqCst);

        assert!(!token.cancel_requested());

        // first request flips the flag
        on_sigint(libc::SIGINT);
        assert!(token.cancel_requested());

        // entering shutdown latches; a later request is ignored
        token.latch_shutdown();
        CANCEL_REQUESTED.store(false, Ordering::SeqCst);
        on_sigint(libc::SIGINT);
        assert!(!token.cancel_requested());
    }
}
