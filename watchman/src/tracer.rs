/*
 * Copyright (c) Watchman Contributors.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The engine: attaches to every thread of the target, arms the debug
//! registers, and runs the event dispatcher.
//!
//! ptrace scopes the tracer/tracee relationship to the attaching task, so the
//! whole engine is one synchronous flow: every tracee funnels through a
//! single `waitpid(-1)`-style multiplexing wait, and each stop is serviced
//! to completion before the next is consumed.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;
use watchman_trace::DebugRegister;
use watchman_trace::Errno;
use watchman_trace::Event;
use watchman_trace::ExitStatus;
use watchman_trace::Options;
use watchman_trace::Pid;
use watchman_trace::Running;
use watchman_trace::Signal;
use watchman_trace::Stopped;
use watchman_trace::Wait;

use crate::cancel::CancelToken;
use crate::hwdebug::Dr6;
use crate::hwdebug::Dr7;
use crate::threads::ThreadsError;
use crate::threads::list_threads;
use crate::watch::WatchRegistry;

/// The signal delivered to the target on every watchpoint hit. The target is
/// expected to have a handler installed (to dump a backtrace, say); the
/// default disposition terminates it.
pub const NOTIFY_SIGNAL: Signal = Signal::SIGUSR2;

/// An error during the initial attach pass. Attach is all-or-nothing: a
/// target with some threads armed and some not would report a misleading
/// subset of writes, so any failure here is fatal to the whole run.
#[derive(Error, Debug)]
pub enum AttachError {
    /// The thread could not be seized or interrupted.
    #[error("cannot attach to tid {tid}: {source}")]
    CannotAttach {
        /// Thread that failed.
        tid: Pid,
        /// Underlying errno, e.g. EPERM (yama ptrace_scope) or ESRCH.
        source: Errno,
    },

    /// The thread exited between enumeration and its first stop.
    #[error("tid {0} exited before it could be armed")]
    ThreadExited(Pid),

    /// Waiting for the post-interrupt stop failed.
    #[error("waiting for tid {tid} to stop: {source}")]
    WaitFailed {
        /// Thread that failed.
        tid: Pid,
        /// Underlying trace error.
        source: watchman_trace::Error,
    },

    /// The debug registers could not be programmed.
    #[error("programming watchpoints on tid {tid}: {source}")]
    Program {
        /// Thread that failed.
        tid: Pid,
        /// Underlying trace error.
        source: watchman_trace::Error,
    },

    /// The target's thread list could not be read.
    #[error(transparent)]
    Threads(#[from] ThreadsError),
}

/// Per-thread tracing state, keyed by tid in [`Engine::threads`].
#[derive(Debug)]
struct TracedThread {
    /// False if arming failed; the thread is still traced so its signals keep
    /// flowing, it just reports no hits.
    armed: bool,
}

/// Why the dispatcher loop ended.
#[derive(Debug, Eq, PartialEq)]
pub enum RunOutcome {
    /// The target's main thread exited.
    TargetExited(ExitStatus),

    /// Every tracee disappeared without the main thread reporting an exit,
    /// or waiting failed outright.
    TargetLost,

    /// Cancellation was requested; the target is still running.
    Cancelled,
}

/// The watchpoint engine for one target process.
#[derive(Debug)]
pub struct Engine {
    pid: Pid,
    registry: WatchRegistry,
    threads: HashMap<Pid, TracedThread>,
}

impl Engine {
    /// Attaches to every current thread of `pid` and arms the watchpoints on
    /// each. Threads created afterwards are picked up automatically via
    /// `PTRACE_O_TRACECLONE`.
    pub fn attach_all(pid: Pid, registry: WatchRegistry) -> Result<Engine, AttachError> {
        let tids = list_threads(pid)?;
        let mut threads = HashMap::new();
        for tid in tids {
            let thread = attach(tid, &registry)?;
            threads.insert(tid, thread);
        }
        info!(%pid, threads = threads.len(), watches = registry.len(), "attached");
        Ok(Engine {
            pid,
            registry,
            threads,
        })
    }

    /// The target process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Runs the event dispatcher until the target exits, every tracee is
    /// gone, or cancellation is requested.
    ///
    /// Cancellation is level-checked once per iteration, never mid-event: a
    /// stop that has already been consumed is always serviced and its thread
    /// resumed before the loop ends, so no tracee is left hanging in a
    /// half-handled stop.
    pub fn run(&mut self, cancel: &CancelToken) -> RunOutcome {
        loop {
            if cancel.cancel_requested() {
                info!("cancellation requested");
                return RunOutcome::Cancelled;
            }

            match watchman_trace::wait_all() {
                Ok(Some(Wait::Stopped(task, event))) => self.handle_stop(task, event),
                Ok(Some(Wait::Exited(tid, status))) => {
                    self.threads.remove(&tid);
                    if tid == self.pid {
                        info!(%tid, %status, "target exited");
                        return RunOutcome::TargetExited(status);
                    }
                    debug!(%tid, %status, "thread exited");
                }
                Ok(None) => {
                    warn!("no tracees left");
                    return RunOutcome::TargetLost;
                }
                // A cancellation signal interrupting an idle wait lands here;
                // the next iteration observes the flag.
                Err(watchman_trace::Error::Errno(Errno::EINTR)) => continue,
                Err(err) => {
                    warn!(%err, "wait failed");
                    return RunOutcome::TargetLost;
                }
            }
        }
    }

    fn handle_stop(&mut self, task: Stopped, event: Event) {
        let tid = task.pid();

        // A tid we have never seen is a clone child reporting its initial
        // stop (or a pending signal that beat it). Arm it before anything
        // else so no write in the new thread goes unwatched.
        if !self.threads.contains_key(&tid) {
            let armed = match program_watchpoints(&task, &self.registry) {
                Ok(()) => true,
                Err(err) => {
                    warn!(%tid, %err, "could not arm new thread");
                    false
                }
            };
            debug!(%tid, armed, "adopted new thread");
            self.threads.insert(tid, TracedThread { armed });
        }

        let resumed = match event {
            Event::Signal(Signal::SIGTRAP) => self.handle_trap(task),
            // Any other signal belongs to the target; deliver it unchanged.
            Event::Signal(sig) => task.resume(sig),
            Event::Stop => task.resume(None),
            Event::Cloned(child) => {
                // The child is already traced; it gets armed when it reports
                // its own initial stop.
                debug!(parent = %tid, child = %child.pid(), "thread cloned");
                task.resume(None)
            }
        };

        match resumed {
            Ok(_running) => {}
            Err(watchman_trace::Error::Died(zombie)) => {
                debug!(tid = %zombie.pid(), "thread died during stop handling");
                self.threads.remove(&zombie.pid());
            }
            Err(err) => warn!(%tid, %err, "failed to resume thread"),
        }
    }

    /// Services a SIGTRAP: decode DR6, report the hit, clear the status word
    /// and resume with the notification signal. DR6 is sticky, so failing to
    /// clear it would make the next trap report stale slots.
    fn handle_trap(&self, task: Stopped) -> Result<Running, watchman_trace::Error> {
        let tid = task.pid();
        let armed = self.threads.get(&tid).is_none_or(|thread| thread.armed);
        let dr6 = Dr6::from_raw(task.read_debug(DebugRegister::Dr6)?);

        if !armed || !dr6.any_watch_hit() {
            // Not one of ours (single-step leftover or a breakpoint trap the
            // target raised itself). Swallow it: forwarding a SIGTRAP to a
            // process with no handler would kill it.
            debug!(%tid, single_step = dr6.single_step(), "trap without watch status");
            return task.resume(None);
        }

        for slot in dr6.fired_slots() {
            let Some(desc) = self.registry.get(slot) else {
                warn!(%tid, slot, "status reports a slot we never armed");
                continue;
            };
            // Diagnostic read of the freshly-written value. This can fail if
            // the page was unmapped right after the write; the hit is still
            // reported.
            match task.read_data(desc.addr) {
                Ok(word) => info!(
                    %tid,
                    slot,
                    addr = format_args!("{:#x}", desc.addr),
                    value = format_args!("{:#x}", word & desc.value_mask()),
                    "watchpoint hit"
                ),
                Err(err) => info!(
                    %tid,
                    slot,
                    addr = format_args!("{:#x}", desc.addr),
                    %err,
                    "watchpoint hit (value unreadable)"
                ),
            }
        }

        task.write_debug(DebugRegister::Dr6, 0)?;
        task.resume(NOTIFY_SIGNAL)
    }
}

/// Seizes `tid`, interrupts it into a ptrace-stop, arms the watchpoints and
/// resumes it. A signal-delivery stop that arrives ahead of the interrupt is
/// preserved and re-delivered on resume.
fn attach(tid: Pid, registry: &WatchRegistry) -> Result<TracedThread, AttachError> {
    let running = Running::seize(tid, Options::PTRACE_O_TRACECLONE)
        .map_err(|source| AttachError::CannotAttach { tid, source })?;
    running
        .interrupt()
        .map_err(|source| AttachError::CannotAttach { tid, source })?;

    let (task, event) = match running
        .wait()
        .map_err(|source| AttachError::WaitFailed { tid, source })?
    {
        Wait::Stopped(task, event) => (task, event),
        Wait::Exited(pid, _status) => return Err(AttachError::ThreadExited(pid)),
    };

    program_watchpoints(&task, registry)
        .map_err(|source| AttachError::Program { tid, source })?;

    let pending = match event {
        Event::Signal(sig) => Some(sig),
        _ => None,
    };
    task.resume(pending)
        .map_err(|source| AttachError::Program { tid, source })?;

    debug!(%tid, "thread armed");
    Ok(TracedThread { armed: true })
}

/// Programs the watchpoints into a stopped thread's debug registers.
///
/// All address registers are written first and the control word last, in one
/// batch write. The thread either ends up fully armed or (on an error return)
/// with its old control word intact; it is never observable half-armed.
fn program_watchpoints(
    task: &Stopped,
    registry: &WatchRegistry,
) -> Result<(), watchman_trace::Error> {
    for (slot, desc) in registry.slots() {
        task.write_debug(DebugRegister::slot(slot), desc.addr)?;
    }

    let mut dr7 = Dr7::from_raw(task.read_debug(DebugRegister::Dr7)?);
    for (slot, desc) in registry.slots() {
        dr7 = dr7.set_slot(slot, desc.size);
    }
    task.write_debug(DebugRegister::Dr7, dr7.raw())
}
