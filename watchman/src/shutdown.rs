/*
 * Copyright (c) Watchman Contributors.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Race-free teardown: freeze the whole target, then per thread clear the
//! debug registers and drain any in-flight trap before detaching.
//!
//! Ordering is what makes this safe. The group-wide SIGSTOP lands first, so
//! the thread list read afterwards cannot grow. Each thread is disarmed
//! (control word first) before it is ever single-stepped, so the drain can
//! never generate new hits. And a SIGTRAP that was already queued when the
//! freeze landed is consumed here rather than left to kill the target after
//! detach.
//!
//! Everything in this pass is best-effort per thread: a thread that exits
//! mid-teardown is skipped, never an abort. The pass as a whole is
//! idempotent, so running it after a partial failure is harmless.

use nix::sys::signal;
use tracing::debug;
use tracing::info;
use tracing::warn;
use watchman_trace::DebugRegister;
use watchman_trace::Pid;
use watchman_trace::Running;
use watchman_trace::Signal;
use watchman_trace::Stopped;
use watchman_trace::Wait;

use crate::hwdebug::Dr6;
use crate::hwdebug::Dr7;
use crate::hwdebug::NUM_SLOTS;
use crate::threads::list_threads;

/// Upper bound on single-steps spent draining queued traps per thread. One
/// step is the normal case; the bound exists so a misbehaving status word can
/// never wedge the teardown.
pub const FLUSH_STEP_LIMIT: usize = 5;

/// Freezes `pid`, clears and detaches every thread, then optionally lets the
/// target continue.
///
/// With `resume_after` false the target is left group-stopped, which is
/// useful when the caller wants to inspect it before it runs on. The
/// per-thread waits below consume the freeze signal's stop, so the stop has
/// to be re-asserted after the last detach rather than relied on to persist.
pub fn shutdown(pid: Pid, resume_after: bool) {
    // Freeze the whole thread group so the task list stops moving.
    if let Err(err) = signal::kill(pid, Signal::SIGSTOP) {
        warn!(%pid, %err, "target gone before shutdown");
        return;
    }

    // Confirm the stop took effect without consuming the event: the lead
    // thread's group-stop must stay queued for the per-thread wait below.
    match watchman_trace::peek(pid) {
        Ok(Some(_running)) => {}
        Ok(None) => debug!(%pid, "lead thread is not our tracee"),
        Err(err) => warn!(%pid, %err, "could not confirm freeze"),
    }

    let tids = match list_threads(pid) {
        Ok(tids) => tids,
        Err(err) => {
            warn!(%pid, %err, "target gone before shutdown");
            return;
        }
    };

    let mut detached = 0usize;
    for tid in tids.iter().copied() {
        let Some(task) = stop_thread(tid) else {
            continue;
        };
        let Some(task) = flush(task) else {
            continue;
        };
        match task.detach(None) {
            Ok(_running) => detached += 1,
            Err(err) => warn!(%tid, %err, "detach failed"),
        }
    }
    info!(%pid, threads = tids.len(), detached, "detached from target");

    if resume_after {
        // Lifts whatever remains of the SIGSTOP group-stop.
        if let Err(err) = signal::kill(pid, Signal::SIGCONT) {
            warn!(%pid, %err, "could not resume target");
        }
    } else {
        // The freeze stop was consumed (and suppressed by detach) thread by
        // thread above, so without this the target would run on. Nothing is
        // traced anymore, so this is a plain group stop.
        if let Err(err) = signal::kill(pid, Signal::SIGSTOP) {
            warn!(%pid, %err, "could not leave target stopped");
        }
    }
}

/// Brings one (frozen) thread into a consumable ptrace-stop. Returns `None`
/// for threads that exited or were never ours.
fn stop_thread(tid: Pid) -> Option<Stopped> {
    let running = Running::new(tid);
    // Best-effort: the thread usually already has the group-stop queued, in
    // which case the interrupt is redundant but harmless.
    let _ = running.interrupt();
    match running.wait() {
        Ok(Wait::Stopped(task, _event)) => Some(task),
        Ok(Wait::Exited(_pid, status)) => {
            debug!(%tid, %status, "thread exited before teardown");
            None
        }
        Err(err) => {
            debug!(%tid, %err, "thread not stoppable");
            None
        }
    }
}

/// Clears every debug register except DR6, which the drain loop below uses
/// as evidence of a not-yet-delivered trap. The control word goes first so
/// that no stale address register can fire in between.
fn disarm(task: &Stopped) -> Result<(), watchman_trace::Error> {
    task.write_debug(DebugRegister::Dr7, Dr7::EMPTY.raw())?;
    for slot in 0..NUM_SLOTS {
        task.write_debug(DebugRegister::slot(slot), 0)?;
    }
    Ok(())
}

/// Disarms the thread and drains any queued SIGTRAP so it cannot be
/// delivered after detach. Returns the thread still stopped and ready to
/// detach, or `None` if it died under us.
fn flush(mut task: Stopped) -> Option<Stopped> {
    let tid = task.pid();

    if let Err(err) = disarm(&task) {
        warn!(%tid, %err, "could not clear debug registers");
        // Detaching is still worth attempting.
        return match err {
            watchman_trace::Error::Died(_zombie) => None,
            watchman_trace::Error::Errno(_errno) => Some(task),
        };
    }

    for _attempt in 0..FLUSH_STEP_LIMIT {
        let dr6 = match task.read_debug(DebugRegister::Dr6) {
            Ok(raw) => Dr6::from_raw(raw),
            Err(watchman_trace::Error::Died(_zombie)) => return None,
            Err(err) => {
                warn!(%tid, %err, "could not read trap status");
                return Some(task);
            }
        };

        if !trap_still_queued(dr6) {
            return Some(task);
        }

        debug!(%tid, "draining queued trap");
        if let Err(err) = task.write_debug(DebugRegister::Dr6, 0) {
            warn!(%tid, %err, "could not clear trap status");
            return match err {
                watchman_trace::Error::Died(_zombie) => None,
                watchman_trace::Error::Errno(_errno) => Some(task),
            };
        }

        // One step with no signal lets the queued SIGTRAP deliver as a stop
        // we consume here. The registers are already clear, so the step
        // itself cannot raise a new watch hit.
        let running = match task.step(None) {
            Ok(running) => running,
            Err(_err) => return None,
        };
        task = match running.wait() {
            Ok(Wait::Stopped(task, _event)) => task,
            Ok(Wait::Exited(_pid, status)) => {
                debug!(%tid, %status, "thread exited during trap drain");
                return None;
            }
            Err(err) => {
                warn!(%tid, %err, "wait failed during trap drain");
                return None;
            }
        };
    }

    warn!(%tid, limit = FLUSH_STEP_LIMIT, "trap drain limit reached");
    Some(task)
}

/// A set watch bit in DR6 means a trap fired that the dispatcher never
/// serviced, i.e. its SIGTRAP may still be queued. The single-step flag alone
/// does not count; it is a byproduct of the drain itself.
fn trap_still_queued(dr6: Dr6) -> bool {
    dr6.any_watch_hit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_step_flag_is_not_a_queued_trap() {
        assert!(!trap_still_queued(Dr6::from_raw(0)));
        assert!(!trap_still_queued(Dr6::from_raw(1 << 14)));
        assert!(trap_still_queued(Dr6::from_raw(0b0001)));
        assert!(trap_still_queued(Dr6::from_raw((1 << 14) | 0b1000)));
    }

    #[test]
    fn drain_is_bounded() {
        // A status word that never comes clean must still terminate within
        // the step limit.
        let mut steps = 0;
        let mut dr6 = Dr6::from_raw(0b0001);
        for _attempt in 0..FLUSH_STEP_LIMIT {
            if !trap_still_queued(dr6) {
                break;
            }
            steps += 1;
            // simulated hardware that re-reports the hit after every clear
            dr6 = Dr6::from_raw(0b0001);
        }
        assert_eq!(steps, FLUSH_STEP_LIMIT);
    }
}
