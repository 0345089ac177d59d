/*
 * Copyright (c) Watchman Contributors.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Provide `waitid` which is based on `SYS_waitid` syscall.
//! `SYS_waitid` provides the `WNOWAIT` flag which is absent in `waitpid`, and
//! unlike `waitpid` the flags *must* be explicitly provided: a combination
//! (bitwise-or) of `WEXITED`, `WSTOPPED`, `WNOHANG`, `WNOWAIT` and `__WALL`.
//! See `waitid(2)` for details.

use std::mem::MaybeUninit;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdType {
    Pid(Pid),
    All,
}

#[inline]
fn si_status_signal(info: &libc::siginfo_t) -> Signal {
    let status = unsafe { info.si_status() };
    // The status can sometimes be 0 when using PTRACE_SEIZE, so we report a
    // bogus SIGSTOP instead.
    Signal::try_from(status & 0xff).unwrap_or(Signal::SIGSTOP)
}

#[inline]
fn si_status_event(info: &libc::siginfo_t) -> i32 {
    (unsafe { info.si_status() } >> 8) as i32
}

/// Returns the raw siginfo from a waitid call.
fn waitid_si(waitid_type: IdType, flags: WaitPidFlag) -> Result<libc::siginfo_t, Errno> {
    let mut siginfo = MaybeUninit::<libc::siginfo_t>::zeroed();
    let siginfo_ptr: *mut libc::siginfo_t = siginfo.as_mut_ptr();

    let (id_type, id) = match waitid_type {
        IdType::Pid(pid) => (libc::P_PID, pid.as_raw()),
        IdType::All => (libc::P_ALL, -1),
    };

    Errno::result(unsafe { libc::waitid(id_type, id as libc::id_t, siginfo_ptr, flags.bits()) })?;

    Ok(unsafe { siginfo.assume_init() })
}

fn siginfo_to_waitstatus(si: libc::siginfo_t) -> WaitStatus {
    let pid = Pid::from_raw(unsafe { si.si_pid() });
    match si.si_code {
        libc::CLD_EXITED => WaitStatus::Exited(pid, unsafe { si.si_status() }),
        libc::CLD_KILLED => WaitStatus::Signaled(pid, si_status_signal(&si), false),
        libc::CLD_DUMPED => WaitStatus::Signaled(pid, si_status_signal(&si), true),
        libc::CLD_STOPPED => WaitStatus::Stopped(pid, si_status_signal(&si)),
        libc::CLD_TRAPPED if unsafe { si.si_status() } == 0x80 | Signal::SIGTRAP as i32 => {
            WaitStatus::PtraceSyscall(pid)
        }
        libc::CLD_TRAPPED => {
            let trap_sig = si_status_signal(&si);
            let event = si_status_event(&si);
            if event == 0 {
                // could return SIGSTOP here for initial ptrace stop
                // right after a clone event.
                WaitStatus::Stopped(pid, trap_sig)
            } else {
                WaitStatus::PtraceEvent(pid, trap_sig, event)
            }
        }
        libc::CLD_CONTINUED => WaitStatus::Continued(pid),
        bad_si_code => panic!("unexpected si_code {} from siginfo_t", bad_si_code),
    }
}

/// waitid as per SYS_waitid.
/// return
///   - Err when the syscall returns -1.
///   - Ok(WaitStatus::StillAlive) when no state change (WNOHANG only).
///   - Ok(WaitStatus::...) when state has changed.
pub(crate) fn waitid(waitid_type: IdType, flags: WaitPidFlag) -> Result<WaitStatus, Errno> {
    let siginfo = waitid_si(waitid_type, flags)?;

    if unsafe { siginfo.si_pid() } == 0 {
        Ok(WaitStatus::StillAlive)
    } else {
        Ok(siginfo_to_waitstatus(siginfo))
    }
}
