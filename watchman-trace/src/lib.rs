/*
 * Copyright (c) Watchman Contributors.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![cfg(target_os = "linux")]

//! A typed ptrace layer. The API forces correct usage of ptrace in that
//! register and memory requests can only be issued against a tracee known to
//! be in a ptrace-stop: a [`Stopped`] value is the capability to make such
//! requests, and resuming the tracee consumes it, yielding a [`Running`].
//!
//! Only the small slice of ptrace that a hardware-watchpoint controller needs
//! is covered: seize/interrupt/wait/step/detach, signal-stop classification,
//! and (on x86-64) the debug-register area of `struct user`.

#[cfg(target_arch = "x86_64")]
mod uarea;
mod waitid;

use std::fmt;

use nix::sys::ptrace;
// Re-exports so that callers don't need to name `nix` for the common types.
pub use nix::errno::Errno;
pub use nix::sys::ptrace::Options;
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use thiserror::Error;

#[cfg(target_arch = "x86_64")]
pub use crate::uarea::DebugRegister;
use crate::waitid::IdType;
use crate::waitid::waitid;

/// An error that occurred during tracing.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    /// A low-level errno.
    #[error(transparent)]
    Errno(#[from] Errno),

    /// The tracee died unexpectedly while we believed it to be in a
    /// ptrace-stop. Callers should drop the thread from their live set.
    #[error("tracee {0} is a zombie")]
    Died(Zombie),
}

/// How a tracee exited.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    /// Exited normally with the given exit code.
    Exited(i32),

    /// Killed by the given signal. The flag indicates a core dump.
    Signaled(Signal, bool),
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {}", code),
            Self::Signaled(sig, _core) => write!(f, "killed by {}", sig),
        }
    }
}

/// A stop event, classified from the raw wait status.
///
/// Only the events this crate subscribes to can appear. With
/// `PTRACE_O_TRACECLONE` as the sole option, those are signal-delivery stops,
/// group/interrupt stops and clone stops.
#[derive(Debug, Eq, PartialEq)]
pub enum Event {
    /// The tracee was stopped by delivery of a signal.
    Signal(Signal),

    /// Stop induced by `PTRACE_INTERRUPT`, a group-stop, or the initial stop
    /// of a clone child auto-attached through `PTRACE_O_TRACECLONE`.
    Stop,

    /// Stop before return from `clone(2)`. The new thread is already traced
    /// and will report its own initial stop.
    Cloned(Running),
}

impl Event {
    /// Converts a raw ptrace event code, fetching associated data while the
    /// tracee is still guaranteed to be stopped.
    fn from_ptrace_event(task: &Stopped, event: i32) -> Result<Self, Error> {
        match event {
            libc::PTRACE_EVENT_CLONE => {
                let child = Pid::from_raw(task.getevent()? as i32);
                Ok(Self::Cloned(Running::new(child)))
            }
            libc::PTRACE_EVENT_STOP => Ok(Self::Stop),
            other => unreachable!("unsubscribed ptrace event {:#x}", other),
        }
    }
}

/// The result of a blocking wait. A tracee in this state is guaranteed to not
/// be running.
///
/// Both `Clone` and `Copy` are intentionally not implemented. This is to
/// enforce type safety.
#[derive(Debug, Eq, PartialEq)]
pub enum Wait {
    /// The tracee is in a ptrace-stop and accepts ptrace requests. Resuming
    /// it transitions it back to a running state.
    Stopped(Stopped, Event),

    /// The tracee has exited with an exit status.
    Exited(Pid, ExitStatus),
}

impl Wait {
    /// Returns the thread ID this wait result is about.
    pub fn pid(&self) -> Pid {
        match self {
            Self::Stopped(Stopped(pid), _) => *pid,
            Self::Exited(pid, _exit_status) => *pid,
        }
    }
}

impl TryFrom<WaitStatus> for Wait {
    type Error = Error;

    /// Converts a `WaitStatus` to this type.
    ///
    /// Preconditions:
    /// The tracee must not be in a `StillAlive` state.
    fn try_from(wait_status: WaitStatus) -> Result<Self, Error> {
        Ok(match wait_status {
            WaitStatus::Exited(pid, code) => Self::Exited(pid, ExitStatus::Exited(code)),
            WaitStatus::Signaled(pid, sig, coredump) => {
                Self::Exited(pid, ExitStatus::Signaled(sig, coredump))
            }
            WaitStatus::Stopped(pid, sig) => Self::Stopped(Stopped(pid), Event::Signal(sig)),
            WaitStatus::PtraceEvent(pid, _sig, event) => {
                let task = Stopped(pid);
                let event = Event::from_ptrace_event(&task, event)?;
                Self::Stopped(task, event)
            }
            WaitStatus::PtraceSyscall(_pid) => {
                // Not possible because PTRACE_O_TRACESYSGOOD is never set.
                unreachable!("unexpected WaitStatus::PtraceSyscall");
            }
            WaitStatus::Continued(_pid) => {
                // Not possible because WaitPidFlag::WCONTINUED is never used.
                unreachable!("unexpected WaitStatus::Continued");
            }
            WaitStatus::StillAlive => {
                // The precondition of this function forbids this.
                unreachable!("precondition violated with WaitStatus::StillAlive");
            }
        })
    }
}

impl fmt::Display for Wait {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Stopped(stopped, event) => {
                write!(f, "tid {} stopped ({:?})", stopped.pid(), event)
            }
            Self::Exited(pid, exit_status) => write!(f, "tid {} exited ({})", pid, exit_status),
        }
    }
}

/// A tracee that is in a ptrace-stop and accepts ptrace requests.
#[derive(Debug, Hash, Eq, PartialEq)]
pub struct Stopped(Pid);

impl Stopped {
    /// Returns the thread ID of the tracee.
    pub fn pid(&self) -> Pid {
        self.0
    }

    /// Helper for interpreting an errno from a ptrace request.
    ///
    /// According to ptrace(2), any ptrace operation may return ESRCH for one
    /// of three reasons:
    ///  1. The tracee was observed to be in a stopped state and died
    ///     unexpectedly.
    ///  2. The tracee is not currently being traced by the caller.
    ///  3. The tracee is not in a stopped state.
    ///
    /// Reasons (2) and (3) only occur due to programmer errors this API is
    /// designed to prevent, so ESRCH here means the tracee has died while in
    /// a stopped state. See "Death under ptrace" in `man 2 ptrace`.
    pub(crate) fn map_err(&self, err: Errno) -> Error {
        if err == Errno::ESRCH {
            Error::Died(Zombie(self.0))
        } else {
            Error::Errno(err)
        }
    }

    /// Resumes the tracee, optionally delivering a signal, and transitions it
    /// back to a running state.
    pub fn resume<T: Into<Option<Signal>>>(self, sig: T) -> Result<Running, Error> {
        ptrace::cont(self.0, sig).map_err(|err| self.map_err(err))?;
        Ok(Running::new(self.0))
    }

    /// Advances the execution of the tracee by a single instruction,
    /// optionally delivering a signal.
    pub fn step<T: Into<Option<Signal>>>(self, sig: T) -> Result<Running, Error> {
        ptrace::step(self.0, sig).map_err(|err| self.map_err(err))?;
        Ok(Running::new(self.0))
    }

    /// Detaches from and then resumes the stopped tracee.
    pub fn detach<T: Into<Option<Signal>>>(self, sig: T) -> Result<Running, Error> {
        ptrace::detach(self.0, sig).map_err(|err| self.map_err(err))?;
        Ok(Running::new(self.0))
    }

    /// Retrieves the message about the ptrace event that just happened (for
    /// a clone stop, the thread ID of the new child).
    pub fn getevent(&self) -> Result<i64, Error> {
        ptrace::getevent(self.0).map_err(|err| self.map_err(err))
    }
}

/// A running tracee.
#[derive(Debug, Hash, Eq, PartialEq)]
pub struct Running(Pid);

impl Running {
    /// Creates a new running tracee handle.
    pub fn new(pid: Pid) -> Self {
        Running(pid)
    }

    /// Takes tracing control of an already-running thread without stopping
    /// it. The given options take effect atomically with the seize. A seized
    /// tracee can also accept [`Running::interrupt`].
    pub fn seize(pid: Pid, options: Options) -> Result<Self, Errno> {
        ptrace::seize(pid, options)?;
        Ok(Running(pid))
    }

    /// Stops the running tracee, even if it is in the middle of a syscall.
    /// The next time the tracee is waited on, it reports [`Event::Stop`]
    /// (or whatever stop was already pending).
    ///
    /// Only works on tracees attached via [`Running::seize`].
    pub fn interrupt(&self) -> Result<(), Errno> {
        // nix doesn't provide `ptrace::interrupt`, so we need to roll our own.
        Errno::result(unsafe {
            libc::ptrace(
                libc::PTRACE_INTERRUPT,
                self.0.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                std::ptr::null_mut::<libc::c_void>(),
            )
        })
        .map(drop)
    }

    /// Returns the thread ID of the tracee.
    pub fn pid(&self) -> Pid {
        self.0
    }

    /// Blocks until a state change occurs. This may transition the tracee to
    /// either a stopped state or an exited state, but never a running state.
    ///
    /// A wait interrupted by a signal is retried.
    pub fn wait(self) -> Result<Wait, Error> {
        loop {
            match waitid(IdType::Pid(self.0), wait_flags()) {
                Ok(status) => {
                    // Unwrap is fine: a blocking wait never reports StillAlive.
                    return Wait::try_from(status);
                }
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(Error::Errno(err)),
            }
        }
    }
}

/// The only thing a zombie can do is get reaped; it exists so that callers
/// can tell "thread died under us" apart from real errors.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct Zombie(Pid);

impl Zombie {
    /// Returns the thread ID of the zombie.
    pub fn pid(&self) -> Pid {
        self.0
    }
}

impl fmt::Display for Zombie {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// `__WALL` is required to observe clone children of the target, which do not
// deliver SIGCHLD to their tracer.
fn wait_flags() -> WaitPidFlag {
    WaitPidFlag::WEXITED | WaitPidFlag::WSTOPPED | WaitPidFlag::__WALL
}

/// Waits for any tracee to change state, blocking until the next event. This
/// is the `waitpid(-1)` multiplexing point of a single-flow tracer.
///
/// Returns `Ok(None)` when there are no tracees left to wait for (ECHILD).
///
/// Unlike [`Running::wait`], an EINTR is surfaced to the caller instead of
/// being retried: the event loop must regain control when a cancellation
/// signal interrupts an otherwise idle wait.
pub fn wait_all() -> Result<Option<Wait>, Error> {
    match waitid(IdType::All, wait_flags()) {
        Ok(status) => Wait::try_from(status).map(Some),
        Err(Errno::ECHILD) => Ok(None),
        Err(err) => Err(Error::Errno(err)),
    }
}

/// Blocks until a state change of `pid` is ready to consume, but does not
/// consume it. Returns `Ok(None)` when `pid` is not something we can wait on.
///
/// Useful for confirming that a freeze signal has taken effect without
/// swallowing the stop event itself. An EINTR is retried.
pub fn peek(pid: Pid) -> Result<Option<Running>, Errno> {
    loop {
        match waitid(IdType::Pid(pid), wait_flags() | WaitPidFlag::WNOWAIT) {
            Ok(_status) => return Ok(Some(Running::new(pid))),
            Err(Errno::ECHILD) => return Ok(None),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// These tests are meant to test this API but also to show how ptrace works.
#[cfg(test)]
mod test {
    use nix::sys::signal;
    use nix::unistd::ForkResult;
    use nix::unistd::fork;

    use super::*;

    // Traces a closure in a forked process. The forked process starts in a
    // stopped state so the tracer wins any startup race.
    fn trace<F>(f: F, options: Options) -> Result<(Pid, Stopped), Error>
    where
        F: FnOnce() -> i32,
    {
        match unsafe { fork() }? {
            ForkResult::Parent { child, .. } => {
                let mut running = Running::seize(child, options)?;

                // Keep consuming events until we reach a SIGSTOP or group stop.
                let stopped = loop {
                    match running.wait()? {
                        Wait::Stopped(stopped, event) => {
                            if event == Event::Signal(Signal::SIGSTOP) || event == Event::Stop {
                                break stopped;
                            } else if let Event::Signal(sig) = event {
                                running = stopped.resume(Some(sig))?;
                            } else {
                                running = stopped.resume(None)?;
                            }
                        }
                        task => panic!("Got unexpected exit: {:?}", task),
                    }
                };

                Ok((stopped.pid(), stopped))
            }
            ForkResult::Child => {
                // Suppress core dumps for testing purposes.
                let limit = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                let _ = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };

                // PTRACE_SEIZE is inherently racey, so we stop here and let
                // the parent catch up.
                signal::raise(Signal::SIGSTOP).unwrap();

                let exit_code = f();

                // Note: We can't use the normal exit function here because we
                // don't want to run atexit handlers of the test harness.
                let _ = unsafe { libc::_exit(exit_code) };
            }
        }
    }

    #[test]
    fn basic() -> Result<(), Box<dyn std::error::Error + 'static>> {
        // Do nothing but exit.
        let (pid, tracee) = trace(|| 42, Options::empty())?;
        assert_eq!(
            tracee.resume(None)?.wait()?,
            Wait::Exited(pid, ExitStatus::Exited(42))
        );

        Ok(())
    }

    #[test]
    fn interrupt_stops_a_running_tracee() -> Result<(), Box<dyn std::error::Error + 'static>> {
        let (pid, tracee) = trace(
            || {
                loop {
                    unsafe { libc::usleep(10_000) };
                }
            },
            Options::empty(),
        )?;

        let running = tracee.resume(None)?;
        running.interrupt()?;

        match running.wait()? {
            Wait::Stopped(stopped, event) => {
                assert_eq!(stopped.pid(), pid);
                assert_eq!(event, Event::Stop);
                stopped.detach(None)?;
            }
            task => panic!("Got unexpected exit: {:?}", task),
        }

        signal::kill(pid, Signal::SIGKILL)?;
        let status = nix::sys::wait::waitpid(pid, None)?;
        assert_eq!(
            status,
            nix::sys::wait::WaitStatus::Signaled(pid, Signal::SIGKILL, false)
        );

        Ok(())
    }

    #[test]
    fn killed_by_signal() -> Result<(), Box<dyn std::error::Error + 'static>> {
        let (pid, tracee) = trace(
            || {
                signal::raise(Signal::SIGILL).unwrap();
                unreachable!()
            },
            Options::empty(),
        )?;

        let running = tracee.resume(None)?;

        let (stopped, event) = match running.wait()? {
            Wait::Stopped(stopped, event) => (stopped, event),
            task => panic!("Got unexpected exit: {:?}", task),
        };

        assert_eq!(event, Event::Signal(Signal::SIGILL));

        assert_eq!(
            stopped.resume(Some(Signal::SIGILL))?.wait()?,
            Wait::Exited(pid, ExitStatus::Signaled(Signal::SIGILL, true))
        );

        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn debug_registers_round_trip() -> Result<(), Box<dyn std::error::Error + 'static>> {
        let (pid, tracee) = trace(
            || {
                loop {
                    unsafe { libc::usleep(10_000) };
                }
            },
            Options::empty(),
        )?;

        // DR0 holds an address; DR7 arms slot 0 for a 4-byte write watch:
        // local-enable bit 0, rw/len field 0b0111 at bit 16.
        tracee.write_debug(DebugRegister::Dr0, 0x1000)?;
        tracee.write_debug(DebugRegister::Dr7, (0b0111 << 16) | 0b01)?;

        assert_eq!(tracee.read_debug(DebugRegister::Dr0)?, 0x1000);
        assert_eq!(tracee.read_debug(DebugRegister::Dr7)?, (0b0111 << 16) | 0b01);

        tracee.write_debug(DebugRegister::Dr7, 0)?;
        tracee.write_debug(DebugRegister::Dr0, 0)?;

        tracee.detach(None)?;
        signal::kill(pid, Signal::SIGKILL)?;
        nix::sys::wait::waitpid(pid, None)?;

        Ok(())
    }
}
