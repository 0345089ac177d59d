/*
 * Copyright (c) Watchman Contributors.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Typed access to the x86-64 debug-register area of `struct user`.
//!
//! The kernel exposes DR0..DR7 of a stopped tracee through
//! `PTRACE_PEEKUSER`/`PTRACE_POKEUSER` at `offsetof(struct user,
//! u_debugreg[i])`. This module is the only place that offset arithmetic
//! exists; everything else addresses registers by name or by validated slot
//! index.

use std::mem;

use nix::sys::ptrace;
use nix::sys::ptrace::AddressType;

use crate::Error;
use crate::Stopped;

/// One of the per-thread x86-64 debug registers reachable through the ptrace
/// user area. DR4 and DR5 are aliases of DR6/DR7 and intentionally absent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DebugRegister {
    /// Watchpoint address register, hardware slot 0.
    Dr0,
    /// Watchpoint address register, hardware slot 1.
    Dr1,
    /// Watchpoint address register, hardware slot 2.
    Dr2,
    /// Watchpoint address register, hardware slot 3.
    Dr3,
    /// Debug status register: reports which slot fired.
    Dr6,
    /// Debug control register: arms the slots.
    Dr7,
}

impl DebugRegister {
    /// The address register belonging to a hardware slot.
    ///
    /// Panics if `index` is not a valid slot (0..4); slot indices come from
    /// validated registries and decoded status words only.
    pub fn slot(index: usize) -> Self {
        match index {
            0 => Self::Dr0,
            1 => Self::Dr1,
            2 => Self::Dr2,
            3 => Self::Dr3,
            _ => panic!("debug register slot out of range: {}", index),
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Dr0 => 0,
            Self::Dr1 => 1,
            Self::Dr2 => 2,
            Self::Dr3 => 3,
            Self::Dr6 => 6,
            Self::Dr7 => 7,
        }
    }

    fn offset(self) -> usize {
        mem::offset_of!(libc::user, u_debugreg)
            + self.index() * mem::size_of::<libc::c_ulonglong>()
    }
}

impl Stopped {
    /// Reads a debug register of the stopped tracee.
    pub fn read_debug(&self, reg: DebugRegister) -> Result<u64, Error> {
        ptrace::read_user(self.pid(), reg.offset() as AddressType)
            .map(|word| word as u64)
            .map_err(|err| self.map_err(err))
    }

    /// Writes a debug register of the stopped tracee. The kernel validates
    /// the value (DR7 reserved bits, canonical DR0..DR3 addresses) and the
    /// write fails with EINVAL if it is malformed.
    pub fn write_debug(&self, reg: DebugRegister, value: u64) -> Result<(), Error> {
        unsafe { ptrace::write_user(self.pid(), reg.offset() as AddressType, value as libc::c_long) }
            .map_err(|err| self.map_err(err))
    }

    /// Reads one machine word from the tracee's memory. Used for the post-hit
    /// diagnostic read of a watched address.
    pub fn read_data(&self, addr: u64) -> Result<u64, Error> {
        ptrace::read(self.pid(), addr as AddressType)
            .map(|word| word as u64)
            .map_err(|err| self.map_err(err))
    }
}
