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

//! Hardware-watchpoint controller for live processes.
//!
//! Given a running multi-threaded process and up to four watched addresses,
//! the engine attaches to every thread, programs the x86-64 debug registers
//! so a trap fires on any write to a watched address, and notifies the
//! target in-band (SIGUSR2) on every hit so it can e.g. dump a backtrace
//! without halting. Shutdown freezes the target, drains in-flight traps,
//! clears every register and detaches, leaving the target exactly as
//! runnable as before.
//!
//! A single control flow drives everything: a ptrace relationship is scoped
//! to the attaching task, so one blocking wait is multiplexed across all
//! tracees rather than spawning a controller per thread.

pub mod cancel;
pub mod hwdebug;
pub mod shutdown;
pub mod threads;
pub mod tracer;
pub mod watch;

pub use watchman_trace as trace;

pub use crate::tracer::Engine;
pub use crate::tracer::NOTIFY_SIGNAL;
pub use crate::tracer::RunOutcome;
