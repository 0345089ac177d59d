/*
 * Copyright (c) Watchman Contributors.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Thread enumeration from `/proc/<pid>/task`.
//!
//! The task list is inherently racy: threads may appear or vanish between
//! the read and any later use. The returned snapshot is best-effort, and
//! every caller must treat "tid no longer exists" as non-fatal at each
//! subsequent step (attach, interrupt, detach).

use nix::unistd::Pid;
use thiserror::Error;
use tracing::debug;

/// The target's task directory could not be read, most commonly because the
/// process is gone.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct ThreadsError(#[from] procfs::ProcError);

/// Lists the current thread IDs of `pid`, read fresh from procfs.
pub fn list_threads(pid: Pid) -> Result<Vec<Pid>, ThreadsError> {
    let process = procfs::process::Process::new(pid.as_raw())?;
    let mut tids = Vec::new();
    for task in process.tasks()? {
        match task {
            Ok(task) => tids.push(Pid::from_raw(task.tid)),
            // a task that exits mid-enumeration is not an error
            Err(err) => debug!(%err, "task vanished during enumeration"),
        }
    }
    Ok(tids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_our_own_threads() {
        let me = Pid::this();
        let tids = list_threads(me).unwrap();
        assert!(tids.contains(&me));
    }

    #[test]
    fn missing_process_is_an_error() {
        // pid 0 never names a real process in procfs
        assert!(list_threads(Pid::from_raw(0)).is_err());
    }
}
