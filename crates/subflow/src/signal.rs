// SPDX-License-Identifier: MIT OR Apache-2.0
//! Platform glue for stopping a child and describing how it ended.

use std::process::ExitStatus;
use tokio::process::Child;
use tracing::debug;

/// Ask `child` to stop: `SIGTERM` on Unix, an immediate kill elsewhere.
///
/// A child that is already gone is not an error.
pub(crate) fn request_stop(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            force_kill(child);
            return;
        };
        match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => debug!(target: "subflow", pid, "sent SIGTERM"),
            Err(Errno::ESRCH) => {}
            Err(e) => {
                debug!(target: "subflow", pid, error = %e, "SIGTERM failed; killing");
                force_kill(child);
            }
        }
    }

    #[cfg(not(unix))]
    force_kill(child);
}

/// Kill `child` without waiting for it (`SIGKILL` on Unix).
pub(crate) fn force_kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(target: "subflow", error = %e, "kill failed");
    }
}

/// Signal that terminated the process, when the platform reports one.
pub(crate) fn terminating_signal(status: &ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    }

    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}
