//! Wait status decoding

use nix::sys::wait::WaitStatus;

/// Status reported when no child could be waited on
pub const INVALID_STATUS: i32 = -1;

/// Offset added to the signal number for children killed by a signal,
/// matching the convention shells use for `$?`.
pub const SIGNAL_EXIT_BASE: i32 = 128;

/// Convert a terminal wait status into an integer exit status.
///
/// Returns `None` for non-terminal states (still alive, stopped, continued).
pub(crate) fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(SIGNAL_EXIT_BASE + signal as i32),
        _ => None,
    }
}
