//! Process-wide child-exit notification
//!
//! A single SIGCHLD handler wakes a dispatcher thread. The dispatcher takes a
//! snapshot of the live exit watches under the registry lock, releases the
//! lock, and polls each watch with a non-blocking reap. Exit callbacks run on
//! the dispatcher thread, never inside the signal handler.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use signal_hook::consts::SIGCHLD;
use signal_hook::iterator::{Handle, Signals};
use tracing::{debug, warn};

use crate::config::ExitCallback;
use crate::error::{ProcessError, Result};
use crate::status::exit_code;

static GLOBAL: Lazy<Arc<ExitNotifier>> = Lazy::new(|| match ExitNotifier::with_signals() {
    Ok(notifier) => notifier,
    Err(e) => {
        warn!(error = %e, "Exit notifications disabled; only blocking waits will report exits");
        Arc::new(ExitNotifier::new())
    }
});

/// Exit state of one child, shared between its `Process` and the notifier.
pub(crate) struct ExitWatch {
    pid: OnceCell<i32>,
    /// Held for the whole of a reap; stores the decoded status afterwards.
    status: Mutex<Option<i32>>,
    /// Set by a poll that found `status` locked.
    recheck: AtomicBool,
    /// Set as soon as `waitpid` collects the child, before `status` is filled.
    reaped: AtomicBool,
    on_exit: Mutex<Option<ExitCallback>>,
}

impl ExitWatch {
    pub(crate) fn new(on_exit: Option<ExitCallback>) -> Self {
        Self {
            pid: OnceCell::new(),
            status: Mutex::new(None),
            recheck: AtomicBool::new(false),
            reaped: AtomicBool::new(false),
            on_exit: Mutex::new(on_exit),
        }
    }

    /// Publish the child's id. Only the first call has an effect.
    pub(crate) fn set_pid(&self, pid: i32) -> bool {
        self.pid.set(pid).is_ok()
    }

    pub(crate) fn pid(&self) -> Option<i32> {
        self.pid.get().copied()
    }

    /// Recorded exit status, if the child has been reaped.
    ///
    /// Returns `None` while a reap is in progress.
    pub(crate) fn status(&self) -> Option<i32> {
        self.status.try_lock().and_then(|status| *status)
    }

    /// Call `signal` with the child's id unless the child has been reaped.
    ///
    /// When nobody holds the reap lock the call runs under it, so no reap can
    /// free the id in between. Returns whether `signal` was called.
    pub(crate) fn with_live_pid(&self, signal: impl FnOnce(i32)) -> bool {
        let Some(pid) = self.pid() else {
            return false;
        };

        match self.status.try_lock() {
            Some(status) if status.is_some() => false,
            Some(_status) => {
                signal(pid);
                true
            }
            // A blocking wait or a poll holds the lock.
            None if self.reaped.load(Ordering::SeqCst) => false,
            None => {
                signal(pid);
                true
            }
        }
    }

    /// Reap the child if it has exited, without blocking.
    pub(crate) fn poll(&self) {
        let Some(pid) = self.pid() else {
            return;
        };

        let mut flagged = false;
        loop {
            match self.status.try_lock() {
                Some(mut status) => {
                    flagged = false;
                    let reaped = if status.is_none() {
                        self.reap_child(pid, Some(WaitPidFlag::WNOHANG))
                    } else {
                        None
                    };
                    if reaped.is_some() {
                        *status = reaped;
                    }
                    drop(status);

                    if let Some(code) = reaped {
                        self.notify(pid, code);
                    }
                    if !self.recheck.swap(false, Ordering::SeqCst) {
                        return;
                    }
                }
                // Whoever holds the lock now re-runs the poll after releasing it.
                None if flagged => return,
                None => {
                    self.recheck.store(true, Ordering::SeqCst);
                    flagged = true;
                }
            }
        }
    }

    /// Block until the child exits and return its status.
    ///
    /// Returns `None` if there is no child or it was reaped elsewhere.
    pub(crate) fn wait(&self) -> Option<i32> {
        let pid = self.pid()?;

        let mut status = self.status.lock();
        if let Some(code) = *status {
            return Some(code);
        }
        let code = self.reap_child(pid, None)?;
        *status = Some(code);
        drop(status);

        self.recheck.store(false, Ordering::SeqCst);
        self.notify(pid, code);
        Some(code)
    }

    /// Must be called with `status` locked.
    fn reap_child(&self, pid: i32, flags: Option<WaitPidFlag>) -> Option<i32> {
        let code = reap(pid, flags)?;
        self.reaped.store(true, Ordering::SeqCst);
        Some(code)
    }

    fn notify(&self, pid: i32, code: i32) {
        let callback = self.on_exit.lock().take();
        debug!(pid = %pid, status = code, "Process exited");
        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(code))).is_err() {
                warn!(pid = %pid, "Exit callback panicked");
            }
        }
    }
}

/// Wait on `pid`, retrying interrupted calls. `None` if still running or gone.
fn reap(pid: i32, flags: Option<WaitPidFlag>) -> Option<i32> {
    loop {
        match waitpid(Pid::from_raw(pid), flags) {
            Ok(WaitStatus::StillAlive) => return None,
            Ok(status) => {
                if let Some(code) = exit_code(status) {
                    return Some(code);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                debug!(pid = %pid, error = %e, "waitpid failed");
                return None;
            }
        }
    }
}

/// Registry of live processes awaiting exit notification.
///
/// The process-wide instance returned by [`ExitNotifier::global`] installs a
/// SIGCHLD handler on first use and is shared by every
/// [`Process`](crate::Process).
pub struct ExitNotifier {
    live: Mutex<HashMap<u64, Weak<ExitWatch>>>,
    next_token: AtomicU64,
    signals: Mutex<Option<Handle>>,
}

impl ExitNotifier {
    /// Create a registry without a signal handler; exits are only noticed
    /// when [`dispatch`](Self::dispatch) is called.
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            signals: Mutex::new(None),
        }
    }

    /// Create a registry dispatched from a SIGCHLD handler on its own thread.
    pub fn with_signals() -> Result<Arc<Self>> {
        let mut signals =
            Signals::new([SIGCHLD]).map_err(|e| ProcessError::SignalHandler(e.to_string()))?;

        let notifier = Arc::new(Self::new());
        *notifier.signals.lock() = Some(signals.handle());

        let weak = Arc::downgrade(&notifier);
        thread::Builder::new()
            .name("childproc-exit".to_string())
            .spawn(move || {
                for _ in signals.forever() {
                    match weak.upgrade() {
                        Some(notifier) => notifier.dispatch(),
                        None => break,
                    }
                }
                debug!("Exit dispatcher stopped");
            })
            .map_err(|e| ProcessError::SignalHandler(e.to_string()))?;

        debug!("Installed SIGCHLD dispatcher");
        Ok(notifier)
    }

    /// The process-wide notifier
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    pub(crate) fn register(&self, watch: &Arc<ExitWatch>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(token, Arc::downgrade(watch));
        token
    }

    pub(crate) fn unregister(&self, token: u64) {
        self.live.lock().remove(&token);
    }

    /// Poll every live process and deliver exit callbacks for those that
    /// have exited.
    pub fn dispatch(&self) {
        let snapshot: Vec<Arc<ExitWatch>> = {
            let mut live = self.live.lock();
            live.retain(|_, watch| watch.strong_count() > 0);
            live.values().filter_map(Weak::upgrade).collect()
        };

        for watch in snapshot {
            watch.poll();
        }
    }

    /// Number of registered processes
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Whether no process is registered
    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    /// Stop the dispatcher thread, if any. Registered processes can still be
    /// waited on.
    pub fn shutdown(&self) {
        if let Some(handle) = self.signals.lock().take() {
            handle.close();
        }
    }
}

impl Default for ExitNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExitNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ExitNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitNotifier")
            .field("live", &self.len())
            .field("signals", &self.signals.lock().is_some())
            .finish()
    }
}
