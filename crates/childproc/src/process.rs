//! Process handle and lifecycle guard

use std::fmt;
use std::io::{self, Write};
use std::process::{ChildStderr, ChildStdin, ChildStdout};
use std::sync::Arc;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    config::{OutputCallback, ProcessConfig},
    error::{ProcessError, Result},
    notifier::{ExitNotifier, ExitWatch},
    reader::{Reader, Stream},
    spawn::{self, SpawnedChild, StdioPlan},
    status::INVALID_STATUS,
};

/// Id reported when no child was created
pub const INVALID_ID: i32 = -1;

/// State guarded by the close mutex
#[derive(Debug)]
struct Lifecycle {
    closed: bool,
    stdout: Option<Reader<ChildStdout>>,
    stderr: Option<Reader<ChildStderr>>,
}

/// One spawned child process.
///
/// Created by [`Process::spawn`], which runs the command through the shell,
/// starts a reader thread per captured stream and registers the child with
/// the process-wide [`ExitNotifier`]. All methods take `&self` and may be
/// called concurrently, e.g. through an `Arc<Process>`.
///
/// Dropping a `Process` closes its pipes and stops exit notification, but
/// does not kill the child. Drop closes stdin and then joins the reader
/// threads, so it blocks until the child (or whatever inherited its output)
/// closes stdout/stderr.
pub struct Process {
    watch: Arc<ExitWatch>,
    notifier: Arc<ExitNotifier>,
    token: u64,
    open_stdin: bool,
    lifecycle: Mutex<Lifecycle>,
    stdin: Mutex<Option<ChildStdin>>,
    spawn_error: Option<io::Error>,
}

impl Process {
    /// Spawn a process.
    ///
    /// Creation failures are not returned; the process then reports
    /// [`INVALID_ID`] from [`id`](Self::id). Use [`try_spawn`](Self::try_spawn)
    /// to get the error instead.
    ///
    /// The exit callback may run before this returns if the child exits
    /// immediately.
    ///
    /// # Examples
    /// ```no_run
    /// use childproc::{Process, ProcessConfig};
    ///
    /// let process = Process::spawn(
    ///     ProcessConfig::new("echo hello")
    ///         .on_stdout(|bytes| print!("{}", String::from_utf8_lossy(bytes)))
    ///         .on_exit(|status| println!("exited with {}", status)),
    /// );
    /// assert_eq!(process.wait(), 0);
    /// ```
    pub fn spawn(config: ProcessConfig) -> Self {
        Self::spawn_with(config, ExitNotifier::global())
    }

    /// Spawn a process, returning the creation error if there is one.
    pub fn try_spawn(config: ProcessConfig) -> Result<Self> {
        let mut process = Self::spawn(config);
        match process.spawn_error.take() {
            Some(e) => Err(ProcessError::SpawnFailed(e)),
            None => Ok(process),
        }
    }

    pub(crate) fn spawn_with(mut config: ProcessConfig, notifier: Arc<ExitNotifier>) -> Self {
        let on_stdout = config.on_stdout.take();
        let on_stderr = config.on_stderr.take();
        let plan = StdioPlan {
            stdin: config.open_stdin,
            stdout: on_stdout.is_some(),
            stderr: on_stderr.is_some(),
        };

        let watch = Arc::new(ExitWatch::new(config.on_exit.take()));
        let token = notifier.register(&watch);

        let mut process = Self {
            watch,
            notifier,
            token,
            open_stdin: config.open_stdin,
            lifecycle: Mutex::new(Lifecycle {
                closed: true,
                stdout: None,
                stderr: None,
            }),
            stdin: Mutex::new(None),
            spawn_error: None,
        };

        match spawn::spawn(&config, plan) {
            Ok(child) => process.attach(child, config.buffer_size, on_stdout, on_stderr),
            Err(e) => {
                warn!(command = %config.command, error = %e, "Failed to spawn process");
                process.spawn_error = Some(e);
            }
        }

        process
    }

    fn attach(
        &mut self,
        child: SpawnedChild,
        buffer_size: usize,
        on_stdout: Option<OutputCallback>,
        on_stderr: Option<OutputCallback>,
    ) {
        let pid = child.pid;
        self.watch.set_pid(pid);
        *self.stdin.get_mut() = child.stdin;

        let lifecycle = self.lifecycle.get_mut();
        lifecycle.closed = false;
        lifecycle.stdout = start_reader(Stream::Stdout, pid, child.stdout, buffer_size, on_stdout);
        lifecycle.stderr = start_reader(Stream::Stderr, pid, child.stderr, buffer_size, on_stderr);

        // The child may have exited before its id was visible to the dispatcher.
        self.watch.poll();
    }

    /// Get process ID, or [`INVALID_ID`] if the child was never created
    pub fn id(&self) -> i32 {
        self.watch.pid().unwrap_or(INVALID_ID)
    }

    /// Whether the process has been waited on or closed
    pub fn is_closed(&self) -> bool {
        self.lifecycle.lock().closed
    }

    /// Wait for the process to exit and return its exit status.
    ///
    /// The status is the exit code, or 128 plus the signal number when the
    /// child was killed by a signal. Returns `-1` immediately when no child
    /// was created. Releases all pipes once the child has exited.
    pub fn wait(&self) -> i32 {
        if self.watch.pid().is_none() {
            return INVALID_STATUS;
        }

        let status = self.watch.wait().unwrap_or(INVALID_STATUS);
        self.lifecycle.lock().closed = true;
        self.release();
        status
    }

    /// Exit status if the child has already exited, without blocking
    pub fn try_wait(&self) -> Option<i32> {
        self.watch.poll();
        self.watch.status()
    }

    /// Write to stdin.
    ///
    /// Fails with [`ProcessError::StdinNotOpen`] if the process was not
    /// configured with `open_stdin`. Otherwise performs a single write and
    /// returns whether it succeeded; partial writes are not retried.
    pub fn write(&self, bytes: &[u8]) -> Result<bool> {
        if !self.open_stdin {
            return Err(ProcessError::StdinNotOpen);
        }

        let mut stdin = self.stdin.lock();
        let Some(pipe) = stdin.as_mut() else {
            return Ok(false);
        };
        match pipe.write(bytes) {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(pid = %self.id(), error = %e, "Write to stdin failed");
                Ok(false)
            }
        }
    }

    /// Write a string to stdin
    pub fn write_str(&self, data: &str) -> Result<bool> {
        self.write(data.as_bytes())
    }

    /// Close stdin, signalling end of input to the child
    pub fn close_stdin(&self) {
        let mut stdin = self.stdin.lock();
        if self.watch.pid().is_some() && stdin.take().is_some() {
            debug!(pid = %self.id(), "Closed stdin");
        }
    }

    /// Kill the process group.
    ///
    /// Sends SIGINT, or SIGTERM when `force` is set. Does nothing once the
    /// process has exited or been closed.
    pub fn kill(&self, force: bool) {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.closed {
            return;
        }
        self.watch.with_live_pid(|pid| Self::kill_id(pid, force));
    }

    /// Kill a process group by raw id.
    ///
    /// Prefer [`kill`](Self::kill) while the `Process` is still around; this
    /// variant cannot know whether the id has been reused.
    pub fn kill_id(id: i32, force: bool) {
        if id <= 0 {
            return;
        }
        let signal = if force { Signal::SIGTERM } else { Signal::SIGINT };
        match killpg(Pid::from_raw(id), signal) {
            Ok(()) => debug!(pid = %id, %signal, "Signalled process group"),
            Err(e) => debug!(pid = %id, %signal, error = %e, "Failed to signal process group"),
        }
    }

    /// Release all pipes now. Idempotent; also done by `wait` and on drop.
    pub fn close(&self) {
        self.lifecycle.lock().closed = true;
        self.release();
    }

    fn release(&self) {
        let (stdout, stderr) = {
            let mut lifecycle = self.lifecycle.lock();
            (lifecycle.stdout.take(), lifecycle.stderr.take())
        };

        let stdout = stdout.and_then(Reader::finish);
        let stderr = stderr.and_then(Reader::finish);

        self.close_stdin();
        drop(stdout);
        drop(stderr);
    }
}

fn start_reader<R>(
    stream: Stream,
    pid: i32,
    source: Option<R>,
    buffer_size: usize,
    callback: Option<OutputCallback>,
) -> Option<Reader<R>>
where
    R: io::Read + Send + 'static,
{
    let (source, callback) = source.zip(callback)?;
    match Reader::start(stream, pid, source, buffer_size, callback) {
        Ok(reader) => Some(reader),
        Err(e) => {
            warn!(pid = %pid, ?stream, error = %e, "Failed to start output reader");
            None
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.notifier.unregister(self.token);
        // Nobody can write any more; let a child blocked on input finish.
        self.close_stdin();
        self.release();
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .field("open_stdin", &self.open_stdin)
            .finish()
    }
}
