//! Child creation: shell script construction, pipe wiring and descriptor isolation

use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::thread;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;

/// Replacement for `'` inside a single-quoted shell word: close, escape, reopen.
const QUOTE_ESCAPE: &str = "'\\''";

/// First descriptor above the standard streams
const FIRST_INHERITED_FD: libc::c_int = 3;

#[cfg(target_os = "linux")]
const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Fallback upper bound when `_SC_OPEN_MAX` is unavailable
const FALLBACK_OPEN_MAX: libc::c_int = 1024;

/// Forks happen on this thread. It never exits, so the child's parent-death
/// signal only fires when the whole parent process dies.
static SPAWNER: Lazy<Option<Mutex<mpsc::Sender<SpawnJob>>>> = Lazy::new(start_spawner);

struct SpawnJob {
    command: Command,
    reply: mpsc::Sender<io::Result<Child>>,
}

fn start_spawner() -> Option<Mutex<mpsc::Sender<SpawnJob>>> {
    let (jobs, queue) = mpsc::channel::<SpawnJob>();
    let started = thread::Builder::new()
        .name("childproc-spawner".to_string())
        .spawn(move || {
            for mut job in queue {
                let _ = job.reply.send(job.command.spawn());
            }
        });

    match started {
        Ok(_) => Some(Mutex::new(jobs)),
        Err(e) => {
            warn!(error = %e, "Spawner thread unavailable; forking from the calling thread");
            None
        }
    }
}

/// Run `command.spawn()` on the spawner thread.
fn spawn_on_spawner(mut command: Command) -> io::Result<Child> {
    let Some(spawner) = SPAWNER.as_ref() else {
        return command.spawn();
    };

    let (reply, result) = mpsc::channel();
    let sent = spawner.lock().send(SpawnJob { command, reply });
    if let Err(mpsc::SendError(mut job)) = sent {
        warn!("Spawner thread stopped; forking from the calling thread");
        return job.command.spawn();
    }
    result
        .recv()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "spawner thread stopped"))?
}

/// Escape `value` for use between single quotes in a POSIX shell.
///
/// ```
/// assert_eq!(childproc::escape_single_quoted("it's"), "it'\\''s");
/// ```
pub fn escape_single_quoted(value: &str) -> String {
    value.replace('\'', QUOTE_ESCAPE)
}

/// Build the script passed to `sh -c`.
pub(crate) fn shell_script(command: &str, working_dir: Option<&Path>) -> OsString {
    let Some(dir) = working_dir else {
        return OsString::from(command);
    };

    let mut script = Vec::with_capacity(command.len() + dir.as_os_str().len() + 16);
    script.extend_from_slice(b"cd '");
    for &byte in dir.as_os_str().as_bytes() {
        if byte == b'\'' {
            script.extend_from_slice(QUOTE_ESCAPE.as_bytes());
        } else {
            script.push(byte);
        }
    }
    script.extend_from_slice(b"' && ");
    script.extend_from_slice(command.as_bytes());
    OsString::from_vec(script)
}

/// Which standard streams get a pipe to the parent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StdioPlan {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl StdioPlan {
    fn apply(&self, command: &mut Command) {
        // Streams without a pipe are inherited from the parent.
        let pick = |piped: bool| if piped { Stdio::piped() } else { Stdio::inherit() };
        command.stdin(pick(self.stdin));
        command.stdout(pick(self.stdout));
        command.stderr(pick(self.stderr));
    }
}

/// Parent-side ends of a freshly created child.
///
/// Each end is exclusively owned; dropping it closes the descriptor.
#[derive(Debug)]
pub(crate) struct SpawnedChild {
    pub pid: i32,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Create the child process described by `config`.
///
/// On error no child exists and every pipe created along the way has been
/// closed again.
pub(crate) fn spawn(config: &ProcessConfig, plan: StdioPlan) -> io::Result<SpawnedChild> {
    debug!(
        command = %config.command,
        working_dir = ?config.working_dir,
        ?plan,
        "Spawning process"
    );

    let mut command = Command::new(&config.shell);
    command
        .arg("-c")
        .arg(shell_script(&config.command, config.working_dir.as_deref()))
        .envs(&config.env)
        .process_group(0);
    plan.apply(&mut command);

    // SAFETY: the hook runs in the forked child before exec and only issues
    // async-signal-safe system calls; it does not allocate or take locks.
    unsafe {
        command.pre_exec(|| {
            #[cfg(target_os = "linux")]
            nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGTERM)?;
            mark_inherited_fds_cloexec();
            Ok(())
        });
    }

    let mut child = spawn_on_spawner(command)?;
    let pid = i32::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "process id out of range"))?;

    let spawned = SpawnedChild {
        pid,
        stdin: child.stdin.take(),
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
    };

    info!(pid = %pid, command = %config.command, "Process spawned");
    Ok(spawned)
}

/// Mark every descriptor above the standard three close-on-exec, so the
/// command inherits nothing but its stdio.
fn mark_inherited_fds_cloexec() {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: close_range with CLOSE_RANGE_CLOEXEC only updates descriptor flags.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                FIRST_INHERITED_FD as libc::c_uint,
                libc::c_uint::MAX,
                CLOSE_RANGE_CLOEXEC,
            )
        };
        if rc == 0 {
            return;
        }
    }

    // SAFETY: sysconf has no memory-safety preconditions.
    let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let open_max = if open_max <= 0 {
        FALLBACK_OPEN_MAX
    } else {
        libc::c_int::try_from(open_max).unwrap_or(libc::c_int::MAX)
    };

    for fd in FIRST_INHERITED_FD..open_max {
        // SAFETY: F_SETFD on an unused descriptor fails with EBADF and has no other effect.
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
}
