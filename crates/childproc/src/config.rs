//! Process configuration

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Default read-chunk size for the output callbacks
pub const DEFAULT_BUFFER_SIZE: usize = 131_072;

/// Shell used to interpret the command string
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Completion callback, receives the exit status
pub type ExitCallback = Box<dyn FnOnce(i32) + Send + 'static>;

/// Output callback, receives each chunk read from the stream
pub type OutputCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// Configuration for spawning a process
pub struct ProcessConfig {
    /// Command string handed to the shell
    pub command: String,
    /// Working directory (None = current dir)
    pub working_dir: Option<PathBuf>,
    /// Shell interpreter invoked as `<shell> -c <script>`
    pub shell: PathBuf,
    /// Environment variables (added to parent env)
    pub env: HashMap<String, String>,
    /// Keep a pipe to the child's stdin open for writing
    pub open_stdin: bool,
    /// Maximum bytes delivered per output callback invocation
    pub buffer_size: usize,
    pub(crate) on_exit: Option<ExitCallback>,
    pub(crate) on_stdout: Option<OutputCallback>,
    pub(crate) on_stderr: Option<OutputCallback>,
}

impl ProcessConfig {
    /// Create new process configuration
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            shell: PathBuf::from(DEFAULT_SHELL),
            env: HashMap::new(),
            open_stdin: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            on_exit: None,
            on_stdout: None,
            on_stderr: None,
        }
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the shell interpreter
    pub fn shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Enable/disable the stdin pipe
    pub fn open_stdin(mut self, open: bool) -> Self {
        self.open_stdin = open;
        self
    }

    /// Set the read-chunk size
    ///
    /// A size of zero is treated as one byte.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Called exactly once with the exit status when the child is reaped
    pub fn on_exit<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(i32) + Send + 'static,
    {
        self.on_exit = Some(Box::new(callback));
        self
    }

    /// Capture stdout and stream it to `callback`
    pub fn on_stdout<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.on_stdout = Some(Box::new(callback));
        self
    }

    /// Capture stderr and stream it to `callback`
    pub fn on_stderr<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.on_stderr = Some(Box::new(callback));
        self
    }

    /// Whether stdout will be captured
    pub fn captures_stdout(&self) -> bool {
        self.on_stdout.is_some()
    }

    /// Whether stderr will be captured
    pub fn captures_stderr(&self) -> bool {
        self.on_stderr.is_some()
    }
}

impl fmt::Debug for ProcessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessConfig")
            .field("command", &self.command)
            .field("working_dir", &self.working_dir)
            .field("shell", &self.shell)
            .field("env", &self.env)
            .field("open_stdin", &self.open_stdin)
            .field("buffer_size", &self.buffer_size)
            .field("on_exit", &self.on_exit.is_some())
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}
