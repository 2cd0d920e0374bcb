//! # childproc
//!
//! **Purpose**: Run one external command as a child process and stream its
//! output and exit status back through callbacks
//!
//! ## Features
//!
//! - **Shell Spawning**: Commands run through `/bin/sh -c`, optionally inside a
//!   working directory, in their own process group
//! - **Descriptor Isolation**: Only the requested stdio pipes reach the child
//! - **Output Streaming**: One reader thread per captured stream, chunked by
//!   `buffer_size`
//! - **Exit Notification**: A shared SIGCHLD dispatcher delivers each child's
//!   exit status exactly once, whether or not anyone calls `wait`
//! - **Safe Teardown**: `wait`, `close`, `kill` and drop may race freely; pipes
//!   are released exactly once
//!
//! ## Usage
//!
//! ```rust,no_run
//! use childproc::{Process, ProcessConfig};
//!
//! let process = Process::spawn(
//!     ProcessConfig::new("cat")
//!         .open_stdin(true)
//!         .on_stdout(|bytes| print!("{}", String::from_utf8_lossy(bytes)))
//!         .on_exit(|status| println!("cat exited with {}", status)),
//! );
//!
//! process.write_str("hello\n")?;
//! process.close_stdin();
//! assert_eq!(process.wait(), 0);
//! # Ok::<(), childproc::ProcessError>(())
//! ```

#![cfg(unix)]

pub mod config;
pub mod error;
pub mod notifier;
pub mod process;
mod reader;
mod spawn;
pub mod status;

pub use config::{ProcessConfig, DEFAULT_BUFFER_SIZE, DEFAULT_SHELL};
pub use error::{ProcessError, Result};
pub use notifier::ExitNotifier;
pub use process::{Process, INVALID_ID};
pub use spawn::escape_single_quoted;
pub use status::INVALID_STATUS;
