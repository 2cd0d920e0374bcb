//! Background readers forwarding captured output to callbacks

use std::io::{self, Read};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::config::OutputCallback;

/// Captured output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// A running reader thread.
///
/// The thread owns the pipe end while it runs and hands it back when it
/// finishes, so the descriptor can only be closed after the reader is done.
#[derive(Debug)]
pub(crate) struct Reader<R> {
    stream: Stream,
    thread: JoinHandle<R>,
}

impl<R: Read + Send + 'static> Reader<R> {
    /// Start reading `source` in chunks of at most `buffer_size` bytes.
    pub(crate) fn start(
        stream: Stream,
        pid: i32,
        mut source: R,
        buffer_size: usize,
        mut callback: OutputCallback,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("childproc-{}-{}", stream.as_str(), pid))
            .spawn(move || {
                let mut buffer = vec![0u8; buffer_size.max(1)];
                loop {
                    match source.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(n) => callback(&buffer[..n]),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!(pid = %pid, stream = stream.as_str(), error = %e, "Read failed");
                            break;
                        }
                    }
                }
                debug!(pid = %pid, stream = stream.as_str(), "Reached end of stream");
                source
            })?;

        Ok(Self { stream, thread })
    }

    /// Wait for the reader to reach end of stream and take back the pipe end.
    ///
    /// Returns `None` if called from the reader thread itself (teardown from
    /// inside an output callback) or if the callback panicked; the pipe end is
    /// then released when the thread unwinds or finishes.
    pub(crate) fn finish(self) -> Option<R> {
        if self.thread.thread().id() == thread::current().id() {
            debug!(stream = self.stream.as_str(), "Skipping join from inside reader");
            return None;
        }
        match self.thread.join() {
            Ok(source) => Some(source),
            Err(_) => {
                debug!(stream = self.stream.as_str(), "Reader callback panicked");
                None
            }
        }
    }
}
