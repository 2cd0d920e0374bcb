//! Shared helpers for the childproc integration tests

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Install a test-friendly tracing subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Accumulates every chunk handed to an output callback
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    bytes: Arc<Mutex<Vec<u8>>>,
    chunks: Arc<Mutex<usize>>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback suitable for `ProcessConfig::on_stdout` / `on_stderr`
    pub fn callback(&self) -> impl FnMut(&[u8]) + Send + 'static {
        let bytes = Arc::clone(&self.bytes);
        let chunks = Arc::clone(&self.chunks);
        move |chunk: &[u8]| {
            bytes.lock().extend_from_slice(chunk);
            *chunks.lock() += 1;
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    pub fn chunk_count(&self) -> usize {
        *self.chunks.lock()
    }
}

/// Records exit callback invocations
#[derive(Debug)]
pub struct ExitRecorder {
    rx: mpsc::Receiver<i32>,
    tx: Option<mpsc::Sender<i32>>,
}

impl ExitRecorder {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { rx, tx: Some(tx) }
    }

    /// Callback suitable for `ProcessConfig::on_exit`
    pub fn callback(&self) -> impl FnOnce(i32) + Send + 'static {
        let tx = self.tx.clone();
        move |status| {
            if let Some(tx) = tx {
                let _ = tx.send(status);
            }
        }
    }

    /// Wait for the next exit status
    pub fn next(&self, timeout: Duration) -> Option<i32> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Every status delivered so far, once all callbacks have been dropped
    pub fn drain(mut self) -> Vec<i32> {
        self.tx.take();
        self.rx.try_iter().collect()
    }
}

impl Default for ExitRecorder {
    fn default() -> Self {
        Self::new()
    }
}
