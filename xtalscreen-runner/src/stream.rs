use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Default)]
struct Captured {
    buffer: Mutex<Vec<u8>>,
    finished: AtomicBool,
}

impl Captured {
    fn buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drains one output stream of a child process on its own task.
///
/// The reader is the only writer of its buffer; callers may poll
/// [`has_finished`](Self::has_finished) and take snapshots with
/// [`output`](Self::output) at any time without blocking the reader.
pub struct StreamReader {
    kind: StreamKind,
    captured: Arc<Captured>,
    handle: JoinHandle<()>,
}

impl StreamReader {
    /// Start draining `stream`. With `echo` set, every complete line is also
    /// logged as it arrives.
    pub fn spawn<R>(stream: R, kind: StreamKind, echo: bool) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let captured = Arc::new(Captured::default());
        let handle = tokio::spawn(drain(stream, kind, echo, Arc::clone(&captured)));
        Self {
            kind,
            captured,
            handle,
        }
    }

    pub fn has_finished(&self) -> bool {
        self.captured.finished.load(Ordering::Acquire)
    }

    /// Everything read so far
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.captured.buffer()).into_owned()
    }

    /// Wait up to `grace` for the stream to close, then stop the reader and
    /// return what it captured.
    pub async fn finish(mut self, grace: Duration) -> String {
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(stream = %self.kind, error = %e, "Stream reader task failed");
            }
            Err(_) => {
                warn!(
                    stream = %self.kind,
                    grace = ?grace,
                    "Stream still open after process exit, using partial output"
                );
                self.handle.abort();
            }
        }
        self.captured.finished.store(true, Ordering::Release);
        self.output()
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn drain<R>(mut stream: R, kind: StreamKind, echo: bool, captured: Arc<Captured>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut pending_line = Vec::new();

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let data = &chunk[..n];
                captured.buffer().extend_from_slice(data);
                if echo {
                    pending_line.extend_from_slice(data);
                    echo_complete_lines(kind, &mut pending_line);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(stream = %kind, error = %e, "Failed to read from child process");
                break;
            }
        }
    }

    if echo && !pending_line.is_empty() {
        info!(stream = %kind, "{}", String::from_utf8_lossy(&pending_line));
    }
    captured.finished.store(true, Ordering::Release);
}

fn echo_complete_lines(kind: StreamKind, pending_line: &mut Vec<u8>) {
    while let Some(end) = pending_line.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = pending_line.drain(..=end).collect();
        info!(stream = %kind, "{}", String::from_utf8_lossy(&line).trim_end());
    }
}
