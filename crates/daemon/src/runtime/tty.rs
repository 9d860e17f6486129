//! Processes hosted on a pseudo-terminal.
//!
//! A [`TtyProcess`] owns a single reader thread for its whole life. The
//! thread forwards PTY output to whichever attachment is current; attaching
//! swaps the destination, so an attachment that went away never swallows
//! output meant for the next one.
//!
//! PTY handles are blocking. Output is read on a dedicated thread and input
//! is written through `spawn_blocking`.

use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use super::{Attachment, Resize, RuntimeError, WorkloadSpec};

/// Buffer size for reads from and writes to the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the input pipe between an attachment and the PTY writer.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Output chunks queued for an attachment before the reader thread waits.
const OUTPUT_QUEUE: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where the reader thread delivers output.
#[derive(Default)]
struct OutputRoute {
    current: Option<mpsc::Sender<Bytes>>,
    /// Set once the PTY reached EOF; no attachment will see output again.
    closed: bool,
}

type SharedRoute = Arc<Mutex<OutputRoute>>;

/// A process running on its own pseudo-terminal.
pub(crate) struct TtyProcess {
    label: String,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    /// PTY writers can only be taken once, so attachments share this one.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
    route: SharedRoute,
}

impl TtyProcess {
    /// Spawns `argv` on a new PTY sized from `spec`.
    ///
    /// `label` names the process in logs and in the reader thread's name.
    pub(crate) fn spawn(label: &str, argv: &[String], spec: &WorkloadSpec) -> Result<Self, String> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| e.to_string())?;

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| "empty command line".to_string())?;
        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = spec.cwd {
            cmd.cwd(dir);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| e.to_string())?;
        let pid = child.process_id();

        let writer = pair.master.take_writer().map_err(|e| e.to_string())?;
        let reader = pair.master.try_clone_reader().map_err(|e| e.to_string())?;

        let route = SharedRoute::default();
        let thread_route = Arc::clone(&route);
        let thread_label = label.to_string();
        std::thread::Builder::new()
            .name(format!("tty-{label}"))
            .spawn(move || forward_output(&thread_label, reader, &thread_route))
            .map_err(|e| e.to_string())?;

        tracing::info!(workload_id = %label, pid = ?pid, "Spawned PTY process");
        Ok(Self {
            label: label.to_string(),
            master: Arc::new(Mutex::new(pair.master)),
            writer: Arc::new(Mutex::new(writer)),
            child: Mutex::new(child),
            pid,
            route,
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(lock(&self.child).try_wait(), Ok(None))
    }

    /// Opens a new attachment, ending the output of the previous one.
    pub(crate) fn attach(&self) -> Result<Attachment, String> {
        let (sender, chunks) = mpsc::channel(OUTPUT_QUEUE);
        {
            let mut route = lock(&self.route);
            if route.closed {
                return Err("terminal output has ended".to_string());
            }
            if route.current.replace(sender).is_some() {
                tracing::debug!(workload_id = %self.label, "Replaced previous attachment");
            }
        }

        let (input, input_pump) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(pump_input(
            self.label.clone(),
            Arc::clone(&self.writer),
            input_pump,
        ));

        Ok(Attachment {
            output: Box::new(OutputReader {
                chunks,
                pending: Bytes::new(),
            }),
            input: Box::new(input),
            resizer: Box::new(TtyResizer {
                master: Arc::clone(&self.master),
            }),
        })
    }

    /// Kills and reaps the process, waiting at most `timeout`.
    pub(crate) async fn terminate(self, timeout: Duration) -> Result<(), String> {
        let mut child = self.child.into_inner().unwrap_or_else(PoisonError::into_inner);
        if !matches!(child.try_wait(), Ok(None)) {
            return Ok(());
        }

        child.kill().map_err(|e| e.to_string())?;

        let reap = tokio::task::spawn_blocking(move || child.wait());
        match tokio::time::timeout(timeout, reap).await {
            Ok(Ok(Ok(status))) => {
                tracing::info!(
                    workload_id = %self.label,
                    pid = ?self.pid,
                    exit_code = status.exit_code(),
                    "PTY process stopped"
                );
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("process did not exit within {timeout:?}")),
        }
    }
}

/// Reader thread body: forwards PTY output until EOF.
fn forward_output(label: &str, mut reader: Box<dyn Read + Send>, route: &SharedRoute) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(workload_id = %label, "PTY EOF");
                break;
            }
            Ok(n) => deliver(route, Bytes::copy_from_slice(&buffer[..n])),
            Err(e) => {
                // Linux reports EIO once the child side of the PTY is gone.
                tracing::debug!(workload_id = %label, error = %e, "PTY read ended");
                break;
            }
        }
    }

    let mut route = lock(route);
    route.closed = true;
    route.current = None;
}

/// Hands `chunk` to the current attachment. Output produced while nobody is
/// attached is dropped, as on a terminal with no viewer.
fn deliver(route: &SharedRoute, mut chunk: Bytes) {
    loop {
        let Some(sender) = lock(route).current.clone() else {
            return;
        };
        match sender.blocking_send(chunk) {
            Ok(()) => return,
            Err(mpsc::error::SendError(returned)) => {
                chunk = returned;
                let mut route = lock(route);
                if route
                    .current
                    .as_ref()
                    .is_some_and(|current| current.same_channel(&sender))
                {
                    route.current = None;
                }
            }
        }
    }
}

/// Async view of the output chunks routed to one attachment.
struct OutputReader {
    chunks: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl AsyncRead for OutputReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match ready!(self.chunks.poll_recv(cx)) {
                Some(chunk) => self.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

/// Pumps bytes from `pipe` into the PTY writer until the attachment input is
/// shut down or the PTY stops accepting writes.
async fn pump_input(label: String, writer: Arc<Mutex<Box<dyn Write + Send>>>, mut pipe: DuplexStream) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        let data = buf[..n].to_vec();
        let writer = Arc::clone(&writer);
        let result = tokio::task::spawn_blocking(move || {
            let mut writer = lock(&writer);
            writer.write_all(&data)?;
            writer.flush()
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(workload_id = %label, error = %e, "PTY write failed");
                break;
            }
            Err(e) => {
                tracing::error!(workload_id = %label, error = %e, "PTY write task panicked");
                break;
            }
        }
    }
}

struct TtyResizer {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
}

impl Resize for TtyResizer {
    fn resize(&self, rows: u16, cols: u16) -> Result<(), RuntimeError> {
        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RuntimeError::ResizeFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    fn shell() -> Vec<String> {
        vec!["/bin/sh".to_string()]
    }

    async fn read_until(output: &mut super::super::WorkloadOutput, marker: &str) -> String {
        let mut seen = String::new();
        let mut buf = [0u8; 1024];
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), output.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => break,
                Ok(Ok(n)) => {
                    seen.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if seen.contains(marker) {
                        break;
                    }
                }
                Err(_) => {}
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_reattach_receives_every_line() {
        let process = TtyProcess::spawn("tty-test", &shell(), &WorkloadSpec::default()).unwrap();

        for _ in 0..3 {
            let attachment = process.attach().unwrap();
            drop(attachment);
        }

        let mut attachment = process.attach().unwrap();
        for i in 0..5 {
            attachment
                .input
                .write_all(format!("echo \"line\"\"_{i}\"\n").as_bytes())
                .await
                .unwrap();
        }

        // The typed command echoes as `"line""_N"`, so only real output matches.
        let seen = read_until(&mut attachment.output, "line_4").await;
        for i in 0..5 {
            assert!(
                seen.contains(&format!("line_{i}")),
                "missing line {i} in {seen:?}"
            );
        }

        process.terminate(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_new_attachment_ends_previous_output() {
        let process = TtyProcess::spawn("tty-test", &shell(), &WorkloadSpec::default()).unwrap();

        let mut first = process.attach().unwrap();
        let _second = process.attach().unwrap();

        // Chunks queued before the switch may still drain; then the stream ends.
        let mut drained = Vec::new();
        timeout(Duration::from_secs(1), first.output.read_to_end(&mut drained))
            .await
            .unwrap()
            .unwrap();

        process.terminate(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_ends_output_and_refuses_attach() {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 0".to_string()];
        let process = TtyProcess::spawn("tty-test", &argv, &WorkloadSpec::default()).unwrap();

        for _ in 0..50 {
            if lock(&process.route).closed && !process.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!process.is_running());
        assert!(process.attach().is_err());
        process.terminate(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_output_reader_splits_large_chunks() {
        let (sender, chunks) = mpsc::channel(1);
        let mut reader = OutputReader {
            chunks,
            pending: Bytes::new(),
        };
        sender.send(Bytes::from_static(b"abcdef")).await.unwrap();
        drop(sender);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }
}
