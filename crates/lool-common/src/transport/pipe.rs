//! Async line I/O over named pipes (FIFOs).
//!
//! Writers open the FIFO read-write so a write never fails just because the
//! peer has not attached yet; readers poll with a bounded timeout so their
//! loops can observe the shutdown token between reads. EOF and `EPIPE` both
//! surface as [`PipeError::Closed`], which the worker treats as "supervisor
//! is gone" and exits cleanly.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("pipe I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipe closed by peer")]
    Closed,
}

/// Creates the FIFO at `path` if it does not already exist.
pub fn ensure_fifo(path: &Path) -> std::io::Result<()> {
    use nix::sys::stat::Mode;

    match nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

/// Serialized line writer on a FIFO.
pub struct PipeWriter {
    sender: Mutex<pipe::Sender>,
}

impl PipeWriter {
    /// Opens `path` for writing.
    ///
    /// The descriptor is opened read-write: a plain write-only open of a FIFO
    /// fails with `ENXIO` until a reader attaches, and would later raise
    /// `EPIPE` whenever the reader bounces.
    pub fn open(path: &Path) -> Result<Self, PipeError> {
        let sender = pipe::OpenOptions::new().read_write(true).open_sender(path)?;
        Ok(Self {
            sender: Mutex::new(sender),
        })
    }

    /// Writes one `\r\n`-terminated line.
    pub async fn write_line(&self, line: &str) -> Result<(), PipeError> {
        let mut framed = String::with_capacity(line.len() + 2);
        framed.push_str(line);
        framed.push_str("\r\n");

        let mut sender = self.sender.lock().await;
        sender.write_all(framed.as_bytes()).await?;
        Ok(())
    }
}

/// Buffered line reader on a FIFO.
pub struct PipeReader {
    receiver: pipe::Receiver,
    buf: Vec<u8>,
}

impl PipeReader {
    pub fn open(path: &Path) -> Result<Self, PipeError> {
        let receiver = pipe::OpenOptions::new().open_receiver(path)?;
        Ok(Self {
            receiver,
            buf: Vec::new(),
        })
    }

    /// Reads the next line, waiting at most `poll_timeout`.
    ///
    /// Returns `Ok(None)` on timeout so the caller can check its shutdown
    /// token and poll again. Lines are terminated by `\n`; a preceding `\r`
    /// is stripped.
    pub async fn read_line(&mut self, poll_timeout: Duration) -> Result<Option<String>, PipeError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            let mut chunk = [0u8; 4096];
            let read = tokio::time::timeout(poll_timeout, self.receiver.read(&mut chunk)).await;
            match read {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => return Err(PipeError::Closed),
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fifo_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        dir.path().join(name)
    }

    #[tokio::test]
    async fn test_line_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(&dir, "a.fifo");
        ensure_fifo(&path).unwrap();

        let writer = PipeWriter::open(&path).unwrap();
        let mut reader = PipeReader::open(&path).unwrap();

        writer.write_line("request 0001 file:///a.odt").await.unwrap();
        let line = reader
            .read_line(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("expected a line");
        assert_eq!(line, "request 0001 file:///a.odt");
    }

    #[tokio::test]
    async fn test_read_line_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(&dir, "b.fifo");
        ensure_fifo(&path).unwrap();

        // Keep a writer open so the reader does not see EOF.
        let _writer = PipeWriter::open(&path).unwrap();
        let mut reader = PipeReader::open(&path).unwrap();

        let got = reader.read_line(Duration::from_millis(50)).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_multiple_lines_in_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(&dir, "c.fifo");
        ensure_fifo(&path).unwrap();

        let writer = PipeWriter::open(&path).unwrap();
        let mut reader = PipeReader::open(&path).unwrap();

        writer.write_line("query url").await.unwrap();
        writer.write_line("thread 0002 file:///b.odt").await.unwrap();

        assert_eq!(
            reader.read_line(Duration::from_secs(2)).await.unwrap().as_deref(),
            Some("query url")
        );
        assert_eq!(
            reader.read_line(Duration::from_secs(2)).await.unwrap().as_deref(),
            Some("thread 0002 file:///b.odt")
        );
    }

    #[test]
    fn test_ensure_fifo_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(&dir, "d.fifo");
        ensure_fifo(&path).unwrap();
        ensure_fifo(&path).unwrap();
    }
}
