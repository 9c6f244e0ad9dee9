//! OS-level byte channel backing one leg of the pipeline.
//!
//! A `PipeChannel` is a named FIFO with two independently closable ends.
//! The FIFO lives under a per-run scratch directory and is addressed by
//! name, so an external task runtime can attach a process to either end
//! by path without this crate handing out raw descriptors.
//!
//! Both ends are also opened in-process at creation time:
//! - the parent-held write end keeps the FIFO from signalling EOF until
//!   the coordinator decides the upstream stage is done;
//! - the parent-held read end can be detached and handed to a drain task.
//!
//! The receiver is opened before the sender: a non-blocking FIFO write
//! open fails with ENXIO when no reader exists yet.

use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;

use crate::errors::{StagepipeError, StagepipeResult};

/// Which ends of the channel have been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    ReadClosed,
    WriteClosed,
    /// Both ends closed; the FIFO file has been unlinked.
    Closed,
}

/// A unidirectional byte channel with named ends.
///
/// At most one parent-held writer and one parent-held reader exist per
/// instance. Closing the write end is the EOF signal: a concurrently
/// blocked reader unblocks with a zero-length read once buffered bytes
/// are drained, without any poll loop.
#[derive(Debug)]
pub struct PipeChannel {
    path: PathBuf,
    reader: Option<pipe::Receiver>,
    writer: Option<pipe::Sender>,
    state: ChannelState,
}

impl PipeChannel {
    /// Allocate a FIFO named `name` under `dir` and open both ends.
    ///
    /// Must run inside a tokio runtime (the ends register with the
    /// reactor). Fails with [`StagepipeError::Allocation`] if the FIFO
    /// cannot be created (directory missing, name collision) or opened.
    pub fn open(dir: &Path, name: &str) -> StagepipeResult<Self> {
        let path = dir.join(name);
        nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
            StagepipeError::Allocation(format!("mkfifo {}: {}", path.display(), e))
        })?;

        // Reader first; the sender open requires an existing reader.
        // The FIFO is unlinked again if either open fails, so a failed
        // allocation leaves nothing on disk.
        let reader = match pipe::OpenOptions::new().open_receiver(&path) {
            Ok(reader) => reader,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(StagepipeError::Allocation(format!(
                    "open read end {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        let writer = match pipe::OpenOptions::new().open_sender(&path) {
            Ok(writer) => writer,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(StagepipeError::Allocation(format!(
                    "open write end {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        tracing::debug!(channel = %path.display(), "allocated pipe channel");

        Ok(Self {
            path,
            reader: Some(reader),
            writer: Some(writer),
            state: ChannelState::Open,
        })
    }

    /// Attach point for external processes, by name.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Close the write end. Idempotent; never errors.
    ///
    /// Readers observe EOF once all buffered bytes are drained. Safe to
    /// call while a reader on the other end is blocked.
    pub fn close_write(&mut self) {
        if self.writer.take().is_some() {
            tracing::debug!(channel = %self.path.display(), "write end closed");
            self.mark_write_closed();
        }
    }

    /// Close the read end. Idempotent; never errors.
    ///
    /// The FIFO file is unlinked once both ends are closed.
    pub fn close_read(&mut self) {
        if self.reader.take().is_some() {
            tracing::debug!(channel = %self.path.display(), "read end closed");
            self.mark_read_closed();
        }
    }

    /// Detach the parent-held read end, transferring ownership.
    ///
    /// Used to hand the read end to an owned drain task. Counts as
    /// closing the read end for state purposes; the caller releases the
    /// descriptor by dropping the receiver.
    pub fn take_reader(&mut self) -> Option<pipe::Receiver> {
        let reader = self.reader.take();
        if reader.is_some() {
            self.mark_read_closed();
        }
        reader
    }

    /// Write through the parent-held write end.
    ///
    /// Fails with [`StagepipeError::ClosedChannel`] after `close_write`.
    pub async fn write_all(&mut self, buf: &[u8]) -> StagepipeResult<()> {
        let writer = self.writer.as_mut().ok_or(StagepipeError::ClosedChannel)?;
        writer.write_all(buf).await?;
        Ok(())
    }

    /// Read through the parent-held read end. Returns 0 at EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> StagepipeResult<usize> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| StagepipeError::Internal("channel read end is closed".into()))?;
        Ok(reader.read(buf).await?)
    }

    fn mark_write_closed(&mut self) {
        self.state = match self.state {
            ChannelState::Open => ChannelState::WriteClosed,
            ChannelState::ReadClosed => ChannelState::Closed,
            other => other,
        };
        self.unlink_if_closed();
    }

    fn mark_read_closed(&mut self) {
        self.state = match self.state {
            ChannelState::Open => ChannelState::ReadClosed,
            ChannelState::WriteClosed => ChannelState::Closed,
            other => other,
        };
        self.unlink_if_closed();
    }

    fn unlink_if_closed(&mut self) {
        if self.state == ChannelState::Closed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        // Backstop for channels dropped before both ends were closed.
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn bytes_then_eof() {
        let dir = TempDir::new().unwrap();
        let mut ch = PipeChannel::open(dir.path(), "data").unwrap();

        ch.write_all(b"alpha beta gamma").await.unwrap();
        ch.close_write();

        let mut collected = Vec::new();
        let mut buf = [0u8; 8];
        loop {
            let n = ch.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"alpha beta gamma");
    }

    #[tokio::test]
    async fn close_write_unblocks_blocked_reader() {
        let dir = TempDir::new().unwrap();
        let mut ch = PipeChannel::open(dir.path(), "blocked").unwrap();
        let mut reader = ch.take_reader().unwrap();

        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read(&mut buf).await
        });

        // Give the reader time to park on the empty FIFO.
        tokio::time::sleep(Duration::from_millis(50)).await;
        ch.close_write();

        let n = timeout(Duration::from_secs(2), pending)
            .await
            .expect("reader still blocked after close_write")
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "blocked read must resolve to EOF");
    }

    #[tokio::test]
    async fn closes_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut ch = PipeChannel::open(dir.path(), "idem").unwrap();
        let path = ch.path().to_path_buf();

        ch.close_write();
        ch.close_write();
        assert_eq!(ch.state(), ChannelState::WriteClosed);

        ch.close_read();
        ch.close_read();
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(!path.exists(), "FIFO must be unlinked once both ends close");
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let mut ch = PipeChannel::open(dir.path(), "closed").unwrap();
        ch.close_write();
        let err = ch.write_all(b"late").await.unwrap_err();
        assert!(matches!(err, StagepipeError::ClosedChannel));
    }

    #[tokio::test]
    async fn missing_dir_is_allocation_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent");
        let err = PipeChannel::open(&missing, "nope").unwrap_err();
        assert!(matches!(err, StagepipeError::Allocation(_)));
    }

    #[tokio::test]
    async fn name_collision_is_allocation_error() {
        let dir = TempDir::new().unwrap();
        let _first = PipeChannel::open(dir.path(), "dup").unwrap();
        let err = PipeChannel::open(dir.path(), "dup").unwrap_err();
        assert!(matches!(err, StagepipeError::Allocation(_)));
    }
}
