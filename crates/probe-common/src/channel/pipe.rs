use std::{
    fs::File,
    io,
    os::unix::prelude::AsRawFd,
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, ReadBuf};
use tokio_fd::AsyncFd;

/// Non-blocking reader for pipes and FIFOs (tracefs `trace_pipe`, a FIFO
/// written by the probe loader).
///
/// NOTE: we can't just use tokio::fs::File because it uses blocking IO on
/// a different thread. If we do, Ctrl-C won't quit the application since
/// we're still stuck reading this file.
pub struct PipeReader {
    async_fd: AsyncFd,
    /// Owns the file descriptor polled by `async_fd`. Dropping it would
    /// close the FD, resulting in EBADFD errors when reading.
    _file: File,
}

impl PipeReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let async_fd = AsyncFd::try_from(file.as_raw_fd())?;
        Ok(Self {
            async_fd,
            _file: file,
        })
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.async_fd).poll_read(cx, buf)
    }
}
