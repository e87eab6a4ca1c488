//! A reader that follows a file being actively written.
//!
//! File-backed run logging must behave identically to in-memory piped
//! output, so [`FollowReader`] wraps a read handle and, on end-of-file,
//! polls at a short fixed interval for newly appended bytes instead of
//! signaling end-of-stream. Cancelling the token turns the next poll into a
//! real end-of-stream; dropping the reader releases the handle.

use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct FollowReader<R> {
    inner: R,
    cancel: CancellationToken,
    interval: Duration,
    /// Armed while waiting out an EOF before retrying.
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<R> FollowReader<R> {
    pub fn new(inner: R, cancel: CancellationToken) -> Self {
        Self::with_interval(inner, cancel, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(inner: R, cancel: CancellationToken, interval: Duration) -> Self {
        Self {
            inner,
            cancel,
            interval,
            sleep: None,
        }
    }
}

impl FollowReader<tokio::fs::File> {
    /// Open a log file for following.
    pub async fn open(path: &Path, cancel: CancellationToken) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(file, cancel))
    }

    /// Open a log file positioned at its current end, so only output
    /// appended from now on is seen. Used when reattaching to a subprocess
    /// whose earlier output was already consumed.
    pub async fn open_at_end(path: &Path, cancel: CancellationToken) -> io::Result<Self> {
        use tokio::io::AsyncSeekExt;
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(io::SeekFrom::End(0)).await?;
        Ok(Self::new(file, cancel))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for FollowReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // Reported as a clean end-of-stream; the poll timer wakes us at
            // least once per interval, so cancellation is seen promptly.
            if this.cancel.is_cancelled() {
                return Poll::Ready(Ok(()));
            }

            if let Some(sleep) = this.sleep.as_mut() {
                match sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => this.sleep = None,
                    Poll::Pending => return Poll::Pending,
                }
            }

            let before = buf.filled().len();
            match Pin::new(&mut this.inner).poll_read(cx, buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {
                    if buf.filled().len() > before {
                        return Poll::Ready(Ok(()));
                    }
                    // EOF on a live file: wait out one interval, try again.
                    this.sleep = Some(Box::pin(tokio::time::sleep(this.interval)));
                }
            }
        }
    }
}
