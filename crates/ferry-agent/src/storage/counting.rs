//! Byte-counting reader used for transfer progress

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// Wraps a reader and reports the cumulative byte count after every read
pub struct CountingReader<R, F> {
    inner: R,
    total: u64,
    on_read: F,
}

impl<R, F> CountingReader<R, F>
where
    F: Fn(u64),
{
    pub fn new(inner: R, on_read: F) -> Self {
        Self {
            inner,
            total: 0,
            on_read,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.total
    }
}

impl<R, F> AsyncRead for CountingReader<R, F>
where
    R: AsyncRead + Unpin,
    F: Fn(u64) + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = (buf.filled().len() - before) as u64;
                if read > 0 {
                    this.total += read;
                    (this.on_read)(this.total);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
