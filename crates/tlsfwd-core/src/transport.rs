//! Transport-agnostic session I/O.
//!
//! Both raw TCP legs and TLS-upgraded legs must satisfy [`SessionIo`]. The
//! rest of the relay only ever sees the read / write / close capability
//! exposed by [`SessionReader`] and [`SessionWriter`].

use crate::error::FwdResult;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// A bidirectional byte stream usable as a session leg.
pub trait SessionIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> SessionIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// An owned, type-erased session leg (raw or encrypted).
pub type BoxedIo = Box<dyn SessionIo>;

/// Read side of a session leg.
pub struct SessionReader {
    inner: ReadHalf<BoxedIo>,
}

/// Write side of a session leg.
pub struct SessionWriter {
    inner: WriteHalf<BoxedIo>,
}

/// Split a leg into independently owned read and write halves.
///
/// The underlying socket is released once both halves are dropped.
pub fn split_session(io: BoxedIo) -> (SessionReader, SessionWriter) {
    let (r, w) = tokio::io::split(io);
    (SessionReader { inner: r }, SessionWriter { inner: w })
}

impl SessionReader {
    /// Read up to `buf.len()` bytes. Returns number of bytes read, 0 = EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> FwdResult<usize> {
        Ok(self.inner.read(buf).await?)
    }
}

impl SessionWriter {
    /// Write all bytes.
    pub async fn write(&mut self, data: &[u8]) -> FwdResult<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write side, signalling end-of-stream to the remote peer.
    pub async fn close(&mut self) -> FwdResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
