//! ClientHello sniffing without consuming the stream
//!
//! [`sniff`] reads exactly one TLS record off a fresh connection, extracts the
//! server name, and returns a [`SniffedStream`] that replays those bytes before
//! reading from the live socket again.

use bytes::{Buf, Bytes, BytesMut};
use portico_router::sni::{extract_sni, record_payload_len};
use portico_router::{SniError, RECORD_HEADER_LEN};
use std::io::IoSlice;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Initial capacity for the handshake buffer (typical ClientHellos fit)
const INITIAL_CAPACITY: usize = 2 * 1024;

/// Handshake sniffing errors
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("Malformed TLS handshake: {0}")]
    HandshakeParse(#[from] SniError),

    #[error("Connection closed after {received} handshake bytes")]
    Closed { received: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Read one ClientHello record from `stream` and wrap it for replay
///
/// Reads never go past the end of the first record, however the peer chunks
/// its writes. On error the stream is dropped, which closes it.
pub async fn sniff<S>(mut stream: S) -> Result<SniffedStream<S>, SniffError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(INITIAL_CAPACITY);

    fill_to(&mut stream, &mut buf, RECORD_HEADER_LEN).await?;
    let payload_len = record_payload_len(&buf)?;
    fill_to(&mut stream, &mut buf, RECORD_HEADER_LEN + payload_len).await?;

    let server_name = extract_sni(&buf)?.unwrap_or_default();

    Ok(SniffedStream {
        inner: stream,
        buffered: buf.freeze(),
        server_name,
    })
}

async fn fill_to<S>(stream: &mut S, buf: &mut BytesMut, target: usize) -> Result<(), SniffError>
where
    S: AsyncRead + Unpin,
{
    while buf.len() < target {
        let want = (target - buf.len()) as u64;
        let n = (&mut *stream).take(want).read_buf(buf).await?;
        if n == 0 {
            return Err(SniffError::Closed {
                received: buf.len(),
            });
        }
    }
    Ok(())
}

/// A stream that replays sniffed handshake bytes before the live connection
///
/// Writes and shutdown go straight to the inner stream; `poll_shutdown` is the
/// half-close used by the proxy strategies.
#[derive(Debug)]
pub struct SniffedStream<S> {
    inner: S,
    buffered: Bytes,
    server_name: String,
}

impl<S> SniffedStream<S> {
    /// Wrap a stream with bytes that were already read from it
    pub fn new(inner: S, buffered: Bytes, server_name: impl Into<String>) -> Self {
        Self {
            inner,
            buffered,
            server_name: server_name.into(),
        }
    }

    /// SNI from the ClientHello, empty when the client sent none
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Sniffed bytes not yet handed to a reader
    pub fn buffered(&self) -> &[u8] {
        &self.buffered
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if !self.buffered.is_empty() {
            let n = self.buffered.len().min(out.remaining());
            out.put_slice(&self.buffered[..n]);
            self.buffered.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
