//! Buffered protocol stream over a raw byte transport.
//!
//! [`PgStream`] owns the framing: sends are buffered until flushed, receives
//! are cut at the declared message boundary and never beyond it. Everything
//! above the frame (session state, message sequencing) lives one layer up in
//! [`Connection`][crate::Connection].
use bytes::BytesMut;

use crate::postgres::{FrontendProtocol, frontend};

#[cfg(feature = "tokio")]
use bytes::{Buf, BufMut};
#[cfg(feature = "tokio")]
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};
#[cfg(feature = "tokio")]
use crate::{
    Result,
    postgres::ProtocolError,
};
#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Buffered postgres message stream over any byte transport `S`.
#[derive(Debug)]
pub struct PgStream<S> {
    io: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> PgStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
        }
    }

    /// Buffer a frontend message.
    ///
    /// This does not write to the underlying io, flushing is required
    /// afterwards.
    pub fn send<F: FrontendProtocol>(&mut self, msg: F) {
        frontend::write(msg, &mut self.write_buf);
    }

    /// Buffer a [`Startup`][frontend::Startup] message.
    ///
    /// For historical reasons the startup message has no message-type byte,
    /// so it bypasses [`send`][PgStream::send].
    pub fn send_startup(&mut self, msg: frontend::Startup) {
        msg.write(&mut self.write_buf);
    }

    /// Buffer a [`CancelRequest`][frontend::CancelRequest] message.
    ///
    /// Like startup, the cancel request has no message-type byte.
    pub fn send_cancel(&mut self, msg: frontend::CancelRequest) {
        msg.write(&mut self.write_buf);
    }

    /// Consume self into the underlying transport.
    pub fn into_inner(self) -> S {
        self.io
    }
}

#[cfg(feature = "tokio")]
impl<S> PgStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Poll to write all buffered messages to the underlying io.
    pub fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Pin::new(&mut self.io).poll_flush(cx)
    }

    /// Write all buffered messages to the underlying io.
    pub fn flush(&mut self) -> Flush<'_, S> {
        Flush { stream: self }
    }

    /// Poll to receive one framed message, as `(msgtype, body)`.
    ///
    /// The body is cut to exactly the declared length; a declared length
    /// below the 4 byte minimum is a protocol violation. Interpreting the
    /// body is the caller's business.
    pub fn poll_frame(&mut self, cx: &mut Context) -> Poll<Result<(u8, bytes::Bytes)>> {
        loop {
            // msgtype + length
            if let Some(mut header) = self.read_buf.get(..5) {
                let msgtype = header.get_u8();
                let len = header.get_i32();

                if len < 4 {
                    return Poll::Ready(Err(ProtocolError::length(msgtype, len).into()));
                }

                let body_len = len as usize - 4;
                if self.read_buf.len() - 5 >= body_len {
                    self.read_buf.advance(5);
                    let body = self.read_buf.split_to(body_len).freeze();
                    return Poll::Ready(Ok((msgtype, body)));
                }

                self.read_buf.reserve(5 + body_len - self.read_buf.len());
            }

            ready!(self.poll_read(cx))?;
        }
    }

    fn poll_read(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        self.read_buf.reserve(DEFAULT_BUF_CAPACITY);

        let n = {
            let dst = self.read_buf.chunk_mut();
            let dst = unsafe { dst.as_uninit_slice_mut() };
            let mut buf = ReadBuf::uninit(dst);
            let ptr = buf.filled().as_ptr();
            ready!(Pin::new(&mut self.io).poll_read(cx, &mut buf)?);

            // Ensure the pointer does not change from under us
            assert_eq!(ptr, buf.filled().as_ptr());
            buf.filled().len()
        };

        if n == 0 {
            // peer closed mid stream, the session cannot continue
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }

        // Safety: This is guaranteed to be the number of initialized (and read)
        // bytes due to the invariants provided by `ReadBuf::filled`.
        unsafe {
            self.read_buf.advance_mut(n);
        }

        Poll::Ready(Ok(()))
    }
}

#[cfg(feature = "tokio")]
pin_project_lite::pin_project! {
    /// Future of [`PgStream::flush`].
    #[derive(Debug)]
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct Flush<'s, S> {
        stream: &'s mut PgStream<S>,
    }
}

#[cfg(feature = "tokio")]
impl<S> Future for Flush<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().stream.poll_flush(cx)
    }
}
