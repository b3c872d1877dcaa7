//! Timeout enforcement.
//!
//! # Responsibilities
//! - Hold the per-hop deadlines of one upstream request
//! - Wrap single socket operations with a deadline
//!
//! # Design Decisions
//! - Deadlines apply between two successive operations, not to a whole
//!   transfer: a slow but progressing peer never times out
//! - A single `read`/`write` under a timeout stays cancel-safe, so these
//!   helpers are usable inside `tokio::select!`

use std::io;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Per-hop deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub send: Duration,
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(60),
            send: Duration::from_secs(60),
            read: Duration::from_secs(60),
        }
    }
}

/// Result of one deadline-bounded I/O operation.
#[derive(Debug)]
pub enum IoStep {
    Done(usize),
    TimedOut,
    Failed(io::Error),
}

/// One `read` bounded by `limit`. `Done(0)` is end of stream.
pub async fn read_some<R>(io: &mut R, buf: &mut [u8], limit: Duration) -> IoStep
where
    R: AsyncRead + Unpin + ?Sized,
{
    match timeout(limit, io.read(buf)).await {
        Ok(Ok(n)) => IoStep::Done(n),
        Ok(Err(e)) => IoStep::Failed(e),
        Err(_) => IoStep::TimedOut,
    }
}

/// One `read` appending at most `max` bytes to `buf`.
pub async fn read_buf_some<R>(io: &mut R, buf: &mut BytesMut, max: usize, limit: Duration) -> IoStep
where
    R: AsyncRead + Unpin + ?Sized,
{
    if max == 0 {
        return IoStep::Done(0);
    }
    buf.reserve(max);
    let mut room = (&mut *buf).limit(max);
    match timeout(limit, io.read_buf(&mut room)).await {
        Ok(Ok(n)) => IoStep::Done(n),
        Ok(Err(e)) => IoStep::Failed(e),
        Err(_) => IoStep::TimedOut,
    }
}

/// One `write` bounded by `limit`.
pub async fn write_some<W>(io: &mut W, buf: &[u8], limit: Duration) -> IoStep
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match timeout(limit, io.write(buf)).await {
        Ok(Ok(0)) => IoStep::Failed(io::ErrorKind::WriteZero.into()),
        Ok(Ok(n)) => IoStep::Done(n),
        Ok(Err(e)) => IoStep::Failed(e),
        Err(_) => IoStep::TimedOut,
    }
}

/// Write all of `buf`, re-arming `limit` after every partial write.
pub async fn write_all<W>(io: &mut W, mut buf: &[u8], limit: Duration) -> IoStep
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let total = buf.len();
    while !buf.is_empty() {
        match write_some(io, buf, limit).await {
            IoStep::Done(n) => buf = &buf[n..],
            other => return other,
        }
    }
    IoStep::Done(total)
}

/// Flush bounded by `limit`.
pub async fn flush<W>(io: &mut W, limit: Duration) -> IoStep
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match timeout(limit, io.flush()).await {
        Ok(Ok(())) => IoStep::Done(0),
        Ok(Err(e)) => IoStep::Failed(e),
        Err(_) => IoStep::TimedOut,
    }
}
