//! Upgraded connections: bytes flow both ways untouched.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::sleep;

use crate::resilience::timeouts::{self, IoStep};

use super::super::{Outcome, Step, UpstreamRequest};

#[derive(Debug)]
enum Pump {
    Read(usize),
    Wrote(usize),
    Eof,
    Failed(std::io::Error),
}

/// One direction: a buffer that is either being filled or drained.
#[derive(Debug)]
struct Direction {
    buf: BytesMut,
    eof: bool,
}

impl Direction {
    fn new(size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(size),
            eof: false,
        }
    }

    fn finished(&self) -> bool {
        self.eof && self.buf.is_empty()
    }
}

/// Read while the buffer is empty, write while it is not.
async fn pump_step<R, W>(reader: &mut R, writer: &mut W, dir: &mut Direction, size: usize) -> Pump
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if dir.buf.is_empty() {
        if dir.eof {
            return std::future::pending().await;
        }
        match reader.read_buf(&mut (&mut dir.buf).limit(size)).await {
            Ok(0) => Pump::Eof,
            Ok(n) => Pump::Read(n),
            Err(e) => Pump::Failed(e),
        }
    } else {
        match writer.write(&dir.buf).await {
            Ok(0) => Pump::Failed(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                dir.buf.advance(n);
                Pump::Wrote(n)
            }
            Err(e) => Pump::Failed(e),
        }
    }
}

impl UpstreamRequest<'_> {
    pub(super) async fn relay_upgrade(&mut self) -> Step {
        let size = self.conf.buffer_size;
        let idle = self.conf.timeouts.read;
        let send_timeout = self.conf.timeouts.send;
        let Some(conn) = self.connection.as_mut() else {
            return Step::Finalize(Outcome::Status(502));
        };
        let (client_io, read_ahead) = self.downstream.upgrade_parts();

        // Bytes that arrived together with the heads go first.
        if !read_ahead.is_empty() {
            let early = read_ahead.split();
            if let IoStep::TimedOut | IoStep::Failed(_) =
                timeouts::write_all(&mut conn.stream, &early, send_timeout).await
            {
                return Step::Finalize(Outcome::Done);
            }
        }
        if !self.input.is_empty() {
            let early = self.input.split();
            self.relayed += early.len() as u64;
            if let IoStep::TimedOut | IoStep::Failed(_) =
                timeouts::write_all(&mut *client_io, &early, send_timeout).await
            {
                self.flags.client_gone = true;
                return Step::Finalize(Outcome::ClientClosed);
            }
        }

        let (mut client_read, mut client_write) = tokio::io::split(&mut *client_io);
        let (mut backend_read, mut backend_write) = tokio::io::split(&mut conn.stream);
        let mut up = Direction::new(size);
        let mut down = Direction::new(size);

        loop {
            if up.finished() || down.finished() {
                let _ = backend_write.shutdown().await;
                let _ = client_write.shutdown().await;
                return Step::Finalize(Outcome::Done);
            }
            tokio::select! {
                event = pump_step(&mut client_read, &mut backend_write, &mut up, size) => match event {
                    Pump::Eof => up.eof = true,
                    Pump::Read(_) | Pump::Wrote(_) => {}
                    Pump::Failed(e) => {
                        tracing::debug!(request_id = %self.request.id, error = %e, "upgraded connection closed (client side)");
                        return Step::Finalize(Outcome::Done);
                    }
                },
                event = pump_step(&mut backend_read, &mut client_write, &mut down, size) => match event {
                    Pump::Eof => down.eof = true,
                    Pump::Wrote(n) => self.relayed += n as u64,
                    Pump::Read(_) => {}
                    Pump::Failed(e) => {
                        tracing::debug!(request_id = %self.request.id, error = %e, "upgraded connection closed (upstream side)");
                        return Step::Finalize(Outcome::Done);
                    }
                },
                _ = sleep(idle) => {
                    tracing::info!(request_id = %self.request.id, "upgraded connection timed out");
                    return Step::Finalize(Outcome::Done);
                }
            }
        }
    }
}
