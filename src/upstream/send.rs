//! Sending the request to the backend.

use std::path::PathBuf;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::http::request::RequestBody;
use crate::resilience::timeouts::{self, IoStep};
use crate::resilience::FailureKind;

use super::{Outcome, Step, UpstreamRequest};

const BODY_CHUNK: usize = 16 * 1024;

enum BodySource {
    None,
    Memory(Bytes),
    File(PathBuf),
    /// Still on the client socket.
    Client(u64),
}

/// Why the request could not be sent.
enum SendFailure {
    Backend(FailureKind),
    Client,
    Local,
}

impl UpstreamRequest<'_> {
    pub(super) async fn send(&mut self) -> Step {
        let Some(peer) = self.peer.clone() else {
            return Step::Finalize(Outcome::Status(500));
        };
        let head = match self.adapter.build_request(self.request, self.body.len(), &peer) {
            Ok(head) => head,
            Err(e) => {
                tracing::error!(request_id = %self.request.id, error = %e, "Failed to build upstream request");
                return Step::Finalize(Outcome::Status(500));
            }
        };

        self.flags.request_sent = true;
        let result = match self.write_backend(&head).await {
            Ok(()) => self.send_body().await,
            Err(kind) => Err(SendFailure::Backend(kind)),
        };
        let result = match result {
            Ok(()) => self.flush_backend().await.map_err(SendFailure::Backend),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Step::ReadHeader,
            Err(SendFailure::Backend(kind)) => {
                tracing::warn!(request_id = %self.request.id, peer = %peer, kind = %kind, "Failed to send request to upstream");
                Step::Next(kind)
            }
            Err(SendFailure::Client) => {
                self.flags.client_gone = true;
                Step::Finalize(Outcome::ClientClosed)
            }
            Err(SendFailure::Local) => Step::Finalize(Outcome::Status(500)),
        }
    }

    async fn send_body(&mut self) -> Result<(), SendFailure> {
        let source = match &*self.body {
            RequestBody::Empty => BodySource::None,
            RequestBody::Buffered(bytes) => BodySource::Memory(bytes.clone()),
            RequestBody::Spooled(spooled) => BodySource::File(spooled.path().to_path_buf()),
            RequestBody::Streaming { length } => BodySource::Client(*length),
        };

        match source {
            BodySource::None => Ok(()),
            BodySource::Memory(bytes) => self.write_backend(&bytes).await.map_err(SendFailure::Backend),
            BodySource::File(path) => {
                let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
                    tracing::error!(request_id = %self.request.id, error = %e, "Cannot reopen spooled request body");
                    SendFailure::Local
                })?;
                let mut chunk = vec![0u8; BODY_CHUNK];
                loop {
                    let n = file.read(&mut chunk).await.map_err(|_| SendFailure::Local)?;
                    if n == 0 {
                        return Ok(());
                    }
                    self.write_backend(&chunk[..n]).await.map_err(SendFailure::Backend)?;
                }
            }
            BodySource::Client(length) => {
                let mut remaining = length;
                while remaining > 0 {
                    let max = remaining.min(BODY_CHUNK as u64) as usize;
                    let chunk: Bytes = self
                        .downstream
                        .read_body_chunk(max, self.client_body_timeout)
                        .await
                        .map_err(|e| {
                            tracing::info!(request_id = %self.request.id, error = %e, "Client body read failed");
                            SendFailure::Client
                        })?;
                    remaining -= chunk.len() as u64;
                    self.write_backend(&chunk).await.map_err(SendFailure::Backend)?;
                }
                Ok(())
            }
        }
    }

    async fn write_backend(&mut self, data: &[u8]) -> Result<(), FailureKind> {
        let Some(conn) = self.connection.as_mut() else {
            return Err(FailureKind::Error);
        };
        match timeouts::write_all(&mut conn.stream, data, self.conf.timeouts.send).await {
            IoStep::Done(_) => Ok(()),
            IoStep::TimedOut => Err(FailureKind::Timeout),
            IoStep::Failed(_) => Err(FailureKind::Error),
        }
    }

    async fn flush_backend(&mut self) -> Result<(), FailureKind> {
        let Some(conn) = self.connection.as_mut() else {
            return Err(FailureKind::Error);
        };
        match timeouts::flush(&mut conn.stream, self.conf.timeouts.send).await {
            IoStep::Done(_) => Ok(()),
            IoStep::TimedOut => Err(FailureKind::Timeout),
            IoStep::Failed(_) => Err(FailureKind::Error),
        }
    }
}
