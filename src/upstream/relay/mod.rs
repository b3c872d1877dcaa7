//! Moving the response body from backend to client.
//!
//! # Modes
//! - `Buffered`: backend reads fill an arena of fixed buffers, overflow
//!   goes to a temp file, the client is written from both in order
//! - `Direct`: one backend buffer and one outgoing frame, read and
//!   written concurrently; reads pause only when the buffer is full
//! - `Upgrade`: both directions pumped until either side is done

mod buffered;
mod direct;
mod upgrade;

use crate::http::connection::ClientEvent;
use crate::observability::metrics;
use crate::resilience::timeouts::IoStep;

use super::{Step, UpstreamRequest};

/// Whichever side of a relay loop finished first.
enum Event {
    Backend(IoStep),
    Client(ClientEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Buffered,
    Direct,
    Upgrade,
}

impl RelayMode {
    pub fn name(self) -> &'static str {
        match self {
            RelayMode::Buffered => "buffered",
            RelayMode::Direct => "direct",
            RelayMode::Upgrade => "upgrade",
        }
    }
}

impl UpstreamRequest<'_> {
    pub(super) async fn relay(&mut self, mode: RelayMode) -> Step {
        tracing::debug!(request_id = %self.request.id, mode = mode.name(), "Relaying response body");
        let before = self.relayed;
        let step = match mode {
            RelayMode::Buffered => self.relay_buffered().await,
            RelayMode::Direct => self.relay_direct().await,
            RelayMode::Upgrade => self.relay_upgrade().await,
        };
        metrics::record_relay_bytes(mode.name(), self.relayed - before);
        step
    }
}
