//! Answering from a cached response.

use std::sync::Arc;

use crate::cache::CachedResponse;
use crate::load_balancer::PeerOutcome;
use crate::resilience::timeouts::IoStep;

use super::headers::OutboundHead;
use super::{Outcome, Step, UpstreamRequest};

impl UpstreamRequest<'_> {
    pub(super) async fn serve_cached(&mut self, entry: Arc<CachedResponse>) -> Step {
        // A stale entry can replace a response that is still on the wire.
        self.release_peer(PeerOutcome::Success);
        self.close_connection();
        self.flags.from_cache = true;
        self.flags.cacheable = false;
        self.flags.store = false;

        let mut head = OutboundHead::new(entry.status, entry.reason.clone());
        head.headers = entry.headers.clone();
        head.content_length = Some(entry.body.len() as u64);

        if let IoStep::TimedOut | IoStep::Failed(_) =
            self.downstream.send_head(&head, self.request, false).await
        {
            self.flags.client_gone = true;
            return Step::Finalize(Outcome::ClientClosed);
        }
        self.relayed += entry.body.len() as u64;
        if let IoStep::TimedOut | IoStep::Failed(_) = self.downstream.write_body(entry.body.clone()).await {
            self.flags.client_gone = true;
            return Step::Finalize(Outcome::ClientClosed);
        }
        self.out_head = Some(head);
        Step::Finalize(Outcome::Done)
    }
}
