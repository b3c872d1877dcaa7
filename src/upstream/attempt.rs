//! Per-attempt measurements.

use std::time::{Duration, Instant};

use crate::load_balancer::PeerPick;
use crate::resilience::FailureKind;

/// One connection attempt against one backend.
#[derive(Debug, Clone)]
pub struct AttemptState {
    pub peer: PeerPick,
    pub started: Instant,
    pub connect_time: Option<Duration>,
    pub header_time: Option<Duration>,
    pub response_time: Option<Duration>,
    /// Status of the backend response, 0 when none was parsed.
    pub status: u16,
    /// Body bytes relayed from this backend.
    pub bytes: u64,
    pub failure: Option<FailureKind>,
}

impl AttemptState {
    pub fn new(peer: PeerPick) -> Self {
        Self {
            peer,
            started: Instant::now(),
            connect_time: None,
            header_time: None,
            response_time: None,
            status: 0,
            bytes: 0,
            failure: None,
        }
    }

    pub fn connected(&mut self) {
        self.connect_time = Some(self.started.elapsed());
    }

    pub fn header_received(&mut self, status: u16) {
        self.header_time = Some(self.started.elapsed());
        self.status = status;
    }

    /// Close the measurement; later calls keep the first value.
    pub fn finish(&mut self) {
        if self.response_time.is_none() {
            self.response_time = Some(self.started.elapsed());
        }
    }
}

/// `addr:status` pairs, the way the attempt history is logged.
pub fn summarize(attempts: &[AttemptState]) -> String {
    attempts
        .iter()
        .map(|a| match a.failure {
            Some(kind) => format!("{}:{}({})", a.peer.addr, a.status, kind),
            None => format!("{}:{}", a.peer.addr, a.status),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> PeerPick {
        PeerPick {
            addr: ([127, 0, 0, 1], port).into(),
            name: format!("127.0.0.1:{port}"),
            index: 0,
            backup: false,
        }
    }

    #[test]
    fn finish_is_sticky() {
        let mut attempt = AttemptState::new(peer(1));
        attempt.header_received(200);
        attempt.finish();
        let first = attempt.response_time;
        attempt.finish();
        assert_eq!(attempt.response_time, first);
        assert_eq!(attempt.status, 200);
    }

    #[test]
    fn summary_lists_failures() {
        let mut failed = AttemptState::new(peer(1));
        failed.failure = Some(FailureKind::Error);
        let mut ok = AttemptState::new(peer(2));
        ok.status = 200;
        assert_eq!(summarize(&[failed, ok]), "127.0.0.1:1:0(error), 127.0.0.1:2:200");
    }
}
