//! Smooth weighted round-robin peer selection.
//!
//! Every pick adds each candidate's effective weight to its current weight,
//! chooses the highest current weight and subtracts the total from the
//! winner. Backup servers are only consulted once no primary is left.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::load_balancer::backend::{Backend, BackendState};
use crate::load_balancer::{PeerOutcome, PeerPick, PeerSelector, PeerSet};

/// One ordered list of servers sharing a selection lock.
#[derive(Debug)]
pub struct Tier {
    backends: Vec<Backend>,
    state: Mutex<Vec<BackendState>>,
}

impl Tier {
    pub fn new(backends: Vec<(Backend, bool)>) -> Self {
        let state = backends
            .iter()
            .map(|(b, down)| BackendState::new(b, *down))
            .collect();
        Self {
            backends: backends.into_iter().map(|(b, _)| b).collect(),
            state: Mutex::new(state),
        }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BackendState>> {
        // Weights stay usable after a poisoned lock.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pick(&self, tried: &mut [bool], now: Instant, single: bool) -> Option<usize> {
        let mut state = self.lock();

        // A lone server is always offered; the retry budget bounds reuse.
        if single {
            if state[0].down {
                return None;
            }
            tried[0] = true;
            return Some(0);
        }

        let mut best: Option<(usize, i64)> = None;
        let mut total = 0i64;

        for (i, backend) in self.backends.iter().enumerate() {
            if tried[i] || !state[i].is_available(backend, now) {
                continue;
            }
            let s = &mut state[i];
            s.current_weight += s.effective_weight;
            total += s.effective_weight;
            if s.effective_weight < backend.weight {
                s.effective_weight += 1;
            }
            if best.map_or(true, |(_, w)| s.current_weight > w) {
                best = Some((i, s.current_weight));
            }
        }

        let (best, _) = best?;
        let backend = &self.backends[best];
        let s = &mut state[best];
        s.current_weight -= total;
        let window_over = s
            .checked
            .map_or(true, |checked| now.duration_since(checked) > backend.fail_timeout);
        if window_over {
            s.checked = Some(now);
        }
        tried[best] = true;
        Some(best)
    }

    fn release(&self, index: usize, outcome: PeerOutcome, now: Instant, single: bool) {
        let mut state = self.lock();
        let backend = &self.backends[index];
        let s = &mut state[index];
        match outcome {
            PeerOutcome::Success => s.mark_success(),
            PeerOutcome::Failed if !single => s.mark_failure(backend, now),
            PeerOutcome::Failed | PeerOutcome::Next => {}
            PeerOutcome::PermanentlyDown => s.down = true,
        }
    }

    fn addresses(&self) -> Vec<SocketAddr> {
        self.backends.iter().map(|b| b.addr).collect()
    }
}

/// A named upstream group.
#[derive(Debug)]
pub struct UpstreamGroup {
    pub name: String,
    primary: Tier,
    backup: Tier,
}

impl UpstreamGroup {
    pub fn new(name: impl Into<String>, primary: Tier, backup: Tier) -> Self {
        Self {
            name: name.into(),
            primary,
            backup,
        }
    }

    /// Every address the group may hand out.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        let mut all = self.primary.addresses();
        all.extend(self.backup.addresses());
        all
    }

    fn single(&self) -> bool {
        self.primary.len() == 1 && self.backup.is_empty()
    }
}

/// Shared selector for one group.
#[derive(Debug, Clone)]
pub struct RoundRobin {
    group: Arc<UpstreamGroup>,
}

impl RoundRobin {
    pub fn new(group: Arc<UpstreamGroup>) -> Self {
        Self { group }
    }
}

impl PeerSelector for RoundRobin {
    fn name(&self) -> &str {
        &self.group.name
    }

    fn init(&self) -> Box<dyn PeerSet> {
        Box::new(RoundRobinPeers {
            group: Arc::clone(&self.group),
            tried_primary: vec![false; self.group.primary.len()],
            tried_backup: vec![false; self.group.backup.len()],
            on_backup: false,
        })
    }
}

/// Per-request view: remembers which servers were already tried.
#[derive(Debug)]
pub struct RoundRobinPeers {
    group: Arc<UpstreamGroup>,
    tried_primary: Vec<bool>,
    tried_backup: Vec<bool>,
    on_backup: bool,
}

impl PeerSet for RoundRobinPeers {
    fn tries(&self) -> usize {
        self.group.primary.len() + self.group.backup.len()
    }

    fn get_next(&mut self) -> Option<PeerPick> {
        let now = Instant::now();
        let single = self.group.single();

        if !self.on_backup {
            if let Some(i) = self.group.primary.pick(&mut self.tried_primary, now, single) {
                return Some(to_pick(&self.group.primary, i, false));
            }
            if self.group.backup.is_empty() {
                return None;
            }
            tracing::debug!(group = %self.group.name, "primary servers exhausted, switching to backup");
            self.on_backup = true;
        }

        let i = self.group.backup.pick(&mut self.tried_backup, now, false)?;
        Some(to_pick(&self.group.backup, i, true))
    }

    fn report_outcome(&mut self, peer: &PeerPick, outcome: PeerOutcome) {
        let now = Instant::now();
        let single = self.group.single();
        let tier = if peer.backup {
            &self.group.backup
        } else {
            &self.group.primary
        };
        tier.release(peer.index, outcome, now, single);
    }
}

fn to_pick(tier: &Tier, index: usize, backup: bool) -> PeerPick {
    let backend = &tier.backends[index];
    PeerPick {
        addr: backend.addr,
        name: backend.name.clone(),
        index,
        backup,
    }
}
