//! Liveness table and round-robin worker selection.
//!
//! The table is overwritten by every `ping-result` broadcast and trusted
//! for `2 × ping_delay` after it.  Peers are discovered exclusively through
//! those broadcasts: every listener in the map is merged into the per-name
//! known-worker list.

use sb_proto::envelope::{listener_id, WorkerCounters};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

pub(crate) struct LivenessTable {
    /// Listeners that answered the last ping round.
    pings: HashMap<String, WorkerCounters>,
    valid_until: Option<Instant>,
    /// Per service name, the sorted worker indices ever observed.
    known: HashMap<String, Vec<u32>>,
    /// Round-robin cursor per target name.
    cursors: HashMap<String, usize>,
}

impl LivenessTable {
    pub(crate) fn new() -> LivenessTable {
        LivenessTable {
            pings: HashMap::new(),
            valid_until: None,
            known: HashMap::new(),
            cursors: HashMap::new(),
        }
    }

    /// Whether the last ping round is still trusted.
    pub(crate) fn window_valid(&self) -> bool {
        self.valid_until.is_some_and(|until| Instant::now() < until)
    }

    pub(crate) fn is_listed(&self, listener: &str) -> bool {
        self.pings.contains_key(listener)
    }

    /// Overwrite the table from a `ping-result` broadcast and extend the
    /// validity window.
    pub(crate) fn apply_ping_result(
        &mut self,
        pings: HashMap<String, WorkerCounters>,
        window: Duration,
    ) {
        for listener in pings.keys() {
            let Some((name, worker)) = parse_listener(listener) else {
                warn!(listener, "malformed listener id in ping-result");
                continue;
            };
            let workers = self.known.entry(name.to_owned()).or_default();
            if let Err(position) = workers.binary_search(&worker) {
                workers.insert(position, worker);
            }
        }
        self.pings = pings;
        self.valid_until = Some(Instant::now() + window);
    }

    /// Round-robin selection over the known workers of `target`.
    ///
    /// Starting after the cursor, scans at most N slots and returns the
    /// first listed-alive worker (any worker counts while the window is
    /// invalid).  The cursor always advances to the slot tried; when no
    /// worker is alive the last tried one is returned and the send fails
    /// fast at request time.
    pub(crate) fn select_worker(&mut self, target: &str) -> u32 {
        let Some(workers) = self.known.get(target) else {
            return 0;
        };
        if workers.is_empty() {
            return 0;
        }

        let len = workers.len();
        let window_valid = self.window_valid();
        let mut index = self.cursors.get(target).copied().unwrap_or(len - 1);
        let mut worker = workers[(index + 1) % len];
        for _ in 0..len {
            index = (index + 1) % len;
            worker = workers[index];
            if window_valid && !self.pings.contains_key(&listener_id(target, worker)) {
                continue;
            }
            break;
        }
        self.cursors.insert(target.to_owned(), index);
        worker
    }
}

fn parse_listener(listener: &str) -> Option<(&str, u32)> {
    let (name, worker) = listener.rsplit_once('@')?;
    Some((name, worker.parse().ok()?))
}
