// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Metrics interface: write-only from workers, via lock-free counters
//! sharded per worker and merged by a reader.
//!
//! Only the interface lives here: a trait a worker writes through, and a
//! sharded lock-free counter implementation of it. Aggregation/export to any
//! particular backend is an external collaborator's problem.

use std::sync::atomic::{AtomicU64, Ordering};

/// The counters a single worker increments on its own thread. No locks:
/// each worker owns one shard, and a reader merges shards by summing.
pub trait Metrics: Send + Sync {
    /// A connection was accepted or an outgoing connect completed.
    fn connection_opened(&self);
    /// A connection reached `Closed`.
    fn connection_closed(&self);
    /// A request was dispatched to a handler.
    fn request_received(&self);
    /// A response was written to the wire.
    fn response_sent(&self);
    /// The write pipeline hit its high-water mark.
    fn backpressure_engaged(&self);
    /// A connection was torn down for an idle or request timeout.
    fn timeout(&self);
}

/// A per-worker shard of lock-free counters. `IOSystem` hands one to each
/// worker; a reader merges `n` shards with [`WorkerMetrics::merge`].
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    backpressure_events: AtomicU64,
    timeouts: AtomicU64,
}

impl WorkerMetrics {
    /// A zeroed shard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time snapshot of this shard's counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl Metrics for WorkerMetrics {
    fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    fn response_sent(&self) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn backpressure_engaged(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

/// A merged read of one or more [`WorkerMetrics`] shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Connections opened.
    pub connections_opened: u64,
    /// Connections closed.
    pub connections_closed: u64,
    /// Requests dispatched to a handler.
    pub requests_received: u64,
    /// Responses written to the wire.
    pub responses_sent: u64,
    /// High-water backpressure events.
    pub backpressure_events: u64,
    /// Idle/request timeouts.
    pub timeouts: u64,
}

impl MetricsSnapshot {
    /// Sum two snapshots, for merging shards across workers.
    pub fn merge(self, other: MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened + other.connections_opened,
            connections_closed: self.connections_closed + other.connections_closed,
            requests_received: self.requests_received + other.requests_received,
            responses_sent: self.responses_sent + other.responses_sent,
            backpressure_events: self.backpressure_events + other.backpressure_events,
            timeouts: self.timeouts + other.timeouts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shards_merge() {
        let a = WorkerMetrics::new();
        let b = WorkerMetrics::new();
        a.connection_opened();
        a.connection_opened();
        b.connection_opened();
        b.request_received();

        let merged = a.snapshot().merge(b.snapshot());
        assert_eq!(merged.connections_opened, 3);
        assert_eq!(merged.requests_received, 1);
    }
}
