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

//! Per-worker timing wheel: idle-connection timeouts and scheduled worker
//! tasks share one mechanism, a single-level hashed wheel indexed by a
//! configurable tick quantum.

use std::any::Any;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::connection::ConnectionHandler;

/// Handle to a scheduled entry, usable with [`TimingWheel::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What fires when a timer's delay elapses.
pub enum TimerAction {
    /// Re-check a connection's idle deadline. If it is still idle past the
    /// configured threshold the worker closes it; otherwise the worker
    /// reschedules this same check.
    IdleCheck {
        /// The connection's context id.
        context_id: u64,
    },
    /// A one-shot `Schedule(delay, msg)` worker command.
    Scheduled {
        /// The item this message targets, if any. `None` for timers with
        /// no specific owner (e.g. a periodic worker-wide sweep).
        context_id: Option<u64>,
        /// Opaque payload delivered to the target's `on_message`.
        message: Box<dyn Any>,
    },
    /// A client's [`crate::config::ReconnectPolicy`]-driven reconnect attempt.
    /// Not targeted at any bound item; the worker itself dials out and binds
    /// whatever the closure builds.
    Reconnect {
        /// Address to dial.
        addr: SocketAddr,
        /// Builds the handler for the reconnected socket (typically a fresh
        /// `ClientConnectionHandler` sharing the same in-flight state).
        build: Box<dyn FnOnce() -> Box<dyn ConnectionHandler> + Send>,
        /// How many attempts have been made so far, for backoff math.
        attempt: u32,
    },
}

struct Entry {
    id: u64,
    /// Remaining full laps of the wheel before this entry actually fires.
    rounds: u64,
    action: TimerAction,
}

/// A single-level hashed timing wheel: a fixed number of slots, each
/// holding the entries due in that slot's tick, re-armed for another lap
/// when their delay spans more than one full rotation.
pub struct TimingWheel {
    tick: Duration,
    slots: Vec<Vec<Entry>>,
    cursor: usize,
    last_advance: Instant,
    next_id: u64,
}

impl TimingWheel {
    /// Build a wheel with `slot_count` buckets, each spanning `tick`.
    pub fn new(tick: Duration, slot_count: usize) -> Self {
        assert!(slot_count > 0, "timing wheel needs at least one slot");
        Self {
            tick,
            slots: (0..slot_count).map(|_| Vec::new()).collect(),
            cursor: 0,
            last_advance: Instant::now(),
            next_id: 0,
        }
    }

    /// Schedule `action` to fire no earlier than `delay` from now.
    pub fn schedule(&mut self, delay: Duration, action: TimerAction) -> TimerId {
        let slot_count = self.slots.len();
        let tick_nanos = self.tick.as_nanos().max(1);
        let ticks = ((delay.as_nanos() / tick_nanos) as usize).max(1);
        let rounds = (ticks / slot_count) as u64;
        let slot = (self.cursor + ticks % slot_count) % slot_count;

        let id = self.next_id;
        self.next_id += 1;
        self.slots[slot].push(Entry { id, rounds, action });
        TimerId(id)
    }

    /// Cancel a previously scheduled entry. A no-op if it already fired.
    pub fn cancel(&mut self, id: TimerId) {
        for slot in &mut self.slots {
            slot.retain(|e| e.id != id.0);
        }
    }

    /// Advance the wheel to `now`, returning every action whose delay has
    /// fully elapsed. Called once per worker loop iteration.
    pub fn advance(&mut self, now: Instant) -> Vec<TimerAction> {
        let mut fired = Vec::new();
        while now.saturating_duration_since(self.last_advance) >= self.tick {
            self.last_advance += self.tick;
            self.cursor = (self.cursor + 1) % self.slots.len();
            let due = std::mem::take(&mut self.slots[self.cursor]);
            for mut entry in due {
                if entry.rounds == 0 {
                    fired.push(entry.action);
                } else {
                    entry.rounds -= 1;
                    self.slots[self.cursor].push(entry);
                }
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_its_delay_elapses() {
        let mut wheel = TimingWheel::new(Duration::from_millis(10), 8);
        wheel.schedule(
            Duration::from_millis(25),
            TimerAction::Scheduled {
                context_id: Some(1),
                message: Box::new(()),
            },
        );

        let start = Instant::now();
        assert!(wheel.advance(start + Duration::from_millis(15)).is_empty());
        let fired = wheel.advance(start + Duration::from_millis(35));
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut wheel = TimingWheel::new(Duration::from_millis(10), 4);
        let id = wheel.schedule(
            Duration::from_millis(10),
            TimerAction::IdleCheck { context_id: 7 },
        );
        wheel.cancel(id);
        let fired = wheel.advance(Instant::now() + Duration::from_millis(50));
        assert!(fired.is_empty());
    }

    #[test]
    fn delay_longer_than_wheel_span_survives_multiple_laps() {
        // 4 slots * 10ms = 40ms span; schedule 95ms out, needing >2 laps.
        let mut wheel = TimingWheel::new(Duration::from_millis(10), 4);
        wheel.schedule(
            Duration::from_millis(95),
            TimerAction::IdleCheck { context_id: 3 },
        );
        let start = Instant::now();
        assert!(wheel.advance(start + Duration::from_millis(80)).is_empty());
        let fired = wheel.advance(start + Duration::from_millis(110));
        assert_eq!(fired.len(), 1);
    }
}
