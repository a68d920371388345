// Simulated network conditions for resilience testing.
//
// The client adapter can perturb its own view of the link: drop a share of
// packets and hold the rest back for a random extra latency. This happens
// entirely on the local send/receive path; nothing about it is visible on
// the wire or to the relay.
//
// Rules applied by `DelayLine`:
// - Loss only hits `Unreliable` and `Sequenced` traffic. A real transport
//   retransmits lost reliable packets, so reliable classes only see delay.
// - Extra latency is uniform in `[min_latency, max_latency]`.
// - Ordered classes never overtake themselves: a packet's release time is
//   clamped to be no earlier than the previous packet on the same class.
//   Lifecycle events are pushed as `ReliableOrdered`, so they stay in line
//   with the data that preceded them.
// - Nothing overtakes a `ReliableOrdered` item pushed before it, whatever
//   its own class. A member's `Connected` is therefore released before any
//   of that member's data, unreliable or not.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use trellis_protocol::DeliveryClass;

use crate::error::ConfigError;

/// Loss and latency knobs. All zero means "pass everything through".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimulatedConditions {
    /// Chance, 0–100, that a droppable packet is lost.
    pub loss_percent: u8,
    pub min_latency: Duration,
    pub max_latency: Duration,
}

impl SimulatedConditions {
    pub fn is_active(&self) -> bool {
        self.loss_percent > 0 || !self.max_latency.is_zero()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loss_percent > 100 {
            return Err(ConfigError::LossPercent(self.loss_percent));
        }
        if self.min_latency > self.max_latency {
            return Err(ConfigError::LatencyRange {
                min: self.min_latency,
                max: self.max_latency,
            });
        }
        Ok(())
    }
}

/// Holds items back according to `SimulatedConditions` and releases them
/// once due. One line per direction.
pub struct DelayLine<T> {
    conditions: SimulatedConditions,
    rng: StdRng,
    pending: BTreeMap<(Instant, u64), T>,
    next_seq: u64,
    last_release: HashMap<DeliveryClass, Instant>,
    /// Release time of the latest `ReliableOrdered` item.
    ordered_floor: Option<Instant>,
    dropped: u64,
}

impl<T> DelayLine<T> {
    pub fn new(conditions: SimulatedConditions) -> Self {
        Self::with_rng(conditions, StdRng::from_os_rng())
    }

    /// Deterministic variant for tests.
    pub fn seeded(conditions: SimulatedConditions, seed: u64) -> Self {
        Self::with_rng(conditions, StdRng::seed_from_u64(seed))
    }

    fn with_rng(conditions: SimulatedConditions, rng: StdRng) -> Self {
        Self {
            conditions,
            rng,
            pending: BTreeMap::new(),
            next_seq: 0,
            last_release: HashMap::new(),
            ordered_floor: None,
            dropped: 0,
        }
    }

    /// Queue an item. Returns `false` if the simulation dropped it.
    pub fn push(&mut self, class: DeliveryClass, item: T, now: Instant) -> bool {
        if !class.is_reliable() && self.roll_loss() {
            self.dropped += 1;
            return false;
        }

        let mut release = now + self.roll_latency();
        if let Some(floor) = self.ordered_floor {
            release = release.max(floor);
        }
        if class == DeliveryClass::ReliableOrdered {
            self.ordered_floor = Some(release);
        }
        if class.is_ordered() {
            if let Some(prev) = self.last_release.get(&class) {
                release = release.max(*prev);
            }
            self.last_release.insert(class, release);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert((release, seq), item);
        true
    }

    /// Remove and return every item whose release time has passed, in
    /// release order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    /// When the next held item becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.keys().next().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// How many items the simulation has discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn roll_loss(&mut self) -> bool {
        let chance = self.conditions.loss_percent.min(100);
        chance > 0 && self.rng.random_range(0..100u8) < chance
    }

    fn roll_latency(&mut self) -> Duration {
        let min = self.conditions.min_latency;
        let max = self.conditions.max_latency.max(min);
        if max.is_zero() {
            return Duration::ZERO;
        }
        if min == max {
            return min;
        }
        let micros = self
            .rng
            .random_range(min.as_micros() as u64..=max.as_micros() as u64);
        Duration::from_micros(micros)
    }
}
