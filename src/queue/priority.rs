//! In-memory priority tiers and the dead-letter store.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::operation::{Operation, Priority};

/// Four FIFO tiers plus a holding area for operations waiting out a retry delay.
#[derive(Debug, Default)]
pub struct PriorityQueueSet {
    tiers: [VecDeque<Operation>; 4],
    delayed: Vec<(Instant, Operation)>,
}

impl PriorityQueueSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<Operation> {
        &mut self.tiers[priority.index()]
    }

    /// Append to the tail of the operation's tier.
    pub fn push_back(&mut self, op: Operation) {
        self.tier_mut(op.priority).push_back(op);
    }

    /// Put back at the head of the operation's tier.
    pub fn push_front(&mut self, op: Operation) {
        self.tier_mut(op.priority).push_front(op);
    }

    /// Hold `op` until `ready_at`, then append it to its tier.
    pub fn schedule(&mut self, op: Operation, ready_at: Instant) {
        self.delayed.push((ready_at, op));
    }

    /// Move every delayed operation that is due into its tier.
    pub fn release_due(&mut self, now: Instant) -> usize {
        if self.delayed.is_empty() {
            return 0;
        }
        let (mut due, waiting): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(ready_at, _)| *ready_at <= now);
        self.delayed = waiting;
        due.sort_by_key(|(ready_at, _)| *ready_at);
        let released = due.len();
        for (_, op) in due {
            self.push_back(op);
        }
        released
    }

    /// Pop the next ready operation, highest tier first.
    pub fn pop(&mut self, now: Instant) -> Option<Operation> {
        self.pop_where(now, |_| true)
    }

    /// Pop the first ready operation accepted by `eligible`, highest tier
    /// first. Skipped operations keep their place.
    pub fn pop_where(
        &mut self,
        now: Instant,
        mut eligible: impl FnMut(&Operation) -> bool,
    ) -> Option<Operation> {
        self.release_due(now);
        for priority in Priority::SCAN_ORDER {
            let tier = &mut self.tiers[priority.index()];
            if let Some(pos) = tier.iter().position(&mut eligible) {
                return tier.remove(pos);
            }
        }
        None
    }

    /// Remove an operation wherever it is waiting.
    pub fn remove(&mut self, id: &str) -> Option<Operation> {
        for tier in &mut self.tiers {
            if let Some(pos) = tier.iter().position(|op| op.id == id) {
                return tier.remove(pos);
            }
        }
        let pos = self.delayed.iter().position(|(_, op)| op.id == id)?;
        Some(self.delayed.remove(pos).1)
    }

    /// Remove the oldest operation of the lowest non-empty tier.
    ///
    /// Delayed operations count toward their tier, so a waiting retry in a
    /// low tier is evicted before anything ready in a higher one.
    pub fn drop_oldest(&mut self) -> Option<Operation> {
        let lowest = self.iter().map(|op| op.priority).min()?;
        let ready = self.tiers[lowest.index()].front().map(|op| op.created_at);
        let delayed = self
            .delayed
            .iter()
            .enumerate()
            .filter(|(_, (_, op))| op.priority == lowest)
            .min_by_key(|(_, (_, op))| op.created_at)
            .map(|(pos, (_, op))| (pos, op.created_at));

        match (ready, delayed) {
            (Some(head), Some((pos, created))) if created < head => Some(self.delayed.remove(pos).1),
            (Some(_), _) => self.tiers[lowest.index()].pop_front(),
            (None, Some((pos, _))) => Some(self.delayed.remove(pos).1),
            (None, None) => None,
        }
    }

    /// Whether an operation with `id` is waiting.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.iter().any(|op| op.id == id)
    }

    /// Look up a waiting operation.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.iter().find(|op| op.id == id)
    }

    /// Every waiting operation, ready tiers (highest first) then delayed.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        Priority::SCAN_ORDER
            .iter()
            .flat_map(|p| self.tiers[p.index()].iter())
            .chain(self.delayed.iter().map(|(_, op)| op))
    }

    /// Total waiting, including delayed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ready_len() + self.delayed.len()
    }

    /// Waiting and ready to dispatch.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    /// Number waiting in one tier (excluding delayed).
    #[must_use]
    pub fn tier_len(&self, priority: Priority) -> usize {
        self.tiers[priority.index()].len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time until the next delayed operation becomes ready.
    #[must_use]
    pub fn next_release_in(&self, now: Instant) -> Option<Duration> {
        self.delayed
            .iter()
            .map(|(ready_at, _)| ready_at.saturating_duration_since(now))
            .min()
    }

    /// Remove and return everything.
    pub fn drain(&mut self) -> Vec<Operation> {
        let mut all: Vec<Operation> = Vec::with_capacity(self.len());
        for tier in &mut self.tiers {
            all.extend(tier.drain(..));
        }
        all.extend(self.delayed.drain(..).map(|(_, op)| op));
        all
    }
}

/// Operations whose retry budget is exhausted, in arrival order.
#[derive(Debug, Default)]
pub struct DeadLetterStore {
    entries: Vec<Operation>,
}

impl DeadLetterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, op: Operation) {
        self.entries.retain(|existing| existing.id != op.id);
        self.entries.push(op);
    }

    /// Take an entry out.
    pub fn remove(&mut self, id: &str) -> Option<Operation> {
        let pos = self.entries.iter().position(|op| op.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.entries.iter().find(|op| op.id == id)
    }

    /// All entries, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<Operation> {
        self.entries.clone()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
