//! Per-plate reordering buffer.
//!
//! Messages arrive out of device-time order. Each message is held for a
//! short window keyed on its own arrival time. When a window ends, that
//! message is released in device-time order together with every buffered
//! message that precedes it in device time; younger arrivals with later
//! device times stay buffered. The latest released device time becomes the
//! watermark; anything older that shows up afterwards is too late to be
//! ordered and is dropped.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::policy::ReorderPolicy;
use crate::telemetry::{MessageKey, TelemetryMessage};

/// Outcome of offering a message to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Buffered,
    /// An identical message was seen recently.
    Duplicate,
    /// Device time precedes what has already been released.
    Late,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    pub buffered: u64,
    pub duplicates: u64,
    pub late: u64,
    pub released: u64,
}

#[derive(Debug)]
struct Pending {
    message: TelemetryMessage,
    arrival: Instant,
    seq: u64,
}

#[derive(Debug)]
pub struct ReorderBuffer {
    policy: ReorderPolicy,
    pending: Vec<Pending>,
    seen: HashSet<MessageKey>,
    seen_order: VecDeque<MessageKey>,
    watermark: Option<DateTime<Utc>>,
    next_seq: u64,
    stats: ReorderStats,
}

impl ReorderBuffer {
    pub fn new(policy: ReorderPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            watermark: None,
            next_seq: 0,
            stats: ReorderStats::default(),
        }
    }

    /// Offers a message that arrived at `now`.
    pub fn push(&mut self, message: TelemetryMessage, now: Instant) -> Admission {
        let key = message.key();
        if self.seen.contains(&key) {
            self.stats.duplicates += 1;
            return Admission::Duplicate;
        }
        if self
            .watermark
            .is_some_and(|watermark| message.device_time < watermark)
        {
            self.stats.late += 1;
            return Admission::Late;
        }

        self.remember(key);
        self.pending.push(Pending {
            message,
            arrival: now,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        self.stats.buffered += 1;
        Admission::Buffered
    }

    /// Releases, in device-time order, every message whose window has ended
    /// and everything buffered at or before it in device time. When the
    /// buffer is over its cap the oldest arrivals are released early the
    /// same way.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<TelemetryMessage> {
        let window = self.policy.window();
        let mut cutoff = self
            .pending
            .iter()
            .filter(|p| p.arrival + window <= now)
            .map(|p| p.message.device_time)
            .max();

        let excess = self.pending.len().saturating_sub(self.policy.max_buffered);
        if excess > 0 {
            let mut by_arrival: Vec<&Pending> = self.pending.iter().collect();
            by_arrival.sort_by_key(|p| p.seq);
            let overflow = by_arrival[..excess]
                .iter()
                .map(|p| p.message.device_time)
                .max();
            cutoff = cutoff.max(overflow);
        }

        match cutoff {
            Some(cutoff) => self.release(|p| p.message.device_time <= cutoff),
            None => Vec::new(),
        }
    }

    /// Releases everything regardless of age.
    pub fn drain_all(&mut self) -> Vec<TelemetryMessage> {
        self.release(|_| true)
    }

    fn release(&mut self, ready: impl Fn(&Pending) -> bool) -> Vec<TelemetryMessage> {
        let (mut released, kept): (Vec<Pending>, Vec<Pending>) =
            std::mem::take(&mut self.pending).into_iter().partition(ready);
        self.pending = kept;
        released.sort_by(|a, b| {
            a.message
                .device_time
                .cmp(&b.message.device_time)
                .then(a.seq.cmp(&b.seq))
        });
        if let Some(last) = released.last() {
            self.watermark = Some(
                self.watermark
                    .map_or(last.message.device_time, |w| w.max(last.message.device_time)),
            );
        }
        self.stats.released += released.len() as u64;
        released.into_iter().map(|p| p.message).collect()
    }

    /// When the oldest buffered message's window ends.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .iter()
            .map(|p| p.arrival)
            .min()
            .map(|arrival| arrival + self.policy.window())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub const fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub const fn stats(&self) -> ReorderStats {
        self.stats
    }

    fn remember(&mut self, key: MessageKey) {
        if self.policy.dedup_memory == 0 {
            return;
        }
        while self.seen_order.len() >= self.policy.dedup_memory {
            if let Some(evicted) = self.seen_order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(key.clone());
        self.seen_order.push_back(key);
    }
}
