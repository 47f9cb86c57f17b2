//! Bounded emission queue
//!
//! FIFO of records waiting for a publish token. What happens when it is full
//! depends on the [`OverflowPolicy`]:
//! - `Block`: the caller waits for space
//! - `DropOldest`: the head is discarded to admit the newcomer
//! - `Coalesce`: a record whose key is already queued is merged into the
//!   queued one; a new key waits for space like `Block`

use super::OverflowPolicy;
use std::collections::{HashMap, VecDeque};
use usage_common::{BucketKey, UsageRecord};

/// Outcome of offering a record to the queue
#[derive(Debug, PartialEq)]
pub enum Admission {
    /// Appended at the tail
    Queued,
    /// Merged into a record already waiting for the same key
    Coalesced,
    /// Appended after discarding the returned head record
    DroppedOldest(UsageRecord),
    /// No room; the record is handed back to the caller
    Full(UsageRecord),
}

/// FIFO with an optional key index for coalescing
#[derive(Debug)]
pub struct EmitQueue {
    policy: OverflowPolicy,
    capacity: usize,
    entries: VecDeque<UsageRecord>,
    /// Sequence number of `entries[0]`
    head_seq: u64,
    /// Key to sequence number of its queued record (coalesce only)
    index: HashMap<BucketKey, u64>,
}

impl EmitQueue {
    pub fn new(policy: OverflowPolicy, capacity: usize) -> Self {
        Self {
            policy,
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.min(4096)),
            head_seq: 0,
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Offer a record according to the overflow policy
    pub fn push(&mut self, record: UsageRecord) -> Admission {
        match self.policy {
            OverflowPolicy::Coalesce => {
                let key = record.key();
                if let Some(seq) = self.index.get(&key) {
                    let pos = (*seq - self.head_seq) as usize;
                    if let Some(queued) = self.entries.get_mut(pos) {
                        queued.merge(&record);
                        return Admission::Coalesced;
                    }
                }
                if self.is_full() {
                    return Admission::Full(record);
                }
                let seq = self.head_seq + self.entries.len() as u64;
                self.index.insert(key, seq);
                self.entries.push_back(record);
                Admission::Queued
            }
            OverflowPolicy::Block => {
                if self.is_full() {
                    return Admission::Full(record);
                }
                self.entries.push_back(record);
                Admission::Queued
            }
            OverflowPolicy::DropOldest => {
                let dropped = if self.is_full() { self.pop() } else { None };
                self.entries.push_back(record);
                match dropped {
                    Some(oldest) => Admission::DroppedOldest(oldest),
                    None => Admission::Queued,
                }
            }
        }
    }

    /// Take the oldest record
    pub fn pop(&mut self) -> Option<UsageRecord> {
        let record = self.entries.pop_front()?;
        if self.policy == OverflowPolicy::Coalesce {
            let key = record.key();
            if self.index.get(&key) == Some(&self.head_seq) {
                self.index.remove(&key);
            }
        }
        self.head_seq += 1;
        Some(record)
    }
}
