// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity ring of pending records.
//!
//! Any number of producers may enqueue concurrently; a single consumer
//! drains. Neither side ever waits on I/O and the lock is only held for one
//! push or pop. When the ring is full the configured [`OverflowPolicy`]
//! decides which record is lost.

use crate::errors::ConfigError;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Overwrite the oldest unconsumed record.
    #[default]
    DropOldest,
    /// Reject the incoming record.
    DropNewest,
}

impl FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "drop_oldest" | "oldest" | "overwrite" => Ok(Self::DropOldest),
            "drop_newest" | "newest" | "reject" => Ok(Self::DropNewest),
            _ => Err(ConfigError::InvalidOverflowPolicy(s.to_string())),
        }
    }
}

#[derive(Debug)]
pub struct BoundedRecordQueue<R> {
    /// Short label used in log lines, e.g. "LOGS".
    name: &'static str,
    records: Mutex<VecDeque<R>>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl<R> BoundedRecordQueue<R> {
    /// A capacity of zero is raised to one.
    pub fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Never blocks on anything but the push itself.
    ///
    /// Returns `false` only when the record itself was rejected
    /// ([`OverflowPolicy::DropNewest`] on a full ring). With
    /// [`OverflowPolicy::DropOldest`] the record is always accepted and the
    /// oldest pending one is discarded instead.
    pub fn enqueue(&self, record: R) -> bool {
        let accepted = {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            if records.len() < self.capacity {
                records.push_back(record);
                return true;
            }
            match self.policy {
                OverflowPolicy::DropOldest => {
                    records.pop_front();
                    records.push_back(record);
                    true
                }
                OverflowPolicy::DropNewest => false,
            }
        };
        self.record_drop();
        accepted
    }

    /// Next record in FIFO order, if any.
    pub fn dequeue(&self) -> Option<R> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Records lost to overflow since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        // 1, 2, 4, 8, ... so a sustained burst cannot flood the log
        if total.is_power_of_two() {
            warn!(
                "{} | Queue full (capacity {}), {} record(s) dropped so far",
                self.name, self.capacity, total
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_drain() {
        let queue = BoundedRecordQueue::new("TEST", 8, OverflowPolicy::DropOldest);
        for i in 0..5 {
            assert!(queue.enqueue(i));
        }
        let drained: Vec<i32> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = BoundedRecordQueue::new("TEST", 3, OverflowPolicy::DropOldest);
        for i in 0..4 {
            assert!(queue.enqueue(i));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 1);
        let drained: Vec<i32> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(drained, vec![1, 2, 3]);
    }

    #[test]
    fn test_overflow_drops_newest() {
        let queue = BoundedRecordQueue::new("TEST", 3, OverflowPolicy::DropNewest);
        for i in 0..3 {
            assert!(queue.enqueue(i));
        }
        assert!(!queue.enqueue(3));
        assert_eq!(queue.dropped(), 1);
        let drained: Vec<i32> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(drained, vec![0, 1, 2]);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let queue = BoundedRecordQueue::new("TEST", 0, OverflowPolicy::DropOldest);
        assert_eq!(queue.capacity(), 1);
        queue.enqueue("a");
        queue.enqueue("b");
        assert_eq!(queue.dequeue(), Some("b"));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "drop_oldest".parse::<OverflowPolicy>().unwrap(),
            OverflowPolicy::DropOldest
        );
        assert_eq!(
            " DROP-NEWEST ".parse::<OverflowPolicy>().unwrap(),
            OverflowPolicy::DropNewest
        );
        assert!("block".parse::<OverflowPolicy>().is_err());
    }

    #[test]
    fn test_concurrent_producers_never_deliver_twice() {
        let queue = Arc::new(BoundedRecordQueue::new("TEST", 64, OverflowPolicy::DropOldest));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..100 {
                        queue.enqueue(p * 1000 + i);
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        for producer in producers {
            producer.join().unwrap();
        }
        while let Some(record) = queue.dequeue() {
            seen.push(record);
        }

        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), seen.len());
        assert_eq!(seen.len() as u64 + queue.dropped(), 400);
    }

    proptest! {
        #[test]
        fn prop_no_overflow_preserves_order(records in prop::collection::vec(any::<u32>(), 0..64)) {
            let queue = BoundedRecordQueue::new("TEST", 64, OverflowPolicy::DropOldest);
            for record in &records {
                prop_assert!(queue.enqueue(*record));
            }
            let drained: Vec<u32> = std::iter::from_fn(|| queue.dequeue()).collect();
            prop_assert_eq!(drained, records);
            prop_assert_eq!(queue.dropped(), 0);
        }

        #[test]
        fn prop_overflow_keeps_newest(capacity in 1usize..32, extra in 1usize..32) {
            let queue = BoundedRecordQueue::new("TEST", capacity, OverflowPolicy::DropOldest);
            let total = capacity + extra;
            for i in 0..total {
                queue.enqueue(i);
            }
            let drained: Vec<usize> = std::iter::from_fn(|| queue.dequeue()).collect();
            prop_assert_eq!(drained, (extra..total).collect::<Vec<_>>());
            prop_assert_eq!(queue.dropped(), extra as u64);
        }
    }
}
