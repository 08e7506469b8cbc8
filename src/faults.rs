//! Runtime fault reporting
//!
//! Evaluation failures are isolated to one (topic, rule, window) and pushed
//! onto a bounded channel instead of being returned to the caller. Dropped
//! late samples land here too, as `LateData`. When the channel is full the
//! oldest fault is discarded.

use crate::error::TopicError;
use crate::types::Millis;
use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of faults retained before the oldest are discarded
pub const DEFAULT_FAULT_CHANNEL_CAPACITY: usize = 256;

/// A runtime failure scoped to one rule of one topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationFault {
    pub topic: String,
    pub rule_state: Option<u32>,
    pub window_end: Option<Millis>,
    pub code: u32,
    pub kind: String,
    pub message: String,
}

impl EvaluationFault {
    pub fn new(
        topic: &str,
        rule_state: Option<u32>,
        window_end: Option<Millis>,
        error: &TopicError,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            rule_state,
            window_end,
            code: error.code(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Lock-free bounded fault queue shared by every topic in a registry
#[derive(Debug)]
pub struct FaultChannel {
    queue: ArrayQueue<EvaluationFault>,
    total: AtomicU64,
    discarded: AtomicU64,
}

impl Default for FaultChannel {
    fn default() -> Self {
        Self::new(DEFAULT_FAULT_CHANNEL_CAPACITY)
    }
}

impl FaultChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            total: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn report(&self, fault: EvaluationFault) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if self.queue.force_push(fault).is_some() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take every pending fault, oldest first
    pub fn drain(&self) -> Vec<EvaluationFault> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Faults reported since creation, including discarded ones
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(n: i64) -> EvaluationFault {
        EvaluationFault::new(
            "topic",
            Some(1),
            Some(n),
            &TopicError::Evaluation("bad sample".into()),
        )
    }

    #[test]
    fn test_fault_carries_error_code() {
        let f = fault(3000);
        assert_eq!(f.code, 13011);
        assert_eq!(f.kind, "EVALUATION_ERROR");
        assert!(f.message.contains("bad sample"));
    }

    #[test]
    fn test_drain_in_order() {
        let channel = FaultChannel::new(8);
        channel.report(fault(1));
        channel.report(fault(2));

        let ends: Vec<_> = channel.drain().iter().map(|f| f.window_end).collect();
        assert_eq!(ends, vec![Some(1), Some(2)]);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_full_channel_discards_oldest() {
        let channel = FaultChannel::new(2);
        for n in 1..=3 {
            channel.report(fault(n));
        }

        assert_eq!(channel.total(), 3);
        assert_eq!(channel.discarded(), 1);
        let ends: Vec<_> = channel.drain().iter().map(|f| f.window_end).collect();
        assert_eq!(ends, vec![Some(2), Some(3)]);
    }
}
