//! Event dispatch to subscribers
//!
//! Every subscriber of a topic is a `TopicSink`. The built-in sink is a
//! bounded `SubscriberQueue` read by `get_next_message`; callers can attach
//! their own sinks. A failing or full sink never blocks or affects the
//! others.

use crate::config::OverflowPolicy;
use crate::error::TopicError;
use crate::types::PublishEvent;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Receiver of publish events for one subscription
pub trait TopicSink: Send + Sync {
    /// Hand over one event. Must not block for long.
    fn deliver(&self, event: &PublishEvent) -> Result<(), TopicError>;

    /// The topic is gone or the subscription was cancelled
    fn close(&self) {}
}

impl<F> TopicSink for F
where
    F: Fn(&PublishEvent) -> Result<(), TopicError> + Send + Sync,
{
    fn deliver(&self, event: &PublishEvent) -> Result<(), TopicError> {
        self(event)
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    events: VecDeque<PublishEvent>,
    closed: bool,
}

/// Bounded per-subscriber queue with a blocking reader
#[derive(Debug)]
pub struct SubscriberQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Events discarded by the overflow policy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Enqueue without blocking, applying the overflow policy when full
    pub fn push(&self, event: PublishEvent) -> Result<(), TopicError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TopicError::Closed(event.topic));
        }
        if inner.events.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match self.policy {
                OverflowPolicy::DropOldest => {
                    inner.events.pop_front();
                }
                OverflowPolicy::DropNewest => return Ok(()),
            }
        }
        inner.events.push_back(event);
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    /// Next event if one is queued.
    ///
    /// Queued events are still handed out after close; `Closed` is returned
    /// only once the queue is drained.
    pub fn try_pop(&self) -> Result<Option<PublishEvent>, TopicError> {
        let mut inner = self.inner.lock();
        match inner.events.pop_front() {
            Some(event) => Ok(Some(event)),
            None if inner.closed => Err(TopicError::Closed("subscription".to_string())),
            None => Ok(None),
        }
    }

    /// Block until an event arrives, the queue closes, or `timeout` passes.
    /// `None` waits indefinitely.
    pub fn pop_timeout(&self, timeout: Option<Duration>) -> Result<PublishEvent, TopicError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if let Some(event) = inner.events.pop_front() {
                return Ok(event);
            }
            if inner.closed {
                return Err(TopicError::Closed("subscription".to_string()));
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut inner, deadline).timed_out()
                        && inner.events.is_empty()
                        && !inner.closed
                    {
                        return Err(TopicError::Timeout);
                    }
                }
                None => self.ready.wait(&mut inner),
            }
        }
    }

    /// Refuse further events and wake every blocked reader
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_all();
    }
}

impl TopicSink for SubscriberQueue {
    fn deliver(&self, event: &PublishEvent) -> Result<(), TopicError> {
        self.push(event.clone())
    }

    fn close(&self) {
        SubscriberQueue::close(self)
    }
}

struct Subscriber {
    id: Uuid,
    sink: Arc<dyn TopicSink>,
    failures: u64,
}

/// Delivery outcome for one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Ordered subscriber set for one topic
#[derive(Default)]
pub struct Dispatcher {
    subscribers: Vec<Subscriber>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: Uuid, sink: Arc<dyn TopicSink>) {
        self.subscribers.push(Subscriber {
            id,
            sink,
            failures: 0,
        });
    }

    /// Detach and close one subscriber; `false` if it was not attached
    pub fn remove(&mut self, id: Uuid) -> bool {
        match self.subscribers.iter().position(|s| s.id == id) {
            Some(index) => {
                let subscriber = self.subscribers.remove(index);
                subscriber.sink.close();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Delivery failures recorded for one subscriber
    pub fn failures(&self, id: Uuid) -> Option<u64> {
        self.subscribers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.failures)
    }

    /// Deliver `event` to every subscriber in subscription order
    pub fn dispatch(&mut self, event: &PublishEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        for subscriber in &mut self.subscribers {
            match subscriber.sink.deliver(event) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    subscriber.failures += 1;
                    report.failed += 1;
                    warn!(
                        "topic '{}': delivery to subscriber {} failed: {}",
                        event.topic, subscriber.id, e
                    );
                }
            }
        }
        debug!(
            "topic '{}': state {} dispatched to {} subscriber(s)",
            event.topic, event.state, report.delivered
        );
        report
    }

    /// Close and detach every subscriber
    pub fn close_all(&mut self) {
        for subscriber in self.subscribers.drain(..) {
            subscriber.sink.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PublishKind;
    use std::thread;

    fn event(state: u32, end: i64) -> PublishEvent {
        PublishEvent {
            topic: "t".to_string(),
            state,
            aggregate_value: 1.0,
            window_start: end - 1000,
            window_end: end,
            timestamp: end,
            device: "device1".to_string(),
            point: "temp".to_string(),
            kind: PublishKind::Transition,
        }
    }

    #[test]
    fn test_queue_preserves_order() {
        let queue = SubscriberQueue::new(4, OverflowPolicy::DropOldest);
        queue.push(event(0, 1000)).unwrap();
        queue.push(event(1, 2000)).unwrap();

        assert_eq!(queue.try_pop().unwrap().unwrap().state, 0);
        assert_eq!(queue.try_pop().unwrap().unwrap().state, 1);
        assert!(queue.try_pop().unwrap().is_none());
    }

    #[test]
    fn test_drop_oldest_overflow() {
        let queue = SubscriberQueue::new(2, OverflowPolicy::DropOldest);
        for n in 0..3 {
            queue.push(event(n, 1000)).unwrap();
        }
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop().unwrap().unwrap().state, 1);
    }

    #[test]
    fn test_drop_newest_overflow() {
        let queue = SubscriberQueue::new(2, OverflowPolicy::DropNewest);
        for n in 0..3 {
            queue.push(event(n, 1000)).unwrap();
        }
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop().unwrap().unwrap().state, 0);
        assert_eq!(queue.try_pop().unwrap().unwrap().state, 1);
    }

    #[test]
    fn test_pop_times_out() {
        let queue = SubscriberQueue::new(2, OverflowPolicy::DropOldest);
        let result = queue.pop_timeout(Some(Duration::from_millis(10)));
        assert!(matches!(result, Err(TopicError::Timeout)));
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let queue = Arc::new(SubscriberQueue::new(2, OverflowPolicy::DropOldest));
        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_timeout(None))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();

        let result = reader.join().unwrap();
        assert!(matches!(result, Err(TopicError::Closed(_))));
        assert!(queue.push(event(0, 1000)).is_err());
    }

    #[test]
    fn test_blocked_reader_receives_event() {
        let queue = Arc::new(SubscriberQueue::new(2, OverflowPolicy::DropOldest));
        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_timeout(Some(Duration::from_secs(5))))
        };
        queue.push(event(7, 3000)).unwrap();
        assert_eq!(reader.join().unwrap().unwrap().state, 7);
    }

    #[test]
    fn test_failing_sink_does_not_affect_others() {
        let queue = Arc::new(SubscriberQueue::new(4, OverflowPolicy::DropOldest));
        let failing_id = Uuid::new_v4();
        let mut dispatcher = Dispatcher::new();
        dispatcher.add(
            failing_id,
            Arc::new(|_: &PublishEvent| -> Result<(), TopicError> {
                Err(TopicError::Closed("gone".into()))
            }),
        );
        dispatcher.add(Uuid::new_v4(), queue.clone());

        let report = dispatcher.dispatch(&event(1, 3000));
        assert_eq!(report, DispatchReport { delivered: 1, failed: 1 });
        assert_eq!(dispatcher.failures(failing_id), Some(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_closes_sink() {
        let queue = Arc::new(SubscriberQueue::new(4, OverflowPolicy::DropOldest));
        let id = Uuid::new_v4();
        let mut dispatcher = Dispatcher::new();
        dispatcher.add(id, queue.clone());

        assert!(dispatcher.remove(id));
        assert!(!dispatcher.remove(id));
        assert!(queue.is_closed());
        assert!(dispatcher.is_empty());
    }
}
