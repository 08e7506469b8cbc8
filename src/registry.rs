//! Topic registry
//!
//! The registry is the public entry point of the engine. It owns every live
//! topic, routes samples from an endpoint to the topics bound to it, and
//! manages subscriptions. Each topic's pipeline sits behind its own mutex;
//! the registry-wide locks are held only long enough to look up or swap
//! `Arc` handles, never during evaluation.

use crate::access::{AccessPolicy, AllowAll};
use crate::config::EngineConfig;
use crate::dispatcher::{SubscriberQueue, TopicSink};
use crate::error::TopicError;
use crate::faults::{EvaluationFault, FaultChannel};
use crate::pipeline::{SampleDisposition, TopicPipeline, TopicStats};
use crate::schema::TopicSpec;
use crate::source::{IngestItem, SampleSource};
use crate::types::{EndpointKey, Millis, PublishEvent, Sample};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Identity of a created topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicKey {
    pub name: String,
    pub endpoint: EndpointKey,
}

/// Handle returned by `subscribe`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub topic: String,
}

/// Summary of routing one sample
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// Topics bound to the sample's endpoint
    pub topics: usize,
    pub accepted: usize,
    pub late: usize,
    pub out_of_range: usize,
    pub rejected: usize,
    /// Events delivered by event-time watermark advances
    pub published: Vec<PublishEvent>,
}

/// Summary of draining a `SampleSource`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub samples: u64,
    pub watermarks: u64,
    pub unrouted: u64,
    pub late: u64,
    pub out_of_range: u64,
    pub published: Vec<PublishEvent>,
}

struct TopicHandle {
    key: TopicKey,
    pipeline: Mutex<TopicPipeline>,
}

#[derive(Default)]
struct TopicTable {
    by_name: HashMap<String, Arc<TopicHandle>>,
    routes: HashMap<EndpointKey, Vec<String>>,
}

struct SubscriptionEntry {
    topic: String,
    queue: Option<Arc<SubscriberQueue>>,
}

/// Process-scoped set of live topics
pub struct TopicRegistry {
    config: EngineConfig,
    instance_id: Uuid,
    access: Arc<dyn AccessPolicy>,
    table: RwLock<TopicTable>,
    subscriptions: RwLock<HashMap<Uuid, SubscriptionEntry>>,
    faults: Arc<FaultChannel>,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl TopicRegistry {
    /// Create a registry that allows every management request
    pub fn new(config: EngineConfig) -> Self {
        Self::with_access_policy(config, Arc::new(AllowAll))
    }

    /// Create a registry that consults `access` before creating topics
    pub fn with_access_policy(config: EngineConfig, access: Arc<dyn AccessPolicy>) -> Self {
        let instance_id = Uuid::new_v4();
        info!("topic registry {} started", instance_id);
        Self {
            faults: Arc::new(FaultChannel::new(config.fault_channel_capacity)),
            config,
            instance_id,
            access,
            table: RwLock::new(TopicTable::default()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn len(&self) -> usize {
        self.table.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of every live topic, sorted
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.read().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn topic_key(&self, name: &str) -> Result<TopicKey, TopicError> {
        Ok(self.handle(name)?.key.clone())
    }

    // ========================================================================
    // Topic lifecycle
    // ========================================================================

    /// Parse `spec_json` and create the topic `name`.
    ///
    /// Nothing is registered unless every check passes.
    pub fn create_topic(&self, name: &str, spec_json: &str) -> Result<TopicKey, TopicError> {
        let spec = TopicSpec::parse(spec_json)?;
        self.create_topic_from_spec(name, spec)
    }

    pub fn create_topic_from_spec(
        &self,
        name: &str,
        spec: TopicSpec,
    ) -> Result<TopicKey, TopicError> {
        if name.is_empty() {
            return Err(TopicError::Validation(
                "topic name must not be empty".to_string(),
            ));
        }
        if name.trim() != name {
            return Err(TopicError::Validation(format!(
                "topic name '{name}' has leading or trailing whitespace"
            )));
        }

        let max_open = self.config.max_open_windows_per_rule;
        if let Some(rule) = spec
            .ladder
            .rules()
            .iter()
            .find(|rule| rule.windows_per_sample() > max_open as i64)
        {
            return Err(TopicError::Resource(format!(
                "rule for state {} puts each sample in {} windows, more than the {} allowed open",
                rule.state,
                rule.windows_per_sample(),
                max_open
            )));
        }

        let endpoint =
            EndpointKey::resolve(&spec.device_name, &spec.endpoint_name, &self.config.scope)?;
        if !self.access.can_manage(&endpoint) {
            return Err(TopicError::PermissionDenied(format!(
                "no management privilege on {endpoint}"
            )));
        }

        let key = TopicKey {
            name: name.to_string(),
            endpoint: endpoint.clone(),
        };
        let rules = spec.ladder.len();
        let pipeline = TopicPipeline::new(
            name,
            endpoint.clone(),
            spec,
            &self.config,
            Arc::clone(&self.faults),
        );

        let mut table = self.table.write();
        if table.by_name.contains_key(name) {
            return Err(TopicError::AlreadyExists(format!("topic '{name}'")));
        }
        if table.by_name.len() >= self.config.max_topics {
            return Err(TopicError::Resource(format!(
                "registry already holds {} topics",
                self.config.max_topics
            )));
        }
        table.by_name.insert(
            name.to_string(),
            Arc::new(TopicHandle {
                key: key.clone(),
                pipeline: Mutex::new(pipeline),
            }),
        );
        table
            .routes
            .entry(endpoint.clone())
            .or_default()
            .push(name.to_string());
        drop(table);

        info!("topic '{}' created on {} with {} rule(s)", name, endpoint, rules);
        Ok(key)
    }

    /// Delete a topic.
    ///
    /// Waits for any in-flight evaluation of the topic, then closes its
    /// subscriber queues. No event for the topic is delivered once this
    /// returns.
    pub fn delete_topic(&self, name: &str) -> Result<(), TopicError> {
        let handle = {
            let mut table = self.table.write();
            let handle = table
                .by_name
                .remove(name)
                .ok_or_else(|| TopicError::NotFound(format!("topic '{name}'")))?;
            let endpoint = &handle.key.endpoint;
            if let Some(names) = table.routes.get_mut(endpoint) {
                names.retain(|n| n != name);
                if names.is_empty() {
                    table.routes.remove(endpoint);
                }
            }
            handle
        };

        handle.pipeline.lock().shut_down();
        self.subscriptions.write().retain(|_, entry| entry.topic != name);

        info!("topic '{}' deleted", name);
        Ok(())
    }

    /// Delete every topic; returns how many were removed
    pub fn clean_up(&self) -> usize {
        let removed = self
            .topic_names()
            .iter()
            .filter(|name| self.delete_topic(name).is_ok())
            .count();
        if removed > 0 {
            info!("clean-up removed {} topic(s)", removed);
        }
        removed
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe with a bounded queue read through `get_next_message`
    pub fn subscribe(&self, topic: &str) -> Result<SubscriptionHandle, TopicError> {
        let queue = Arc::new(SubscriberQueue::new(
            self.config.subscriber_queue_capacity,
            self.config.overflow_policy,
        ));
        self.attach(topic, queue.clone(), Some(queue))
    }

    /// Subscribe a caller-provided sink
    pub fn subscribe_sink(
        &self,
        topic: &str,
        sink: Arc<dyn TopicSink>,
    ) -> Result<SubscriptionHandle, TopicError> {
        self.attach(topic, sink, None)
    }

    fn attach(
        &self,
        topic: &str,
        sink: Arc<dyn TopicSink>,
        queue: Option<Arc<SubscriberQueue>>,
    ) -> Result<SubscriptionHandle, TopicError> {
        let handle = self.handle(topic)?;
        let id = Uuid::new_v4();

        let mut pipeline = handle.pipeline.lock();
        if pipeline.is_deleted() {
            return Err(TopicError::NotFound(format!("topic '{topic}'")));
        }
        pipeline.subscribe(id, sink);
        self.subscriptions.write().insert(
            id,
            SubscriptionEntry {
                topic: topic.to_string(),
                queue,
            },
        );
        drop(pipeline);

        debug!("subscription {} attached to topic '{}'", id, topic);
        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    pub fn unsubscribe(&self, subscription: &SubscriptionHandle) -> Result<(), TopicError> {
        let entry = self
            .subscriptions
            .write()
            .remove(&subscription.id)
            .ok_or_else(|| TopicError::NotFound(format!("subscription {}", subscription.id)))?;

        if let Ok(handle) = self.handle(&entry.topic) {
            handle.pipeline.lock().unsubscribe(subscription.id);
        }
        debug!(
            "subscription {} detached from topic '{}'",
            subscription.id, entry.topic
        );
        Ok(())
    }

    /// Next event for a queue subscription, blocking up to `timeout`
    /// (`None` blocks until an event arrives or the topic is deleted)
    pub fn get_next_message(
        &self,
        subscription: &SubscriptionHandle,
        timeout: Option<Duration>,
    ) -> Result<PublishEvent, TopicError> {
        self.queue_for(subscription)?.pop_timeout(timeout)
    }

    /// Next event for a queue subscription without blocking
    pub fn try_next_message(
        &self,
        subscription: &SubscriptionHandle,
    ) -> Result<Option<PublishEvent>, TopicError> {
        self.queue_for(subscription)?.try_pop()
    }

    fn queue_for(
        &self,
        subscription: &SubscriptionHandle,
    ) -> Result<Arc<SubscriberQueue>, TopicError> {
        let subscriptions = self.subscriptions.read();
        let entry = subscriptions
            .get(&subscription.id)
            .ok_or_else(|| TopicError::NotFound(format!("subscription {}", subscription.id)))?;
        entry.queue.clone().ok_or_else(|| {
            TopicError::Validation(format!(
                "subscription {} delivers to a sink, not a queue",
                subscription.id
            ))
        })
    }

    // ========================================================================
    // Ingest and watermarks
    // ========================================================================

    /// Route one sample to every topic bound to the endpoint
    pub fn ingest(
        &self,
        device_name: &str,
        endpoint_name: &str,
        sample: Sample,
    ) -> Result<IngestReport, TopicError> {
        let endpoint = EndpointKey::resolve(device_name, endpoint_name, &self.config.scope)?;
        Ok(self.ingest_key(&endpoint, &sample))
    }

    pub fn ingest_key(&self, endpoint: &EndpointKey, sample: &Sample) -> IngestReport {
        let handles = self.handles_for(endpoint);
        let mut report = IngestReport {
            topics: handles.len(),
            ..IngestReport::default()
        };

        for handle in handles {
            let outcome = handle.pipeline.lock().ingest(sample);
            match outcome.disposition {
                SampleDisposition::Accepted => report.accepted += 1,
                SampleDisposition::Late => report.late += 1,
                SampleDisposition::OutOfRange => report.out_of_range += 1,
                SampleDisposition::Rejected => report.rejected += 1,
                SampleDisposition::Deleted => {}
            }
            report.published.extend(outcome.published);
        }
        report
    }

    /// Advance the watermark of every topic bound to one endpoint
    pub fn advance_watermark(
        &self,
        device_name: &str,
        endpoint_name: &str,
        watermark: Millis,
    ) -> Result<Vec<PublishEvent>, TopicError> {
        let endpoint = EndpointKey::resolve(device_name, endpoint_name, &self.config.scope)?;
        Ok(Self::advance_handles(self.handles_for(&endpoint), watermark))
    }

    pub fn advance_topic_watermark(
        &self,
        name: &str,
        watermark: Millis,
    ) -> Result<Vec<PublishEvent>, TopicError> {
        let handle = self.handle(name)?;
        Ok(Self::advance_handles(vec![handle], watermark))
    }

    /// Advance every topic's watermark
    pub fn advance_all(&self, watermark: Millis) -> Vec<PublishEvent> {
        let handles: Vec<Arc<TopicHandle>> =
            self.table.read().by_name.values().cloned().collect();
        Self::advance_handles(handles, watermark)
    }

    fn advance_handles(handles: Vec<Arc<TopicHandle>>, watermark: Millis) -> Vec<PublishEvent> {
        let mut published = Vec::new();
        for handle in handles {
            let events = handle.pipeline.lock().advance_watermark(watermark);
            published.extend(events);
        }
        published
    }

    /// Pull every item from `source` and apply it
    pub fn drain_source(&self, source: &mut dyn SampleSource) -> Result<DrainReport, TopicError> {
        let mut report = DrainReport::default();
        while let Some(item) = source.next_item()? {
            match item {
                IngestItem::Sample {
                    device,
                    endpoint,
                    sample,
                } => {
                    report.samples += 1;
                    let outcome = self.ingest(&device, &endpoint, sample)?;
                    if outcome.topics == 0 {
                        report.unrouted += 1;
                    }
                    report.late += outcome.late as u64;
                    report.out_of_range += outcome.out_of_range as u64;
                    report.published.extend(outcome.published);
                }
                IngestItem::Watermark {
                    device,
                    endpoint,
                    time,
                } => {
                    report.watermarks += 1;
                    let published = match (device, endpoint) {
                        (Some(device), Some(endpoint)) => {
                            self.advance_watermark(&device, &endpoint, time)?
                        }
                        (None, None) => self.advance_all(time),
                        _ => {
                            return Err(TopicError::Validation(
                                "a targeted watermark needs both device and endpoint"
                                    .to_string(),
                            ))
                        }
                    };
                    report.published.extend(published);
                }
            }
        }
        Ok(report)
    }

    // ========================================================================
    // Introspection and state
    // ========================================================================

    pub fn topic_stats(&self, name: &str) -> Result<TopicStats, TopicError> {
        Ok(self.handle(name)?.pipeline.lock().stats())
    }

    /// Export a topic's detector and suppressor state as JSON
    pub fn save_state(&self, name: &str) -> Result<String, TopicError> {
        self.handle(name)?.pipeline.lock().save_state()
    }

    pub fn load_state(&self, name: &str, json: &str) -> Result<(), TopicError> {
        self.handle(name)?.pipeline.lock().load_state(json)
    }

    /// Take every pending evaluation fault
    pub fn drain_faults(&self) -> Vec<EvaluationFault> {
        self.faults.drain()
    }

    pub fn fault_count(&self) -> u64 {
        self.faults.total()
    }

    fn handle(&self, name: &str) -> Result<Arc<TopicHandle>, TopicError> {
        self.table
            .read()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| TopicError::NotFound(format!("topic '{name}'")))
    }

    fn handles_for(&self, endpoint: &EndpointKey) -> Vec<Arc<TopicHandle>> {
        let table = self.table.read();
        let handles = match table.routes.get(endpoint) {
            Some(names) => names
                .iter()
                .filter_map(|name| table.by_name.get(name).cloned())
                .collect(),
            None => Vec::new(),
        };
        handles
    }
}

impl Drop for TopicRegistry {
    fn drop(&mut self) {
        self.clean_up();
    }
}
