//! Per-topic evaluation pipeline
//!
//! A `TopicPipeline` owns everything one topic needs: a window aggregator
//! per rule, the transition detector, the publish suppressor and the
//! subscriber dispatcher. The registry keeps each pipeline behind its own
//! mutex, so a window close runs to completion before the next one starts.
//!
//! Stages for each window close:
//! 1. WindowAggregator - compute the aggregate for the closed window
//! 2. BandClassifier - map the aggregate onto the rule ladder
//! 3. TransitionDetector - update the current band
//! 4. PublishSuppressor - deliver or withhold
//! 5. Dispatcher - hand the event to every subscriber

use crate::classifier::BandClassifier;
use crate::config::{EngineConfig, WatermarkPolicy};
use crate::detector::{Transition, TransitionDetector};
use crate::dispatcher::{Dispatcher, TopicSink};
use crate::error::TopicError;
use crate::faults::{EvaluationFault, FaultChannel};
use crate::schema::TopicSpec;
use crate::suppressor::{Candidate, PublishSuppressor, SuppressionDecision};
use crate::types::{Band, EndpointKey, Millis, PublishEvent, PublishKind, Sample};
use crate::window::{AggregateValue, WindowAggregator, WindowClose};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// What happened to one ingested sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleDisposition {
    /// Appended to at least one open window
    Accepted,
    /// Every window it belonged to had already closed
    Late,
    /// Outside the topic's `[startTime, endTime)` range
    OutOfRange,
    /// No window could take it (open-window cap reached, or before the origin)
    Rejected,
    /// The topic was deleted
    Deleted,
}

/// Outcome of `TopicPipeline::ingest`
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub disposition: SampleDisposition,
    /// Events delivered by a watermark advance the sample triggered
    pub published: Vec<PublishEvent>,
}

/// Counters and current state for one topic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicStats {
    pub samples_accepted: u64,
    pub late_samples: u64,
    pub out_of_range_samples: u64,
    pub rejected_samples: u64,
    pub windows_closed: u64,
    pub evaluations: u64,
    pub published: u64,
    pub suppressed: u64,
    pub faults: u64,
    /// Open windows dropped unevaluated by `load_state`
    pub windows_discarded: u64,
    pub current_state: Option<u32>,
    pub watermark: Option<Millis>,
    pub subscribers: usize,
    pub open_windows: usize,
}

/// Detector and suppressor state, exported so a restarted process resumes
/// without re-publishing the current band
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub detector: TransitionDetector,
    pub suppressor: PublishSuppressor,
    pub watermark: Option<Millis>,
}

/// Evaluation state for one topic
pub struct TopicPipeline {
    name: String,
    key: EndpointKey,
    spec: TopicSpec,
    aggregators: Vec<WindowAggregator>,
    detector: TransitionDetector,
    suppressor: PublishSuppressor,
    dispatcher: Dispatcher,
    watermark_policy: WatermarkPolicy,
    watermark: Option<Millis>,
    max_seen: Option<Millis>,
    stats: TopicStats,
    faults: Arc<FaultChannel>,
    deleted: bool,
}

impl TopicPipeline {
    pub fn new(
        name: &str,
        key: EndpointKey,
        spec: TopicSpec,
        config: &EngineConfig,
        faults: Arc<FaultChannel>,
    ) -> Self {
        let origin = spec.start_time.unwrap_or(0);
        let aggregators = spec
            .ladder
            .rules()
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                WindowAggregator::new(index, rule, origin, config.max_open_windows_per_rule)
            })
            .collect();

        Self {
            name: name.to_string(),
            key,
            spec,
            aggregators,
            detector: TransitionDetector::new(),
            suppressor: PublishSuppressor::new(),
            dispatcher: Dispatcher::new(),
            watermark_policy: config.watermark,
            watermark: None,
            max_seen: None,
            stats: TopicStats::default(),
            faults,
            deleted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn spec(&self) -> &TopicSpec {
        &self.spec
    }

    pub fn current_band(&self) -> Band {
        self.detector.current_band()
    }

    pub fn watermark(&self) -> Option<Millis> {
        self.watermark
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn stats(&self) -> TopicStats {
        TopicStats {
            current_state: self.detector.current_band().state(),
            watermark: self.watermark,
            subscribers: self.dispatcher.len(),
            open_windows: self.aggregators.iter().map(|a| a.open_window_count()).sum(),
            ..self.stats.clone()
        }
    }

    pub fn subscribe(&mut self, id: Uuid, sink: Arc<dyn TopicSink>) {
        self.dispatcher.add(id, sink);
    }

    pub fn unsubscribe(&mut self, id: Uuid) -> bool {
        self.dispatcher.remove(id)
    }

    /// Offer one sample to every rule's windows
    pub fn ingest(&mut self, sample: &Sample) -> IngestOutcome {
        if self.deleted {
            return IngestOutcome {
                disposition: SampleDisposition::Deleted,
                published: Vec::new(),
            };
        }

        if !self.spec.in_range(sample.timestamp) {
            self.stats.out_of_range_samples += 1;
            trace!("topic '{}': sample @{} out of range", self.name, sample.timestamp);
            return IngestOutcome {
                disposition: SampleDisposition::OutOfRange,
                published: Vec::new(),
            };
        }

        let mut accepted = false;
        let mut late = false;
        for aggregator in &mut self.aggregators {
            let admission = aggregator.add(sample.timestamp, &sample.value);
            accepted |= admission.accepted > 0;
            late |= admission.is_late();

            if admission.overflowed > 0 {
                let rule_state = self.spec.ladder.rules()[aggregator.rule_index()].state;
                let error = TopicError::Resource(format!(
                    "rule for state {rule_state} reached its open window limit"
                ));
                warn!("topic '{}': {}", self.name, error);
                self.stats.faults += 1;
                self.faults.report(EvaluationFault::new(
                    &self.name,
                    Some(rule_state),
                    None,
                    &error,
                ));
            }
        }

        let disposition = if accepted {
            self.stats.samples_accepted += 1;
            SampleDisposition::Accepted
        } else if late {
            self.stats.late_samples += 1;
            let error = TopicError::LateData(format!(
                "sample @{} is behind watermark {:?}",
                sample.timestamp, self.watermark
            ));
            debug!("topic '{}': {}", self.name, error);
            self.faults
                .report(EvaluationFault::new(&self.name, None, None, &error));
            SampleDisposition::Late
        } else {
            self.stats.rejected_samples += 1;
            SampleDisposition::Rejected
        };

        let published = match self.watermark_policy {
            WatermarkPolicy::Manual => Vec::new(),
            WatermarkPolicy::EventTime {
                allowed_lateness_ms,
            } => {
                let max_seen = self
                    .max_seen
                    .map_or(sample.timestamp, |seen| seen.max(sample.timestamp));
                self.max_seen = Some(max_seen);
                self.advance_watermark(max_seen.saturating_sub(allowed_lateness_ms))
            }
        };

        IngestOutcome {
            disposition,
            published,
        }
    }

    /// Close and evaluate every window ending at or before `watermark`.
    ///
    /// Returns the events that passed suppression, in window-close order.
    pub fn advance_watermark(&mut self, watermark: Millis) -> Vec<PublishEvent> {
        if self.deleted || self.watermark.is_some_and(|w| w >= watermark) {
            return Vec::new();
        }
        self.watermark = Some(watermark);

        let mut closes: Vec<WindowClose> = self
            .aggregators
            .iter_mut()
            .flat_map(|aggregator| aggregator.close_through(watermark))
            .collect();
        closes.sort_by_key(|close| (close.end, close.rule_index));

        self.stats.windows_closed += closes.len() as u64;
        closes
            .into_iter()
            .filter_map(|close| self.evaluate_close(close, watermark))
            .collect()
    }

    fn evaluate_close(&mut self, close: WindowClose, watermark: Millis) -> Option<PublishEvent> {
        let rule = &self.spec.ladder.rules()[close.rule_index];

        // Stage 1: aggregate
        let aggregate = match close.aggregate {
            Ok(aggregate) => aggregate,
            Err(error) => {
                warn!(
                    "topic '{}': rule {} window [{}, {}) skipped: {}",
                    self.name, rule.state, close.start, close.end, error
                );
                self.stats.faults += 1;
                self.faults.report(EvaluationFault::new(
                    &self.name,
                    Some(rule.state),
                    Some(close.end),
                    &error,
                ));
                return None;
            }
        };
        self.stats.evaluations += 1;

        // Stage 2: classify
        let band = match aggregate {
            AggregateValue::Value(value) => BandClassifier::classify(&self.spec.ladder, value),
            AggregateValue::Matching { matched: true, .. } => Band::State(rule.state),
            AggregateValue::Matching { matched: false, .. } => Band::Unclassified,
        };

        // Stage 3: detect
        let (state, candidate, kind) = match self.detector.observe(band) {
            Transition::NoChange => return None,
            Transition::Steady(state) => (state, Candidate::Repeat, PublishKind::Repeat),
            Transition::Changed { from, to } => {
                debug!(
                    "topic '{}': band {:?} -> state {} at {}",
                    self.name, from, to, close.end
                );
                (to, Candidate::Transition, PublishKind::Transition)
            }
        };

        // Stage 4: suppress
        let policy = self
            .spec
            .ladder
            .index_of_state(state)
            .and_then(|index| self.spec.ladder.rules()[index].repeat_pub);
        let decision = self.suppressor.decide(state, candidate, policy, close.end);
        if decision == SuppressionDecision::Suppress {
            self.stats.suppressed += 1;
            trace!(
                "topic '{}': state {} at {} suppressed",
                self.name,
                state,
                close.end
            );
            return None;
        }

        // Stage 5: dispatch
        let event = PublishEvent {
            topic: self.name.clone(),
            state,
            aggregate_value: aggregate.reported(),
            window_start: close.start,
            window_end: close.end,
            timestamp: watermark,
            device: self.key.qualified_device(),
            point: self.key.endpoint.clone(),
            kind,
        };
        self.dispatcher.dispatch(&event);
        self.stats.published += 1;
        Some(event)
    }

    /// Stop evaluation for good and release every subscriber
    pub fn shut_down(&mut self) {
        self.deleted = true;
        for aggregator in &mut self.aggregators {
            aggregator.clear();
        }
        self.dispatcher.close_all();
    }

    pub fn save_state(&self) -> Result<String, TopicError> {
        let state = PipelineState {
            detector: self.detector.clone(),
            suppressor: self.suppressor.clone(),
            watermark: self.watermark,
        };
        Ok(serde_json::to_string(&state)?)
    }

    pub fn load_state(&mut self, json: &str) -> Result<(), TopicError> {
        let state: PipelineState =
            serde_json::from_str(json).map_err(|e| TopicError::ParseError(e.to_string()))?;
        self.detector = state.detector;
        self.suppressor = state.suppressor;
        if let Some(watermark) = state.watermark {
            let discarded: usize = self
                .aggregators
                .iter_mut()
                .map(|aggregator| aggregator.close_through(watermark).len())
                .sum();
            if discarded > 0 {
                warn!(
                    "topic '{}': restored watermark {} discarded {} open window(s)",
                    self.name, watermark, discarded
                );
            }
            self.stats.windows_discarded += discarded as u64;
            self.watermark = Some(watermark);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::dispatcher::SubscriberQueue;
    use crate::rules::{Aggregation, ExcludeRule, RepeatPub, Rule};
    use crate::types::Scope;

    fn pipeline_with(rules: Vec<Rule>, config: &EngineConfig) -> TopicPipeline {
        let spec = TopicSpec::new("device1", "temp", rules).unwrap();
        let key = EndpointKey::resolve("device1", "temp", &Scope::default()).unwrap();
        TopicPipeline::new("t", key, spec, config, Arc::new(FaultChannel::new(16)))
    }

    fn comfort_rule() -> Rule {
        Rule::new(1, Some(13.64), Some(23.0), ExcludeRule::Both)
            .with_window(3000, 3000)
            .with_aggregation(Aggregation::Avg)
            .with_repeat_pub(RepeatPub::Duration { ms: 200_000 })
    }

    #[test]
    fn test_single_window_publishes_once() {
        let mut pipeline = pipeline_with(vec![comfort_rule()], &EngineConfig::default());
        for (t, v) in [(0, 15.0), (1000, 18.0), (2000, 20.0)] {
            assert_eq!(
                pipeline.ingest(&Sample::new(t, v)).disposition,
                SampleDisposition::Accepted
            );
        }

        let events = pipeline.advance_watermark(3000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, 1);
        assert_eq!(events[0].window_end, 3000);
        assert_eq!(events[0].kind, PublishKind::Transition);
        assert!((events[0].aggregate_value - 53.0 / 3.0).abs() < 1e-9);
        assert_eq!(pipeline.current_band(), Band::State(1));
    }

    #[test]
    fn test_steady_band_publishes_once_within_repeat_period() {
        let mut pipeline = pipeline_with(vec![comfort_rule()], &EngineConfig::default());
        let mut published = 0;
        for window in 0..50 {
            let t = window * 3000;
            pipeline.ingest(&Sample::new(t + 100, 17.0));
            published += pipeline.advance_watermark(t + 3000).len();
        }
        assert_eq!(published, 1);
        assert_eq!(pipeline.stats().suppressed, 49);
    }

    #[test]
    fn test_late_sample_after_close() {
        let mut pipeline = pipeline_with(vec![comfort_rule()], &EngineConfig::default());
        pipeline.ingest(&Sample::new(100, 15.0));
        pipeline.advance_watermark(3000);

        let outcome = pipeline.ingest(&Sample::new(200, 16.0));
        assert_eq!(outcome.disposition, SampleDisposition::Late);
        assert_eq!(pipeline.stats().late_samples, 1);
    }

    #[test]
    fn test_late_sample_reports_late_data_fault() {
        let faults = Arc::new(FaultChannel::new(4));
        let spec = TopicSpec::new("device1", "temp", vec![comfort_rule()]).unwrap();
        let key = EndpointKey::resolve("device1", "temp", &Scope::default()).unwrap();
        let mut pipeline =
            TopicPipeline::new("t", key, spec, &EngineConfig::default(), faults.clone());

        pipeline.ingest(&Sample::new(100, 15.0));
        pipeline.advance_watermark(3000);
        faults.drain();

        pipeline.ingest(&Sample::new(200, 16.0));
        let drained = faults.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].code, 13033);
        assert_eq!(drained[0].kind, "LATE_DATA");
        assert_eq!(drained[0].rule_state, None);
        assert_eq!(pipeline.stats().faults, 0);
    }

    #[test]
    fn test_event_time_watermark_closes_windows() {
        let config = EngineConfig {
            watermark: WatermarkPolicy::EventTime {
                allowed_lateness_ms: 500,
            },
            ..EngineConfig::default()
        };
        let mut pipeline = pipeline_with(vec![comfort_rule()], &config);
        pipeline.ingest(&Sample::new(100, 15.0));
        assert!(pipeline.ingest(&Sample::new(3200, 15.0)).published.is_empty());

        let outcome = pipeline.ingest(&Sample::new(3500, 15.0));
        assert_eq!(outcome.published.len(), 1);
        assert_eq!(outcome.published[0].timestamp, 3000);
    }

    #[test]
    fn test_non_numeric_window_reports_fault() {
        let faults = Arc::new(FaultChannel::new(4));
        let spec = TopicSpec::new("device1", "temp", vec![comfort_rule()]).unwrap();
        let key = EndpointKey::resolve("device1", "temp", &Scope::default()).unwrap();
        let mut pipeline =
            TopicPipeline::new("t", key, spec, &EngineConfig::default(), faults.clone());

        pipeline.ingest(&Sample::new(100, "offline".to_string()));
        assert!(pipeline.advance_watermark(3000).is_empty());

        let drained = faults.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].rule_state, Some(1));
        assert_eq!(drained[0].window_end, Some(3000));
        assert_eq!(pipeline.current_band(), Band::Unclassified);
    }

    #[test]
    fn test_matching_rule_asserts_its_state() {
        let rules = vec![
            Rule::new(0, None, Some(10.0), ExcludeRule::Both).with_window(1000, 1000),
            Rule::new(1, Some(10.0), None, ExcludeRule::LowerIncluded)
                .with_window(1000, 1000)
                .with_aggregation(Aggregation::Matching(75.0)),
        ];
        let mut pipeline = pipeline_with(rules, &EngineConfig::default());
        for v in [12.0, 14.0, 16.0, 5.0] {
            pipeline.ingest(&Sample::new(500, v));
        }

        // LAST of rule 0 is 5.0 -> state 0; MATCHING of rule 1 is 75% -> state 1
        let events = pipeline.advance_watermark(1000);
        let states: Vec<u32> = events.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![0, 1]);
        assert_eq!(events[1].aggregate_value, 75.0);
    }

    #[test]
    fn test_subscribers_receive_events_until_shut_down() {
        let mut pipeline = pipeline_with(vec![comfort_rule()], &EngineConfig::default());
        let queue = Arc::new(SubscriberQueue::new(8, OverflowPolicy::DropOldest));
        pipeline.subscribe(Uuid::new_v4(), queue.clone());

        pipeline.ingest(&Sample::new(100, 15.0));
        pipeline.advance_watermark(3000);
        assert_eq!(queue.len(), 1);

        pipeline.shut_down();
        assert!(queue.is_closed());
        assert_eq!(
            pipeline.ingest(&Sample::new(4000, 15.0)).disposition,
            SampleDisposition::Deleted
        );
        assert!(pipeline.advance_watermark(10_000).is_empty());
    }

    #[test]
    fn test_state_restore_skips_republish() {
        let mut first = pipeline_with(vec![comfort_rule()], &EngineConfig::default());
        first.ingest(&Sample::new(100, 15.0));
        first.advance_watermark(3000);
        let saved = first.save_state().unwrap();

        let mut second = pipeline_with(vec![comfort_rule()], &EngineConfig::default());
        second.load_state(&saved).unwrap();
        assert_eq!(second.current_band(), Band::State(1));
        assert_eq!(second.watermark(), Some(3000));

        second.ingest(&Sample::new(3100, 16.0));
        assert!(second.advance_watermark(6000).is_empty());
    }

    #[test]
    fn test_load_state_counts_discarded_windows() {
        let mut first = pipeline_with(vec![comfort_rule()], &EngineConfig::default());
        first.ingest(&Sample::new(100, 15.0));
        first.advance_watermark(6000);
        let saved = first.save_state().unwrap();

        let mut live = pipeline_with(vec![comfort_rule()], &EngineConfig::default());
        live.ingest(&Sample::new(1000, 15.0));
        live.ingest(&Sample::new(4000, 15.0));
        live.ingest(&Sample::new(7000, 15.0));
        live.load_state(&saved).unwrap();

        let stats = live.stats();
        assert_eq!(stats.windows_discarded, 2);
        assert_eq!(stats.open_windows, 1);
        assert_eq!(stats.evaluations, 0);
    }
}
