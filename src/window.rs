//! Hopping window aggregation
//!
//! Each (topic, rule) pair owns one `WindowAggregator`. Windows are half-open
//! `[start, end)` intervals of `window_size_ms`, opening every
//! `window_offset_ms` from the topic origin, so several may overlap. Windows
//! materialise on their first sample and are closed in `end` order when the
//! watermark passes them.

use crate::error::TopicError;
use crate::rules::{Aggregation, Rule};
use crate::types::{Millis, SampleValue};
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default cap on concurrently open windows per rule
pub const DEFAULT_MAX_OPEN_WINDOWS: usize = 1_024;

/// Window geometry for one rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowShape {
    pub origin: Millis,
    pub size_ms: Millis,
    pub offset_ms: Millis,
}

impl WindowShape {
    pub fn new(origin: Millis, size_ms: Millis, offset_ms: Millis) -> Self {
        Self {
            origin,
            size_ms,
            offset_ms,
        }
    }

    /// `[start, end)` of every window that contains `timestamp`, ascending
    pub fn windows_containing(&self, timestamp: Millis) -> Vec<(Millis, Millis)> {
        let Some(rel) = timestamp.checked_sub(self.origin).filter(|rel| *rel >= 0) else {
            return Vec::new();
        };
        let k_max = rel.div_euclid(self.offset_ms);
        let k_min = ((rel - self.size_ms).div_euclid(self.offset_ms) + 1).max(0);

        // start never passes `timestamp`; only the end can run off the clock
        (k_min..=k_max)
            .map(|k| {
                let start = self.origin + k * self.offset_ms;
                (start, start.saturating_add(self.size_ms))
            })
            .filter(|(start, end)| *start <= timestamp && timestamp < *end)
            .collect()
    }
}

#[derive(Debug, Clone)]
struct WindowSample {
    timestamp: Millis,
    seq: u64,
    value: SampleValue,
}

/// A window that has received at least one sample and not yet closed
#[derive(Debug, Clone)]
pub struct OpenWindow {
    pub start: Millis,
    pub end: Millis,
    samples: Vec<WindowSample>,
}

impl OpenWindow {
    fn new(start: Millis, end: Millis) -> Self {
        Self {
            start,
            end,
            samples: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Result of aggregating one closed window
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggregateValue {
    /// Scalar aggregate, classified against the whole ladder
    Value(f64),
    /// MATCHING percentage and whether it reached the rule's threshold
    Matching { percent: f64, matched: bool },
}

impl AggregateValue {
    /// The number reported in publish events
    pub fn reported(&self) -> f64 {
        match self {
            AggregateValue::Value(v) => *v,
            AggregateValue::Matching { percent, .. } => *percent,
        }
    }
}

/// One window close, in `end` order
#[derive(Debug)]
pub struct WindowClose {
    pub rule_index: usize,
    pub start: Millis,
    pub end: Millis,
    pub sample_count: usize,
    pub aggregate: Result<AggregateValue, TopicError>,
}

/// Outcome of offering one sample to an aggregator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Admission {
    /// Windows the sample was appended to
    pub accepted: usize,
    /// Windows that had already closed
    pub late: usize,
    /// Windows that could not be opened because of the cap
    pub overflowed: usize,
}

impl Admission {
    /// The sample reached no window because every one had closed
    pub fn is_late(&self) -> bool {
        self.accepted == 0 && self.late > 0
    }
}

/// Counters for one aggregator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    pub samples_accepted: u64,
    pub late_samples: u64,
    pub overflowed_samples: u64,
    pub windows_closed: u64,
}

/// Hopping windows for one rule of one topic
#[derive(Debug, Clone)]
pub struct WindowAggregator {
    rule_index: usize,
    rule: Rule,
    shape: WindowShape,
    max_open: usize,
    open: BTreeMap<Millis, OpenWindow>,
    closed_through: Option<Millis>,
    next_seq: u64,
    stats: WindowStats,
}

impl WindowAggregator {
    pub fn new(rule_index: usize, rule: &Rule, origin: Millis, max_open: usize) -> Self {
        Self {
            rule_index,
            shape: WindowShape::new(origin, rule.window_size_ms, rule.window_offset_ms),
            rule: rule.clone(),
            max_open: max_open.max(1),
            open: BTreeMap::new(),
            closed_through: None,
            next_seq: 0,
            stats: WindowStats::default(),
        }
    }

    pub fn rule_index(&self) -> usize {
        self.rule_index
    }

    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    pub fn stats(&self) -> WindowStats {
        self.stats
    }

    pub fn open_window_count(&self) -> usize {
        self.open.len()
    }

    /// Spans of the currently open windows, ascending by start
    pub fn open_spans(&self) -> Vec<(Millis, Millis)> {
        self.open.values().map(|w| (w.start, w.end)).collect()
    }

    /// Append a sample to every open window containing it
    pub fn add(&mut self, timestamp: Millis, value: &SampleValue) -> Admission {
        let mut admission = Admission::default();
        let seq = self.next_seq;
        self.next_seq += 1;

        for (start, end) in self.shape.windows_containing(timestamp) {
            if self.closed_through.is_some_and(|w| end <= w) {
                admission.late += 1;
                continue;
            }
            if !self.open.contains_key(&start) && self.open.len() >= self.max_open {
                admission.overflowed += 1;
                continue;
            }
            self.open
                .entry(start)
                .or_insert_with(|| OpenWindow::new(start, end))
                .samples
                .push(WindowSample {
                    timestamp,
                    seq,
                    value: value.clone(),
                });
            admission.accepted += 1;
        }

        if admission.accepted > 0 {
            self.stats.samples_accepted += 1;
        } else if admission.late > 0 {
            self.stats.late_samples += 1;
        }
        if admission.overflowed > 0 {
            self.stats.overflowed_samples += 1;
        }

        trace!(
            "rule {} sample @{} -> {:?}",
            self.rule.state,
            timestamp,
            admission
        );
        admission
    }

    /// Close every open window with `end <= watermark`, ascending by end.
    ///
    /// The watermark never moves backwards; an older value is ignored.
    pub fn close_through(&mut self, watermark: Millis) -> Vec<WindowClose> {
        let watermark = match self.closed_through {
            Some(current) if current >= watermark => return Vec::new(),
            _ => watermark,
        };
        self.closed_through = Some(watermark);

        // Windows share a size, so end order equals start order.
        let first_open_start = watermark
            .saturating_sub(self.shape.size_ms)
            .saturating_add(1);
        let still_open = self.open.split_off(&first_open_start);
        let closing = std::mem::replace(&mut self.open, still_open);

        closing
            .into_values()
            .map(|window| {
                self.stats.windows_closed += 1;
                WindowClose {
                    rule_index: self.rule_index,
                    start: window.start,
                    end: window.end,
                    sample_count: window.samples.len(),
                    aggregate: aggregate(&self.rule, &window.samples),
                }
            })
            .collect()
    }

    /// Drop all open windows without evaluating them
    pub fn clear(&mut self) {
        self.open.clear();
    }
}

fn aggregate(rule: &Rule, samples: &[WindowSample]) -> Result<AggregateValue, TopicError> {
    if samples.is_empty() {
        return Err(TopicError::Evaluation("empty window".to_string()));
    }

    let numeric = || -> Result<Vec<f64>, TopicError> {
        samples.iter().map(|s| s.value.numeric()).collect()
    };

    let value = match rule.aggregation {
        Aggregation::Last => {
            let last = samples
                .iter()
                .max_by_key(|s| (s.timestamp, s.seq))
                .ok_or_else(|| TopicError::Evaluation("empty window".to_string()))?;
            last.value.numeric()?
        }
        Aggregation::Avg => {
            let values = numeric()?;
            values.iter().sum::<f64>() / values.len() as f64
        }
        Aggregation::Sum => numeric()?.iter().sum(),
        Aggregation::Min => numeric()?.into_iter().fold(f64::INFINITY, f64::min),
        Aggregation::Max => numeric()?.into_iter().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::Count => samples.len() as f64,
        Aggregation::Matching(threshold) => {
            let values = numeric()?;
            let inside = values.iter().filter(|v| rule.contains(**v)).count();
            let percent = inside as f64 * 100.0 / values.len() as f64;
            return Ok(AggregateValue::Matching {
                percent,
                matched: percent >= threshold,
            });
        }
    };

    Ok(AggregateValue::Value(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ExcludeRule;

    fn rule(aggregation: Aggregation) -> Rule {
        Rule::new(1, Some(10.0), Some(20.0), ExcludeRule::Both)
            .with_window(3000, 3000)
            .with_aggregation(aggregation)
    }

    fn value_of(close: &WindowClose) -> f64 {
        match close.aggregate.as_ref().unwrap() {
            AggregateValue::Value(v) => *v,
            AggregateValue::Matching { percent, .. } => *percent,
        }
    }

    #[test]
    fn test_overlapping_windows_share_sample() {
        let shape = WindowShape::new(0, 3000, 2000);
        assert_eq!(
            shape.windows_containing(2500),
            vec![(0, 3000), (2000, 5000)]
        );
        assert_eq!(shape.windows_containing(1000), vec![(0, 3000)]);
        assert_eq!(shape.windows_containing(3000), vec![(2000, 5000)]);
    }

    #[test]
    fn test_tumbling_and_gapped_shapes() {
        let tumbling = WindowShape::new(0, 1000, 1000);
        assert_eq!(tumbling.windows_containing(1000), vec![(1000, 2000)]);

        let gapped = WindowShape::new(0, 1000, 5000);
        assert!(gapped.windows_containing(3000).is_empty());
        assert!(gapped.windows_containing(-1).is_empty());
    }

    #[test]
    fn test_origin_shifts_windows() {
        let shape = WindowShape::new(500, 1000, 1000);
        assert_eq!(shape.windows_containing(1499), vec![(500, 1500)]);
        assert!(shape.windows_containing(499).is_empty());
    }

    #[test]
    fn test_window_end_saturates_near_clock_limit() {
        let shape = WindowShape::new(1000, Millis::MAX, Millis::MAX);
        assert_eq!(shape.windows_containing(2000), vec![(1000, Millis::MAX)]);

        let far = WindowShape::new(Millis::MIN, 1000, 1000);
        assert!(far.windows_containing(Millis::MAX).len() <= 1);
    }

    #[test]
    fn test_average_over_window() {
        let mut agg = WindowAggregator::new(0, &rule(Aggregation::Avg), 0, 16);
        for (t, v) in [(100, 15.0), (1200, 18.0), (2900, 20.0)] {
            assert_eq!(agg.add(t, &SampleValue::Number(v)).accepted, 1);
        }

        assert!(agg.close_through(2999).is_empty());
        let closes = agg.close_through(3000);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].sample_count, 3);
        assert!((value_of(&closes[0]) - 53.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_last_breaks_ties_by_arrival() {
        let mut agg = WindowAggregator::new(0, &rule(Aggregation::Last), 0, 16);
        agg.add(2000, &SampleValue::Number(1.0));
        agg.add(500, &SampleValue::Number(2.0));
        agg.add(2000, &SampleValue::Number(3.0));

        let closes = agg.close_through(3000);
        assert_eq!(value_of(&closes[0]), 3.0);
    }

    #[test]
    fn test_sum_min_max_count() {
        for (aggregation, expected) in [
            (Aggregation::Sum, 6.0),
            (Aggregation::Min, 1.0),
            (Aggregation::Max, 3.0),
            (Aggregation::Count, 3.0),
        ] {
            let mut agg = WindowAggregator::new(0, &rule(aggregation), 0, 16);
            for v in [1.0, 3.0, 2.0] {
                agg.add(10, &SampleValue::Number(v));
            }
            assert_eq!(value_of(&agg.close_through(3000)[0]), expected);
        }
    }

    #[test]
    fn test_matching_threshold() {
        let mut agg = WindowAggregator::new(0, &rule(Aggregation::Matching(60.0)), 0, 16);
        for v in [12.0, 15.0, 25.0] {
            agg.add(10, &SampleValue::Number(v));
        }
        let closes = agg.close_through(3000);
        match closes[0].aggregate.as_ref().unwrap() {
            AggregateValue::Matching { percent, matched } => {
                assert!((percent - 200.0 / 3.0).abs() < 1e-9);
                assert!(*matched);
            }
            other => panic!("unexpected aggregate {other:?}"),
        }
    }

    #[test]
    fn test_non_numeric_sample_fails_the_window() {
        let mut agg = WindowAggregator::new(0, &rule(Aggregation::Avg), 0, 16);
        agg.add(10, &SampleValue::Number(1.0));
        agg.add(20, &SampleValue::Text("offline".into()));
        let closes = agg.close_through(3000);
        assert!(matches!(closes[0].aggregate, Err(TopicError::Evaluation(_))));

        // COUNT does not need numbers
        let mut count = WindowAggregator::new(0, &rule(Aggregation::Count), 0, 16);
        count.add(20, &SampleValue::Text("offline".into()));
        assert_eq!(value_of(&count.close_through(3000)[0]), 1.0);
    }

    #[test]
    fn test_empty_windows_never_close() {
        let mut agg = WindowAggregator::new(0, &rule(Aggregation::Avg), 0, 16);
        assert!(agg.close_through(30_000).is_empty());
        assert_eq!(agg.stats().windows_closed, 0);
    }

    #[test]
    fn test_late_sample_is_dropped() {
        let mut agg = WindowAggregator::new(0, &rule(Aggregation::Avg), 0, 16);
        agg.add(100, &SampleValue::Number(1.0));
        agg.close_through(3000);

        let admission = agg.add(200, &SampleValue::Number(2.0));
        assert!(admission.is_late());
        assert_eq!(agg.stats().late_samples, 1);
        assert_eq!(agg.open_window_count(), 0);
    }

    #[test]
    fn test_partially_late_sample_reaches_open_window() {
        let r = rule(Aggregation::Avg).with_window(3000, 2000);
        let mut agg = WindowAggregator::new(0, &r, 0, 16);
        agg.close_through(3000);

        let admission = agg.add(2500, &SampleValue::Number(1.0));
        assert_eq!(admission.accepted, 1);
        assert_eq!(admission.late, 1);
        assert!(!admission.is_late());
        assert_eq!(agg.open_spans(), vec![(2000, 5000)]);
    }

    #[test]
    fn test_watermark_is_monotonic() {
        let mut agg = WindowAggregator::new(0, &rule(Aggregation::Avg), 0, 16);
        agg.close_through(6000);
        assert!(agg.close_through(1000).is_empty());
        assert!(agg.add(4000, &SampleValue::Number(1.0)).is_late());
    }

    #[test]
    fn test_closes_in_end_order() {
        let r = rule(Aggregation::Count).with_window(3000, 1000);
        let mut agg = WindowAggregator::new(0, &r, 0, 16);
        for t in [0, 1500, 2500, 4200] {
            agg.add(t, &SampleValue::Number(1.0));
        }
        let ends: Vec<Millis> = agg.close_through(5000).iter().map(|c| c.end).collect();
        assert_eq!(ends, vec![3000, 4000, 5000]);
        assert_eq!(agg.open_spans(), vec![(3000, 6000), (4000, 7000)]);
    }

    #[test]
    fn test_open_window_cap() {
        let mut agg = WindowAggregator::new(0, &rule(Aggregation::Count), 0, 2);
        agg.add(0, &SampleValue::Number(1.0));
        agg.add(3000, &SampleValue::Number(1.0));

        let admission = agg.add(6000, &SampleValue::Number(1.0));
        assert_eq!(admission.overflowed, 1);
        assert_eq!(agg.open_window_count(), 2);

        // existing windows still accept samples
        assert_eq!(agg.add(10, &SampleValue::Number(1.0)).accepted, 1);
    }
}
