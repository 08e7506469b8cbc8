//! Threshold rules and the band ladder
//!
//! A topic carries an ordered ladder of rules. Each rule owns one state, a
//! value band, a window shape, an aggregation and an optional repeat policy.

use crate::error::TopicError;
use crate::types::Millis;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default window length when a rule omits `windowSize`
pub const DEFAULT_WINDOW_SIZE_MS: Millis = 1_000;

/// Longest accepted `windowSize` or `windowOffset` (366 days)
pub const MAX_WINDOW_MS: Millis = 366 * 24 * 3_600_000;

/// Boundary inclusion for a rule's `[lowerBound, upperBound]` band
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExcludeRule {
    /// Both bounds excluded: `lower < v < upper`
    #[default]
    Both,
    /// Only the upper bound is included: `lower < v <= upper`
    UpperIncluded,
    /// Only the lower bound is included: `lower <= v < upper`
    LowerIncluded,
    /// Nothing excluded: `lower <= v <= upper`
    None,
}

impl ExcludeRule {
    /// Wire codes: 0 both, 1 upper included, 2 lower included, 3 none
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ExcludeRule::Both),
            1 => Some(ExcludeRule::UpperIncluded),
            2 => Some(ExcludeRule::LowerIncluded),
            3 => Some(ExcludeRule::None),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "both" => Some(ExcludeRule::Both),
            "upperincluded" => Some(ExcludeRule::UpperIncluded),
            "lowerincluded" => Some(ExcludeRule::LowerIncluded),
            "none" => Some(ExcludeRule::None),
            _ => None,
        }
    }

    pub fn includes_lower(&self) -> bool {
        matches!(self, ExcludeRule::LowerIncluded | ExcludeRule::None)
    }

    pub fn includes_upper(&self) -> bool {
        matches!(self, ExcludeRule::UpperIncluded | ExcludeRule::None)
    }
}

/// Window aggregation function
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Last,
    Avg,
    Sum,
    Min,
    Max,
    Count,
    /// Percentage of samples inside the rule's own band; the window asserts
    /// the rule's state when the percentage reaches the threshold.
    Matching(f64),
}

impl Aggregation {
    /// Parse `LAST`, `AVG`, `SUM`, `MIN`, `MAX`, `COUNT` or `MATCHING(p)`
    pub fn parse(text: &str) -> Result<Self, TopicError> {
        let upper = text.trim().to_uppercase();
        let aggregation = match upper.as_str() {
            "LAST" => Aggregation::Last,
            "AVG" | "AVERAGE" | "MEAN" => Aggregation::Avg,
            "SUM" => Aggregation::Sum,
            "MIN" => Aggregation::Min,
            "MAX" => Aggregation::Max,
            "COUNT" => Aggregation::Count,
            other => {
                let inner = other
                    .strip_prefix("MATCHING(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| {
                        TopicError::Validation(format!("Unknown aggregation '{text}'"))
                    })?;
                let pct: f64 = inner.trim().trim_end_matches('%').trim().parse().map_err(|_| {
                    TopicError::Validation(format!("Invalid MATCHING percentage in '{text}'"))
                })?;
                Aggregation::Matching(pct)
            }
        };
        Ok(aggregation)
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Last => write!(f, "LAST"),
            Aggregation::Avg => write!(f, "AVG"),
            Aggregation::Sum => write!(f, "SUM"),
            Aggregation::Min => write!(f, "MIN"),
            Aggregation::Max => write!(f, "MAX"),
            Aggregation::Count => write!(f, "COUNT"),
            Aggregation::Matching(p) => write!(f, "MATCHING({p})"),
        }
    }
}

/// Re-publication policy while a band persists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatPub {
    /// At most one publish per `ms` for the same state
    Duration { ms: Millis },
    /// At most `max` publishes per state, per `period_ms` when set
    Count { max: u32, period_ms: Option<Millis> },
}

/// One rung of the band ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub state: u32,
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
    pub exclude_rule: ExcludeRule,
    pub window_size_ms: Millis,
    pub window_offset_ms: Millis,
    pub aggregation: Aggregation,
    pub repeat_pub: Option<RepeatPub>,
}

impl Rule {
    /// Rule with a tumbling window and no repeat policy
    pub fn new(
        state: u32,
        lower_bound: Option<f64>,
        upper_bound: Option<f64>,
        exclude_rule: ExcludeRule,
    ) -> Self {
        Self {
            state,
            lower_bound,
            upper_bound,
            exclude_rule,
            window_size_ms: DEFAULT_WINDOW_SIZE_MS,
            window_offset_ms: DEFAULT_WINDOW_SIZE_MS,
            aggregation: Aggregation::default(),
            repeat_pub: None,
        }
    }

    pub fn with_window(mut self, size_ms: Millis, offset_ms: Millis) -> Self {
        self.window_size_ms = size_ms;
        self.window_offset_ms = offset_ms;
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_repeat_pub(mut self, repeat_pub: RepeatPub) -> Self {
        self.repeat_pub = Some(repeat_pub);
        self
    }

    /// Most windows a single timestamp can fall into
    pub fn windows_per_sample(&self) -> i64 {
        let offset = self.window_offset_ms.max(1);
        (self.window_size_ms.max(0) + offset - 1) / offset
    }

    /// Band membership honouring `exclude_rule`; a missing bound is unbounded
    pub fn contains(&self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        let above_lower = match self.lower_bound {
            None => true,
            Some(lower) if self.exclude_rule.includes_lower() => value >= lower,
            Some(lower) => value > lower,
        };
        let below_upper = match self.upper_bound {
            None => true,
            Some(upper) if self.exclude_rule.includes_upper() => value <= upper,
            Some(upper) => value < upper,
        };
        above_lower && below_upper
    }

    fn validate(&self) -> Result<(), TopicError> {
        let state = self.state;
        if self.lower_bound.is_none() && self.upper_bound.is_none() {
            return Err(TopicError::Validation(format!(
                "rule for state {state} needs a lowerBound or an upperBound"
            )));
        }
        for bound in [self.lower_bound, self.upper_bound].into_iter().flatten() {
            if !bound.is_finite() {
                return Err(TopicError::Validation(format!(
                    "rule for state {state} has a non-finite bound"
                )));
            }
        }
        if let (Some(lower), Some(upper)) = (self.lower_bound, self.upper_bound) {
            let point_band = self.exclude_rule == ExcludeRule::None && lower == upper;
            if lower > upper || (lower == upper && !point_band) {
                return Err(TopicError::Validation(format!(
                    "rule for state {state} has an empty band [{lower}, {upper}]"
                )));
            }
        }
        if self.window_size_ms <= 0 {
            return Err(TopicError::Validation(format!(
                "rule for state {state} needs a positive windowSize"
            )));
        }
        if self.window_offset_ms <= 0 {
            return Err(TopicError::Validation(format!(
                "rule for state {state} needs a positive windowOffset"
            )));
        }
        if self.window_size_ms > MAX_WINDOW_MS || self.window_offset_ms > MAX_WINDOW_MS {
            return Err(TopicError::Validation(format!(
                "rule for state {state} has a window longer than {MAX_WINDOW_MS}ms"
            )));
        }
        if let Aggregation::Matching(pct) = self.aggregation {
            if !(pct > 0.0 && pct <= 100.0) {
                return Err(TopicError::Validation(format!(
                    "rule for state {state} has MATCHING percentage {pct} outside (0, 100]"
                )));
            }
        }
        match self.repeat_pub {
            Some(RepeatPub::Duration { ms }) if ms < 0 => Err(TopicError::Validation(format!(
                "rule for state {state} has a negative repeatPub"
            ))),
            Some(RepeatPub::Count { max: 0, .. }) => Err(TopicError::Validation(format!(
                "rule for state {state} has a repeatPub count of zero"
            ))),
            Some(RepeatPub::Count {
                period_ms: Some(p), ..
            }) if p <= 0 => Err(TopicError::Validation(format!(
                "rule for state {state} needs a positive repeatPub period"
            ))),
            _ => Ok(()),
        }
    }
}

/// Validated, ordered list of rules for one topic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleLadder {
    rules: Vec<Rule>,
}

impl RuleLadder {
    /// Validate and build a ladder.
    ///
    /// Rules must be non-empty, strictly ascending by state, and monotonic:
    /// the lower bound of each rung must not sit below the upper bound of
    /// the previous one, and no value may fall into two rungs.
    pub fn new(rules: Vec<Rule>) -> Result<Self, TopicError> {
        if rules.is_empty() {
            return Err(TopicError::Validation(
                "a topic needs at least one rule".to_string(),
            ));
        }

        for rule in &rules {
            rule.validate()?;
        }

        for pair in rules.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.state <= prev.state {
                return Err(TopicError::Validation(format!(
                    "rules must be ordered by ascending state ({} follows {})",
                    next.state, prev.state
                )));
            }

            let (Some(prev_upper), Some(next_lower)) = (prev.upper_bound, next.lower_bound) else {
                return Err(TopicError::Validation(format!(
                    "states {} and {} overlap: an unbounded side may only face outward",
                    prev.state, next.state
                )));
            };

            if next_lower < prev_upper {
                return Err(TopicError::Validation(format!(
                    "bounds are not monotonic: state {} starts at {} below state {} ending at {}",
                    next.state, next_lower, prev.state, prev_upper
                )));
            }

            if next_lower == prev_upper
                && prev.exclude_rule.includes_upper()
                && next.exclude_rule.includes_lower()
            {
                return Err(TopicError::Validation(format!(
                    "states {} and {} both include the shared bound {}",
                    prev.state, next.state, prev_upper
                )));
            }
        }

        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Position of the rule owning `state`
    pub fn index_of_state(&self, state: u32) -> Option<usize> {
        self.rules.iter().position(|r| r.state == state)
    }
}
