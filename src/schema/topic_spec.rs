//! Topic creation payload
//!
//! Accepts both the flat rule layout:
//!
//! ```json
//! { "deviceName": "device1", "endpointName": "temp",
//!   "rules": [{ "state": 1, "lowerBound": 13.64, "upperBound": 23,
//!               "excludeRule": 0, "windowSize": "3000ms",
//!               "aggregation": "AVG", "repeatPub": "200000ms" }] }
//! ```
//!
//! and the nested layout with `computingRules` / `pubRules` per rule.

use crate::error::TopicError;
use crate::rules::{Aggregation, ExcludeRule, RepeatPub, Rule, RuleLadder, DEFAULT_WINDOW_SIZE_MS};
use crate::types::Millis;
use chrono::DateTime;
use serde::{Deserialize, Serialize};

/// Parsed and validated topic specification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicSpec {
    pub device_name: String,
    pub endpoint_name: String,
    pub start_time: Option<Millis>,
    pub end_time: Option<Millis>,
    pub ladder: RuleLadder,
}

impl TopicSpec {
    /// Build a spec from already-typed rules
    pub fn new(
        device_name: impl Into<String>,
        endpoint_name: impl Into<String>,
        rules: Vec<Rule>,
    ) -> Result<Self, TopicError> {
        Ok(Self {
            device_name: device_name.into(),
            endpoint_name: endpoint_name.into(),
            start_time: None,
            end_time: None,
            ladder: RuleLadder::new(rules)?,
        })
    }

    /// Restrict evaluation to `[start, end)`
    pub fn with_time_range(
        mut self,
        start_time: Option<Millis>,
        end_time: Option<Millis>,
    ) -> Result<Self, TopicError> {
        self.start_time = start_time;
        self.end_time = end_time;
        self.validate_time_range()?;
        Ok(self)
    }

    /// Parse a topic creation document
    pub fn parse(json: &str) -> Result<Self, TopicError> {
        let raw: RawTopicSpec = serde_json::from_str(json)
            .map_err(|e| TopicError::Validation(format!("Malformed topic spec: {e}")))?;

        if raw.device_name.trim().is_empty() {
            return Err(TopicError::Validation(
                "deviceName must not be empty".to_string(),
            ));
        }

        let start_time = raw.start_time.as_ref().map(parse_time).transpose()?;
        let end_time = raw.end_time.as_ref().map(parse_time).transpose()?;

        let rules = raw
            .rules
            .into_iter()
            .enumerate()
            .map(|(index, rule)| rule.into_rule(index))
            .collect::<Result<Vec<_>, _>>()?;

        let spec = Self {
            device_name: raw.device_name,
            endpoint_name: raw.endpoint_name,
            start_time,
            end_time,
            ladder: RuleLadder::new(rules)?,
        };
        spec.validate_time_range()?;
        Ok(spec)
    }

    /// Whether `timestamp` falls inside the topic's evaluation range
    pub fn in_range(&self, timestamp: Millis) -> bool {
        self.start_time.map_or(true, |start| timestamp >= start)
            && self.end_time.map_or(true, |end| timestamp < end)
    }

    fn validate_time_range(&self) -> Result<(), TopicError> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) if start >= end => Err(TopicError::Validation(format!(
                "startTime {start} must be before endTime {end}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Event time as either epoch milliseconds or an RFC 3339 string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTime {
    Millis(i64),
    Text(String),
}

/// Convert a raw time value to epoch milliseconds
pub fn parse_time(raw: &RawTime) -> Result<Millis, TopicError> {
    match raw {
        RawTime::Millis(ms) => Ok(*ms),
        RawTime::Text(text) => {
            let trimmed = text.trim();
            if let Ok(ms) = trimmed.parse::<i64>() {
                return Ok(ms);
            }
            DateTime::parse_from_rfc3339(trimmed)
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| TopicError::ParseError(format!("Invalid timestamp '{text}': {e}")))
        }
    }
}

/// Number of milliseconds, or a string such as `3000ms`, `3,000ms`, `3s`, `5m`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawExclude {
    Code(u8),
    Name(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawRepeat {
    Number(f64),
    Text(String),
    Object {
        #[serde(default)]
        duration: Option<RawScalar>,
        #[serde(default)]
        count: Option<u32>,
        #[serde(default)]
        period: Option<RawScalar>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawComputing {
    #[serde(default)]
    state: Option<u32>,
    #[serde(default)]
    lower_bound: Option<f64>,
    #[serde(default)]
    upper_bound: Option<f64>,
    #[serde(default)]
    exclude_rule: Option<RawExclude>,
    #[serde(default)]
    window_size: Option<RawScalar>,
    #[serde(default)]
    window_offset: Option<RawScalar>,
    #[serde(default, alias = "Aggregation")]
    aggregation: Option<String>,
    #[serde(default)]
    repeat_pub: Option<RawRepeat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPubRules {
    #[serde(default)]
    repeat_pub: Option<RawRepeat>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawRule {
    Nested {
        #[serde(rename = "computingRules")]
        computing_rules: RawComputing,
        #[serde(rename = "pubRules", default)]
        pub_rules: Option<RawPubRules>,
    },
    Flat(RawComputing),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTopicSpec {
    device_name: String,
    endpoint_name: String,
    #[serde(default)]
    start_time: Option<RawTime>,
    #[serde(default)]
    end_time: Option<RawTime>,
    #[serde(default)]
    rules: Vec<RawRule>,
}

impl RawRule {
    fn into_rule(self, index: usize) -> Result<Rule, TopicError> {
        let (computing, repeat) = match self {
            RawRule::Nested {
                computing_rules,
                pub_rules,
            } => {
                let repeat = pub_rules
                    .and_then(|p| p.repeat_pub)
                    .or_else(|| computing_rules.repeat_pub.clone());
                (computing_rules, repeat)
            }
            RawRule::Flat(computing) => {
                let repeat = computing.repeat_pub.clone();
                (computing, repeat)
            }
        };

        let state = computing.state.unwrap_or(index as u32);

        let exclude_rule = match computing.exclude_rule {
            None => ExcludeRule::default(),
            Some(RawExclude::Code(code)) => ExcludeRule::from_code(code).ok_or_else(|| {
                TopicError::Validation(format!("state {state}: unknown excludeRule code {code}"))
            })?,
            Some(RawExclude::Name(name)) => ExcludeRule::from_name(&name).ok_or_else(|| {
                TopicError::Validation(format!("state {state}: unknown excludeRule '{name}'"))
            })?,
        };

        let window_size_ms = match &computing.window_size {
            Some(raw) => parse_duration_ms(raw)?,
            None => DEFAULT_WINDOW_SIZE_MS,
        };
        let window_offset_ms = match &computing.window_offset {
            Some(raw) => parse_duration_ms(raw)?,
            None => window_size_ms,
        };

        let aggregation = match &computing.aggregation {
            Some(text) => Aggregation::parse(text)?,
            None => Aggregation::default(),
        };

        let repeat_pub = repeat.as_ref().map(parse_repeat).transpose()?;

        Ok(Rule {
            state,
            lower_bound: computing.lower_bound,
            upper_bound: computing.upper_bound,
            exclude_rule,
            window_size_ms,
            window_offset_ms,
            aggregation,
            repeat_pub,
        })
    }
}

fn parse_duration_ms(raw: &RawScalar) -> Result<Millis, TopicError> {
    match raw {
        RawScalar::Number(n) => {
            if !n.is_finite() || *n < 0.0 {
                return Err(TopicError::Validation(format!("Invalid duration {n}")));
            }
            Ok(n.round() as Millis)
        }
        RawScalar::Text(text) => parse_duration_text(text),
    }
}

fn parse_duration_text(text: &str) -> Result<Millis, TopicError> {
    let compact: String = text
        .chars()
        .filter(|c| *c != ',' && *c != '_' && !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    let split = compact
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(compact.len());
    let (number, unit) = compact.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| TopicError::Validation(format!("Invalid duration '{text}'")))?;

    let scale = match unit {
        "" | "ms" => 1.0,
        "s" | "sec" | "secs" => 1_000.0,
        "m" | "min" | "mins" => 60_000.0,
        "h" | "hr" | "hrs" => 3_600_000.0,
        _ => {
            return Err(TopicError::Validation(format!(
                "Unknown duration unit in '{text}'"
            )))
        }
    };

    Ok((value * scale).round() as Millis)
}

fn parse_count_text(text: &str) -> Option<u32> {
    let compact = text.trim().to_lowercase();
    let number = compact
        .strip_suffix("times")
        .or_else(|| compact.strip_suffix("time"))
        .or_else(|| compact.strip_suffix('x'))
        .or_else(|| compact.strip_prefix('x'))?;
    number.trim().parse().ok()
}

fn parse_repeat(raw: &RawRepeat) -> Result<RepeatPub, TopicError> {
    match raw {
        RawRepeat::Number(ms) => Ok(RepeatPub::Duration {
            ms: parse_duration_ms(&RawScalar::Number(*ms))?,
        }),
        RawRepeat::Text(text) => match parse_count_text(text) {
            Some(max) => Ok(RepeatPub::Count {
                max,
                period_ms: None,
            }),
            None => Ok(RepeatPub::Duration {
                ms: parse_duration_text(text)?,
            }),
        },
        RawRepeat::Object {
            duration,
            count,
            period,
        } => match (duration, count) {
            (Some(d), None) => Ok(RepeatPub::Duration {
                ms: parse_duration_ms(d)?,
            }),
            (None, Some(max)) => Ok(RepeatPub::Count {
                max: *max,
                period_ms: period.as_ref().map(parse_duration_ms).transpose()?,
            }),
            _ => Err(TopicError::Validation(
                "repeatPub needs exactly one of duration or count".to_string(),
            )),
        },
    }
}
