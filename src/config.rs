//! Engine configuration
//!
//! Every field has a default, so `{}` is a valid configuration document.

use crate::error::TopicError;
use crate::faults::DEFAULT_FAULT_CHANNEL_CAPACITY;
use crate::types::{Millis, Scope};
use crate::window::DEFAULT_MAX_OPEN_WINDOWS;
use serde::{Deserialize, Serialize};

/// Default maximum number of live topics per registry
pub const DEFAULT_MAX_TOPICS: usize = 1_024;

/// Default per-subscriber queue depth
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 1_024;

/// What a full subscriber queue does with a new event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room
    #[default]
    DropOldest,
    /// Discard the incoming event
    DropNewest,
}

/// How window closes are triggered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum WatermarkPolicy {
    /// Only explicit `advance_watermark` calls (or the clock driver) close windows
    #[default]
    Manual,
    /// Ingest advances the watermark to `max_seen - allowed_lateness_ms`
    #[serde(rename_all = "camelCase")]
    EventTime { allowed_lateness_ms: Millis },
}

/// Wall-clock driver settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClockConfig {
    /// Tick interval
    pub tick_ms: u64,
    /// How far behind wall-clock time the watermark trails
    pub grace_ms: Millis,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            grace_ms: 0,
        }
    }
}

/// Registry-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub scope: Scope,
    pub max_topics: usize,
    pub max_open_windows_per_rule: usize,
    pub subscriber_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub watermark: WatermarkPolicy,
    pub clock: ClockConfig,
    pub fault_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scope: Scope::default(),
            max_topics: DEFAULT_MAX_TOPICS,
            max_open_windows_per_rule: DEFAULT_MAX_OPEN_WINDOWS,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            watermark: WatermarkPolicy::default(),
            clock: ClockConfig::default(),
            fault_channel_capacity: DEFAULT_FAULT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json(json: &str) -> Result<Self, TopicError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, TopicError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), TopicError> {
        let positive = [
            ("maxTopics", self.max_topics),
            ("maxOpenWindowsPerRule", self.max_open_windows_per_rule),
            ("subscriberQueueCapacity", self.subscriber_queue_capacity),
            ("faultChannelCapacity", self.fault_channel_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TopicError::Validation(format!("{name} must be positive")));
            }
        }
        if self.clock.tick_ms == 0 {
            return Err(TopicError::Validation(
                "clock.tickMs must be positive".to_string(),
            ));
        }
        if let WatermarkPolicy::EventTime {
            allowed_lateness_ms,
        } = self.watermark
        {
            if allowed_lateness_ms < 0 {
                return Err(TopicError::Validation(
                    "watermark.allowedLatenessMs must not be negative".to_string(),
                ));
            }
        }
        Ok(())
    }
}
