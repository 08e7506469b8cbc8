//! Core types for the Topic Watch pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: endpoint keys, raw samples, classified bands, and publish events.

use crate::error::TopicError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event time in milliseconds since the Unix epoch
pub type Millis = i64;

/// Session scope used to qualify partially-named devices
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant: Option<String>,
    pub portal: Option<String>,
}

impl Scope {
    pub fn new(tenant: impl Into<String>, portal: impl Into<String>) -> Self {
        Self {
            tenant: Some(tenant.into()),
            portal: Some(portal.into()),
        }
    }
}

/// Fully resolved (device, endpoint) pair a topic is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    pub tenant: Option<String>,
    pub portal: Option<String>,
    pub device: String,
    pub endpoint: String,
}

impl EndpointKey {
    /// Resolve a `tenant.portal.device`, `portal.device` or `device` name,
    /// filling missing qualifiers from the session scope.
    pub fn resolve(
        device_name: &str,
        endpoint_name: &str,
        scope: &Scope,
    ) -> Result<Self, TopicError> {
        let endpoint = endpoint_name.trim();
        if endpoint.is_empty() {
            return Err(TopicError::Validation(
                "endpointName must not be empty".to_string(),
            ));
        }

        let parts: Vec<&str> = device_name.trim().split('.').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(TopicError::Validation(format!(
                "Malformed deviceName '{device_name}'"
            )));
        }

        let (tenant, portal, device) = match parts.as_slice() {
            [device] => (scope.tenant.clone(), scope.portal.clone(), *device),
            [portal, device] => (scope.tenant.clone(), Some(portal.to_string()), *device),
            [tenant, portal, device] => {
                (Some(tenant.to_string()), Some(portal.to_string()), *device)
            }
            _ => {
                return Err(TopicError::Validation(format!(
                    "deviceName '{device_name}' has more than three components"
                )))
            }
        };

        Ok(Self {
            tenant,
            portal,
            device: device.to_string(),
            endpoint: endpoint.to_string(),
        })
    }

    /// Device name with every known qualifier, e.g. `tenant1.portal1.device1`
    pub fn qualified_device(&self) -> String {
        [self.tenant.as_deref(), self.portal.as_deref(), Some(self.device.as_str())]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.qualified_device(), self.endpoint)
    }
}

/// Raw sample value as delivered by the ingest adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Number(f64),
    Integer(i64),
    Boolean(bool),
    Text(String),
}

impl From<f64> for SampleValue {
    fn from(v: f64) -> Self {
        SampleValue::Number(v)
    }
}

impl From<i64> for SampleValue {
    fn from(v: i64) -> Self {
        SampleValue::Integer(v)
    }
}

impl From<bool> for SampleValue {
    fn from(v: bool) -> Self {
        SampleValue::Boolean(v)
    }
}

impl From<String> for SampleValue {
    fn from(v: String) -> Self {
        SampleValue::Text(v)
    }
}

impl SampleValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SampleValue::Number(n) if n.is_finite() => Some(*n),
            SampleValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            SampleValue::Number(_) => "non-finite number",
            SampleValue::Integer(_) => "integer",
            SampleValue::Boolean(_) => "boolean",
            SampleValue::Text(_) => "text",
        }
    }

    /// Numeric view of the value, or an evaluation error naming its type
    pub fn numeric(&self) -> Result<f64, TopicError> {
        self.as_f64().ok_or_else(|| {
            TopicError::Evaluation(format!("cannot aggregate {} sample", self.type_name()))
        })
    }
}

/// A single timestamped sample for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Millis,
    pub value: SampleValue,
}

impl Sample {
    pub fn new(timestamp: Millis, value: impl Into<SampleValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

/// Classification result for an aggregate value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    #[default]
    Unclassified,
    State(u32),
}

impl Band {
    pub fn state(&self) -> Option<u32> {
        match self {
            Band::Unclassified => None,
            Band::State(s) => Some(*s),
        }
    }
}

/// Why an event was published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishKind {
    /// The band changed
    Transition,
    /// The band persisted and the repeat policy allowed a re-publish
    Repeat,
}

/// Event delivered to topic subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEvent {
    pub topic: String,
    pub state: u32,
    pub aggregate_value: f64,
    pub window_start: Millis,
    pub window_end: Millis,
    /// Watermark at which the window was evaluated
    pub timestamp: Millis,
    pub device: String,
    pub point: String,
    pub kind: PublishKind,
}

/// One measurement in a publish message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub device: String,
    pub point: String,
    pub value: f64,
}

/// Wire payload handed to subscribers: `{time, datas: [{device, point, value}]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub time: Millis,
    pub datas: Vec<DataPoint>,
}
