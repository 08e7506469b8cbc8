//! Publish message encoding
//!
//! This module turns publish events into the wire payload handed to
//! subscribers: `{"time": <window end ms>, "datas": [{device, point, value}]}`.

use crate::error::TopicError;
use crate::types::{DataPoint, PublishEvent, PublishMessage};

/// Encoder for subscriber payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageEncoder;

impl MessageEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a single event
    pub fn encode(&self, event: &PublishEvent) -> PublishMessage {
        PublishMessage {
            time: event.window_end,
            datas: vec![Self::data_point(event)],
        }
    }

    /// Encode to JSON string
    pub fn encode_to_json(&self, event: &PublishEvent) -> Result<String, TopicError> {
        Ok(serde_json::to_string(&self.encode(event))?)
    }

    /// Merge events that closed at the same time into one message each.
    ///
    /// Input order is preserved: messages come out in order of their first
    /// event, and data points keep their relative order.
    pub fn encode_grouped(&self, events: &[PublishEvent]) -> Vec<PublishMessage> {
        let mut messages: Vec<PublishMessage> = Vec::new();
        for event in events {
            match messages.iter_mut().find(|m| m.time == event.window_end) {
                Some(message) => message.datas.push(Self::data_point(event)),
                None => messages.push(self.encode(event)),
            }
        }
        messages
    }

    fn data_point(event: &PublishEvent) -> DataPoint {
        DataPoint {
            device: event.device.clone(),
            point: event.point.clone(),
            value: event.aggregate_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PublishKind;
    use pretty_assertions::assert_eq;

    fn event(device: &str, end: i64, value: f64) -> PublishEvent {
        PublishEvent {
            topic: "t".to_string(),
            state: 1,
            aggregate_value: value,
            window_start: end - 3000,
            window_end: end,
            timestamp: end,
            device: device.to_string(),
            point: "temp".to_string(),
            kind: PublishKind::Transition,
        }
    }

    #[test]
    fn test_encode_publish_message() {
        let message = MessageEncoder::new().encode(&event("tenant1.portal1.device1", 3000, 17.5));
        assert_eq!(message.time, 3000);
        assert_eq!(
            message.datas,
            vec![DataPoint {
                device: "tenant1.portal1.device1".to_string(),
                point: "temp".to_string(),
                value: 17.5,
            }]
        );
    }

    #[test]
    fn test_encode_to_json() {
        let json = MessageEncoder::new()
            .encode_to_json(&event("device1", 3000, 17.5))
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["time"], 3000);
        assert_eq!(parsed["datas"][0]["device"], "device1");
        assert_eq!(parsed["datas"][0]["point"], "temp");
        assert_eq!(parsed["datas"][0]["value"], 17.5);
    }

    #[test]
    fn test_encode_grouped_merges_same_close_time() {
        let events = vec![
            event("device1", 3000, 1.0),
            event("device2", 3000, 2.0),
            event("device1", 6000, 3.0),
        ];
        let messages = MessageEncoder::new().encode_grouped(&events);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].datas.len(), 2);
        assert_eq!(messages[0].datas[1].device, "device2");
        assert_eq!(messages[1].time, 6000);
    }
}
