//! Publish suppression
//!
//! Decides whether a publish candidate is delivered or withheld. State is
//! kept per rule, keyed by the state being published. Genuine transitions
//! always deliver and reset the rule's suppression state; steady
//! observations are re-published only as the rule's `repeat_pub` allows.

use crate::rules::RepeatPub;
use crate::types::Millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of publish candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidate {
    Transition,
    Repeat,
}

/// Deliver-or-drop outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionDecision {
    Deliver,
    Suppress,
}

/// Suppression bookkeeping for one rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppressionState {
    pub last_publish_time: Option<Millis>,
    pub publish_count: u32,
    pub period_start: Option<Millis>,
    pub delivered: u64,
    pub suppressed: u64,
}

/// Suppression state for every rule of a topic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishSuppressor {
    states: BTreeMap<u32, SuppressionState>,
}

impl PublishSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide a candidate for `state` at event time `now`
    pub fn decide(
        &mut self,
        state: u32,
        candidate: Candidate,
        policy: Option<RepeatPub>,
        now: Millis,
    ) -> SuppressionDecision {
        let entry = self.states.entry(state).or_default();

        let decision = match candidate {
            Candidate::Transition => {
                entry.last_publish_time = Some(now);
                entry.publish_count = 1;
                entry.period_start = Some(now);
                SuppressionDecision::Deliver
            }
            Candidate::Repeat => Self::decide_repeat(entry, policy, now),
        };

        match decision {
            SuppressionDecision::Deliver => entry.delivered += 1,
            SuppressionDecision::Suppress => entry.suppressed += 1,
        }
        decision
    }

    fn decide_repeat(
        entry: &mut SuppressionState,
        policy: Option<RepeatPub>,
        now: Millis,
    ) -> SuppressionDecision {
        match policy {
            None => SuppressionDecision::Suppress,
            Some(RepeatPub::Duration { ms }) => {
                let due = entry
                    .last_publish_time
                    .map_or(true, |last| now.saturating_sub(last) >= ms);
                if due {
                    entry.last_publish_time = Some(now);
                    SuppressionDecision::Deliver
                } else {
                    SuppressionDecision::Suppress
                }
            }
            Some(RepeatPub::Count { max, period_ms }) => {
                if let Some(period) = period_ms {
                    let elapsed = entry
                        .period_start
                        .map_or(true, |start| now.saturating_sub(start) >= period);
                    if elapsed {
                        entry.publish_count = 0;
                        entry.period_start = Some(now);
                    }
                }
                if entry.publish_count < max {
                    entry.publish_count += 1;
                    entry.last_publish_time = Some(now);
                    SuppressionDecision::Deliver
                } else {
                    SuppressionDecision::Suppress
                }
            }
        }
    }

    pub fn state_for(&self, state: u32) -> Option<&SuppressionState> {
        self.states.get(&state)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DURATION: Option<RepeatPub> = Some(RepeatPub::Duration { ms: 200_000 });

    #[test]
    fn test_transition_always_delivers() {
        let mut s = PublishSuppressor::new();
        for now in [0, 10, 20] {
            assert_eq!(
                s.decide(1, Candidate::Transition, DURATION, now),
                SuppressionDecision::Deliver
            );
        }
    }

    #[test]
    fn test_repeat_without_policy_is_suppressed() {
        let mut s = PublishSuppressor::new();
        s.decide(1, Candidate::Transition, None, 0);
        assert_eq!(
            s.decide(1, Candidate::Repeat, None, 1_000_000),
            SuppressionDecision::Suppress
        );
    }

    #[test]
    fn test_duration_policy() {
        let mut s = PublishSuppressor::new();
        s.decide(1, Candidate::Transition, DURATION, 3_000);

        assert_eq!(
            s.decide(1, Candidate::Repeat, DURATION, 6_000),
            SuppressionDecision::Suppress
        );
        assert_eq!(
            s.decide(1, Candidate::Repeat, DURATION, 202_999),
            SuppressionDecision::Suppress
        );
        assert_eq!(
            s.decide(1, Candidate::Repeat, DURATION, 203_000),
            SuppressionDecision::Deliver
        );
        // the clock restarts from the last delivery
        assert_eq!(
            s.decide(1, Candidate::Repeat, DURATION, 206_000),
            SuppressionDecision::Suppress
        );

        let state = s.state_for(1).unwrap();
        assert_eq!(state.delivered, 2);
        assert_eq!(state.suppressed, 3);
    }

    #[test]
    fn test_count_policy_without_period() {
        let policy = Some(RepeatPub::Count {
            max: 3,
            period_ms: None,
        });
        let mut s = PublishSuppressor::new();
        assert_eq!(
            s.decide(2, Candidate::Transition, policy, 0),
            SuppressionDecision::Deliver
        );

        let decisions: Vec<_> = (1..=4)
            .map(|i| s.decide(2, Candidate::Repeat, policy, i * 1000))
            .collect();
        assert_eq!(
            decisions,
            vec![
                SuppressionDecision::Deliver,
                SuppressionDecision::Deliver,
                SuppressionDecision::Suppress,
                SuppressionDecision::Suppress,
            ]
        );
    }

    #[test]
    fn test_count_policy_period_resets() {
        let policy = Some(RepeatPub::Count {
            max: 1,
            period_ms: Some(10_000),
        });
        let mut s = PublishSuppressor::new();
        s.decide(0, Candidate::Transition, policy, 0);

        assert_eq!(
            s.decide(0, Candidate::Repeat, policy, 5_000),
            SuppressionDecision::Suppress
        );
        assert_eq!(
            s.decide(0, Candidate::Repeat, policy, 10_000),
            SuppressionDecision::Deliver
        );
        assert_eq!(
            s.decide(0, Candidate::Repeat, policy, 15_000),
            SuppressionDecision::Suppress
        );
    }

    #[test]
    fn test_transition_resets_count() {
        let policy = Some(RepeatPub::Count {
            max: 1,
            period_ms: None,
        });
        let mut s = PublishSuppressor::new();
        s.decide(0, Candidate::Transition, policy, 0);
        assert_eq!(
            s.decide(0, Candidate::Repeat, policy, 1),
            SuppressionDecision::Suppress
        );

        s.decide(1, Candidate::Transition, policy, 2);
        assert_eq!(
            s.decide(0, Candidate::Transition, policy, 3),
            SuppressionDecision::Deliver
        );
        assert_eq!(s.state_for(0).unwrap().publish_count, 1);
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut s = PublishSuppressor::new();
        s.decide(1, Candidate::Transition, DURATION, 42);
        let restored = PublishSuppressor::from_json(&s.to_json().unwrap()).unwrap();
        assert_eq!(restored, s);
    }
}
