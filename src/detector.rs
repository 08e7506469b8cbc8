//! Transition detection
//!
//! Tracks the current band of a topic. This is the only place the band is
//! allowed to change.

use crate::types::Band;
use serde::{Deserialize, Serialize};

/// What a classification meant for the topic's band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing matched; the band is left untouched
    NoChange,
    /// Same state as before
    Steady(u32),
    /// The band moved to a new state
    Changed { from: Band, to: u32 },
}

/// Per-topic band state machine, initially unclassified
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionDetector {
    current_band: Band,
    transitions: u64,
}

impl TransitionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_band(&self) -> Band {
        self.current_band
    }

    /// Number of genuine transitions observed so far
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Feed one window close's classification.
    ///
    /// The band is updated here, before any suppression decision, so a
    /// withheld publish still moves the state.
    pub fn observe(&mut self, band: Band) -> Transition {
        let Band::State(to) = band else {
            return Transition::NoChange;
        };

        if self.current_band == band {
            return Transition::Steady(to);
        }

        let from = self.current_band;
        self.current_band = band;
        self.transitions += 1;
        Transition::Changed { from, to }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
