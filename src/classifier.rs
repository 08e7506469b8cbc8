//! Band classification
//!
//! Maps an aggregate value onto the rule ladder. The first rule, in
//! ascending state order, whose band contains the value wins.

use crate::rules::{Rule, RuleLadder};
use crate::types::Band;

/// Stateless classifier over a rule ladder
pub struct BandClassifier;

impl BandClassifier {
    /// Classify `value` against `ladder`
    pub fn classify(ladder: &RuleLadder, value: f64) -> Band {
        Self::matching_rule(ladder, value)
            .map(|rule| Band::State(rule.state))
            .unwrap_or(Band::Unclassified)
    }

    /// The rule whose band contains `value`, if any
    pub fn matching_rule(ladder: &RuleLadder, value: f64) -> Option<&Rule> {
        ladder.rules().iter().find(|rule| rule.contains(value))
    }

    /// Every rule whose band contains `value`.
    ///
    /// A validated ladder never yields more than one.
    pub fn all_matches(ladder: &RuleLadder, value: f64) -> Vec<u32> {
        ladder
            .rules()
            .iter()
            .filter(|rule| rule.contains(value))
            .map(|rule| rule.state)
            .collect()
    }
}
