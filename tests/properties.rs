//! Property tests for classification, window assignment and suppression

use proptest::prelude::*;
use topic_watch::classifier::BandClassifier;
use topic_watch::rules::{ExcludeRule, RepeatPub, Rule, RuleLadder};
use topic_watch::suppressor::{Candidate, PublishSuppressor, SuppressionDecision};
use topic_watch::types::Band;
use topic_watch::window::WindowShape;

/// Which side of a cut point owns it
#[derive(Debug, Clone, Copy)]
enum CutOwner {
    Below,
    Above,
    Neither,
}

fn cut_owner() -> impl Strategy<Value = CutOwner> {
    prop_oneof![
        Just(CutOwner::Below),
        Just(CutOwner::Above),
        Just(CutOwner::Neither),
    ]
}

fn exclude_rule(includes_lower: bool, includes_upper: bool) -> ExcludeRule {
    match (includes_lower, includes_upper) {
        (false, false) => ExcludeRule::Both,
        (false, true) => ExcludeRule::UpperIncluded,
        (true, false) => ExcludeRule::LowerIncluded,
        (true, true) => ExcludeRule::None,
    }
}

/// Adjacent bands over increasing cut points, open-ended at both extremes
fn ladder() -> impl Strategy<Value = RuleLadder> {
    (
        proptest::collection::vec((1u32..1_000, cut_owner()), 1..6),
        -500.0f64..500.0,
    )
        .prop_map(|(cuts, start)| {
            let mut bounds = Vec::with_capacity(cuts.len());
            let mut position = start;
            for (gap, owner) in &cuts {
                bounds.push((position, *owner));
                position += f64::from(*gap) / 10.0;
            }

            let rules = (0..=bounds.len())
                .map(|i| {
                    let below = i.checked_sub(1).map(|j| bounds[j]);
                    let above = bounds.get(i).copied();
                    let includes_lower = matches!(below, Some((_, CutOwner::Above)));
                    let includes_upper = matches!(above, Some((_, CutOwner::Below)));
                    Rule::new(
                        i as u32,
                        below.map(|(cut, _)| cut),
                        above.map(|(cut, _)| cut),
                        exclude_rule(includes_lower, includes_upper),
                    )
                })
                .collect();
            RuleLadder::new(rules).expect("generated ladder is valid")
        })
}

proptest! {
    /// A validated ladder never places a value in two bands
    #[test]
    fn classification_is_unique(ladder in ladder(), value in -1_000.0f64..1_000.0) {
        let matches = BandClassifier::all_matches(&ladder, value);
        prop_assert!(matches.len() <= 1, "value {} matched {:?}", value, matches);

        let expected = matches.first().map_or(Band::Unclassified, |s| Band::State(*s));
        prop_assert_eq!(BandClassifier::classify(&ladder, value), expected);
    }

    /// Cut points themselves classify into at most one band
    #[test]
    fn shared_bounds_are_unique(ladder in ladder()) {
        for rule in ladder.rules() {
            for bound in [rule.lower_bound, rule.upper_bound].into_iter().flatten() {
                prop_assert!(BandClassifier::all_matches(&ladder, bound).len() <= 1);
            }
        }
    }

    /// Every assigned window contains the timestamp, and hopping windows
    /// cover every timestamp past the origin
    #[test]
    fn windows_contain_their_samples(
        origin in -10_000i64..10_000,
        size in 1i64..10_000,
        offset in 1i64..10_000,
        delta in 0i64..1_000_000,
    ) {
        let shape = WindowShape::new(origin, size, offset);
        let timestamp = origin + delta;
        let windows = shape.windows_containing(timestamp);

        for (start, end) in &windows {
            prop_assert!(*start <= timestamp && timestamp < *end);
            prop_assert_eq!(end - start, size);
            prop_assert_eq!((start - origin).rem_euclid(offset), 0);
        }
        if offset <= size {
            prop_assert!(!windows.is_empty());
        }
        let most = (size + offset - 1) / offset;
        prop_assert!(windows.len() as i64 <= most);
    }

    /// Transitions are never withheld, whatever the repeat policy
    #[test]
    fn transitions_always_deliver(
        max in 0u32..3,
        period in proptest::option::of(1i64..10_000),
        steps in proptest::collection::vec((any::<bool>(), 0i64..1_000), 1..50),
    ) {
        let mut suppressor = PublishSuppressor::new();
        let policy = Some(RepeatPub::Count { max, period_ms: period });
        let mut now = 0;
        for (is_transition, step) in steps {
            now += step;
            let candidate = if is_transition { Candidate::Transition } else { Candidate::Repeat };
            let decision = suppressor.decide(1, candidate, policy, now);
            if is_transition {
                prop_assert_eq!(decision, SuppressionDecision::Deliver);
            }
        }
    }
}
