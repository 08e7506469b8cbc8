//! Topic creation schema
//!
//! This module defines the structured document accepted by `create_topic`
//! and turns it into a validated rule ladder.

mod topic_spec;

pub use topic_spec::*;
