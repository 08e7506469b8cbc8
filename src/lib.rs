//! Topic Watch - windowed threshold evaluation over device telemetry
//!
//! A topic binds one device endpoint to an ordered ladder of threshold
//! rules. Samples are aggregated over event-time windows, each closed window
//! is classified into a band, and band transitions are published to
//! subscribers: window aggregation → band classification → transition
//! detection → publish suppression → dispatch.
//!
//! ## Modules
//!
//! - **Registry**: topic lifecycle, subscriptions, sample routing
//! - **Pipeline**: per-topic evaluation stages
//! - **Clock**: optional wall-clock watermark driver for live runs

pub mod access;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod faults;
pub mod pipeline;
pub mod registry;
pub mod rules;
pub mod schema;
pub mod source;
pub mod suppressor;
pub mod types;
pub mod window;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use access::{AccessPolicy, AllowAll};
pub use clock::ClockDriver;
pub use config::{ClockConfig, EngineConfig, OverflowPolicy, WatermarkPolicy};
pub use dispatcher::{SubscriberQueue, TopicSink};
pub use encoder::MessageEncoder;
pub use error::TopicError;
pub use faults::EvaluationFault;
pub use pipeline::{TopicPipeline, TopicStats};
pub use registry::{SubscriptionHandle, TopicKey, TopicRegistry};
pub use rules::{Aggregation, ExcludeRule, RepeatPub, Rule, RuleLadder};
pub use schema::TopicSpec;
pub use source::{IngestItem, IterSource, NdjsonSource, SampleSource};
pub use types::{Band, EndpointKey, Millis, PublishEvent, PublishMessage, Sample, SampleValue};

/// Crate version, reported by the CLI and the C ABI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name used in diagnostics
pub const ENGINE_NAME: &str = "topic-watch";
