//! Topic Watch CLI - replay telemetry through threshold topics
//!
//! Commands:
//! - run: Evaluate an NDJSON sample stream against a set of topics
//! - validate: Check topic definitions without running them
//! - doctor: Diagnose configuration and environment
//! - schema: Print input and output formats

use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use log::{info, warn};
use topic_watch::source::NdjsonSource;
use topic_watch::{
    EngineConfig, MessageEncoder, Millis, PublishMessage, TopicError, TopicRegistry, TopicSpec,
    WatermarkPolicy, ENGINE_NAME, VERSION,
};

/// Topic Watch - windowed threshold evaluation over device telemetry
#[derive(Parser)]
#[command(name = "topicwatch")]
#[command(version = VERSION)]
#[command(about = "Evaluate threshold topics over telemetry streams", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate an NDJSON sample stream against a set of topics
    Run {
        /// Topic definitions (JSON object keyed by topic name, or array of {name, spec})
        #[arg(short, long)]
        topics: PathBuf,

        /// Sample stream path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Engine configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Advance watermarks from ingest, trailing the newest sample by this many ms
        #[arg(long)]
        event_time_lateness: Option<Millis>,

        /// Watermark applied to every topic once the input is exhausted
        #[arg(long)]
        final_watermark: Option<Millis>,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Load detector and suppressor state from file
        #[arg(long)]
        load_state: Option<PathBuf>,

        /// Save detector and suppressor state to file after processing
        #[arg(long)]
        save_state: Option<PathBuf>,
    },

    /// Check topic definitions without running them
    Validate {
        /// Topic definitions path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration and environment
    Doctor {
        /// Engine configuration file to check
        #[arg(long)]
        config: Option<PathBuf>,

        /// Topic definitions file to check
        #[arg(long)]
        topics: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print schema information
    Schema {
        /// Schema to print (input or output)
        #[arg(value_enum)]
        schema_type: SchemaType,

        /// Output as JSON schema
        #[arg(long)]
        json_schema: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one publish message per line)
    Ndjson,
    /// JSON array of publish messages, merged by close time
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

#[derive(Clone, ValueEnum)]
enum SchemaType {
    /// Topic definitions and sample stream
    Input,
    /// Publish messages
    Output,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .target(env_logger::Target::Stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), TopicCliError> {
    match cli.command {
        Commands::Run {
            topics,
            input,
            output,
            config,
            event_time_lateness,
            final_watermark,
            output_format,
            load_state,
            save_state,
        } => cmd_run(RunOptions {
            topics,
            input,
            output,
            config,
            event_time_lateness,
            final_watermark,
            output_format,
            load_state,
            save_state,
        }),

        Commands::Validate { input, json } => cmd_validate(&input, json),

        Commands::Doctor {
            config,
            topics,
            json,
        } => cmd_doctor(config.as_deref(), topics.as_deref(), json),

        Commands::Schema {
            schema_type,
            json_schema,
        } => cmd_schema(schema_type, json_schema),
    }
}

struct RunOptions {
    topics: PathBuf,
    input: PathBuf,
    output: PathBuf,
    config: Option<PathBuf>,
    event_time_lateness: Option<Millis>,
    final_watermark: Option<Millis>,
    output_format: OutputFormat,
    load_state: Option<PathBuf>,
    save_state: Option<PathBuf>,
}

fn cmd_run(options: RunOptions) -> Result<(), TopicCliError> {
    let mut config = match &options.config {
        Some(path) => EngineConfig::from_json(&fs::read_to_string(path)?)?,
        None => EngineConfig::default(),
    };
    if let Some(lateness) = options.event_time_lateness {
        config.watermark = WatermarkPolicy::EventTime {
            allowed_lateness_ms: lateness,
        };
        config.validate()?;
    }

    let definitions = read_topic_definitions(&options.topics)?;
    if definitions.is_empty() {
        return Err(TopicCliError::NoTopics);
    }

    let registry = TopicRegistry::new(config);
    for (name, spec) in &definitions {
        registry.create_topic(name, &spec.to_string())?;
    }
    info!("created {} topic(s)", definitions.len());

    if let Some(path) = &options.load_state {
        let saved: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&fs::read_to_string(path)?)?;
        for (name, state) in &saved {
            match registry.load_state(name, &state.to_string()) {
                Ok(()) => {}
                Err(TopicError::NotFound(_)) => warn!("saved state for unknown topic {}", name),
                Err(e) => return Err(e.into()),
            }
        }
    }

    let mut report = if options.input.to_string_lossy() == "-" {
        let stdin = io::stdin();
        let mut source = NdjsonSource::new(stdin.lock());
        registry.drain_source(&mut source)?
    } else {
        let file = fs::File::open(&options.input)?;
        let mut source = NdjsonSource::new(BufReader::new(file));
        registry.drain_source(&mut source)?
    };

    if let Some(watermark) = options.final_watermark {
        report.published.extend(registry.advance_all(watermark));
    }

    info!(
        "processed {} sample(s), {} watermark(s): {} unrouted, {} late, {} out of range, {} published",
        report.samples,
        report.watermarks,
        report.unrouted,
        report.late,
        report.out_of_range,
        report.published.len()
    );
    for fault in registry.drain_faults() {
        warn!(
            "fault in topic {} ({}): {}",
            fault.topic, fault.kind, fault.message
        );
    }

    if let Some(path) = &options.save_state {
        let mut saved: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        for name in registry.topic_names() {
            saved.insert(name.clone(), serde_json::from_str(&registry.save_state(&name)?)?);
        }
        fs::write(path, serde_json::to_string_pretty(&saved)?)?;
    }

    let encoder = MessageEncoder::new();
    let messages = match options.output_format {
        OutputFormat::Ndjson => report
            .published
            .iter()
            .map(|event| encoder.encode(event))
            .collect(),
        OutputFormat::Json | OutputFormat::JsonPretty => encoder.encode_grouped(&report.published),
    };
    let output_data = format_output(&messages, &options.output_format)?;

    if options.output.to_string_lossy() == "-" {
        let mut stdout = io::stdout();
        write!(stdout, "{}", output_data)?;
        stdout.flush()?;
    } else {
        fs::write(&options.output, output_data)?;
    }

    Ok(())
}

fn cmd_validate(input: &Path, json: bool) -> Result<(), TopicCliError> {
    let definitions = read_topic_definitions(input)?;

    let errors: Vec<ValidationErrorDetail> = definitions
        .iter()
        .enumerate()
        .filter_map(|(index, (name, spec))| {
            TopicSpec::parse(&spec.to_string())
                .err()
                .map(|e| ValidationErrorDetail {
                    index,
                    topic: name.clone(),
                    error: e.to_string(),
                })
        })
        .collect();

    let report = ValidationReport {
        total_topics: definitions.len(),
        valid_topics: definitions.len() - errors.len(),
        invalid_topics: errors.len(),
        errors,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total topics:   {}", report.total_topics);
        println!("Valid topics:   {}", report.valid_topics);
        println!("Invalid topics: {}", report.invalid_topics);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!("  - Topic {} (index {}): {}", err.topic, err.index, err.error);
            }
        }
    }

    if report.invalid_topics > 0 {
        Err(TopicCliError::ValidationFailed(report.invalid_topics))
    } else {
        Ok(())
    }
}

fn cmd_doctor(config: Option<&Path>, topics: Option<&Path>, json: bool) -> Result<(), TopicCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "engine_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("{} version {}", ENGINE_NAME, VERSION),
    });

    if let Some(path) = config {
        checks.push(check_file("config", path, |content| {
            let config = EngineConfig::from_json(content)?;
            Ok(format!(
                "Config valid (max {} topics, queue capacity {})",
                config.max_topics, config.subscriber_queue_capacity
            ))
        }));
    }

    if let Some(path) = topics {
        checks.push(check_file("topics", path, |content| {
            let definitions = parse_topic_definitions(content)?;
            let invalid = definitions
                .iter()
                .filter(|(_, spec)| TopicSpec::parse(&spec.to_string()).is_err())
                .count();
            if invalid > 0 {
                return Err(TopicCliError::ValidationFailed(invalid));
            }
            Ok(format!("{} topic definition(s) valid", definitions.len()))
        }));
    }

    // Check stdin is available (for streaming mode)
    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (streaming mode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        engine: ENGINE_NAME.to_string(),
        version: VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Topic Watch Doctor Report");
        println!("=========================");
        println!("Engine:  {}", report.engine);
        println!("Version: {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(TopicCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn check_file<F>(name: &str, path: &Path, check: F) -> DoctorCheck
where
    F: FnOnce(&str) -> Result<String, TopicCliError>,
{
    if !path.exists() {
        return DoctorCheck {
            name: name.to_string(),
            status: CheckStatus::Warning,
            message: format!("{} does not exist", path.display()),
        };
    }
    let outcome = fs::read_to_string(path)
        .map_err(TopicCliError::from)
        .and_then(|content| check(&content));
    match outcome {
        Ok(message) => DoctorCheck {
            name: name.to_string(),
            status: CheckStatus::Ok,
            message,
        },
        Err(e) => DoctorCheck {
            name: name.to_string(),
            status: CheckStatus::Error,
            message: CliError::from(e).message,
        },
    }
}

fn cmd_schema(schema_type: SchemaType, json_schema: bool) -> Result<(), TopicCliError> {
    match schema_type {
        SchemaType::Input => {
            if json_schema {
                println!("{}", serde_json::to_string_pretty(&input_json_schema())?);
            } else {
                println!("Input: topic definitions and NDJSON sample stream");
                println!();
                println!("Topic definition:");
                println!("  - deviceName, endpointName: endpoint the topic watches");
                println!("  - startTime, endTime: optional event-time range (ms or RFC 3339)");
                println!("  - rules: ordered, non-overlapping bands, each with");
                println!("    - state, lowerBound, upperBound, excludeRule (0-3)");
                println!("    - windowSize, windowOffset (e.g. \"3,000ms\", \"5s\")");
                println!("    - aggregation: LAST, AVG, SUM, MIN, MAX, COUNT, MATCHING(p)");
                println!("    - repeatPub: {{ duration }} or {{ count, period }}");
                println!();
                println!("Sample stream (one JSON object per line):");
                println!("  {{\"device\": \"d1\", \"endpoint\": \"temp\", \"timestamp\": 1000, \"value\": 15.2}}");
                println!("  {{\"watermark\": 3000}}");
                println!("  {{\"watermark\": 3000, \"device\": \"d1\", \"endpoint\": \"temp\"}}");
            }
        }
        SchemaType::Output => {
            if json_schema {
                println!("{}", serde_json::to_string_pretty(&output_json_schema())?);
            } else {
                println!("Output: publish messages");
                println!();
                println!("- time: close time of the evaluated window (ms)");
                println!("- datas: array of {{ device, point, value }}");
                println!("  - device: tenant.portal.device qualified name");
                println!("  - point: endpoint name");
                println!("  - value: window aggregate (percentage for MATCHING)");
            }
        }
    }

    Ok(())
}

// Helper functions

#[derive(Deserialize)]
#[serde(untagged)]
enum TopicDefinitions {
    Map(BTreeMap<String, serde_json::Value>),
    List(Vec<NamedTopic>),
}

#[derive(Deserialize)]
struct NamedTopic {
    name: String,
    spec: serde_json::Value,
}

fn read_topic_definitions(path: &Path) -> Result<Vec<(String, serde_json::Value)>, TopicCliError> {
    let content = if path.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(path)?
    };
    parse_topic_definitions(&content)
}

fn parse_topic_definitions(content: &str) -> Result<Vec<(String, serde_json::Value)>, TopicCliError> {
    let definitions: TopicDefinitions = serde_json::from_str(content)?;
    Ok(match definitions {
        TopicDefinitions::Map(map) => map.into_iter().collect(),
        TopicDefinitions::List(list) => list.into_iter().map(|t| (t.name, t.spec)).collect(),
    })
}

fn format_output(messages: &[PublishMessage], format: &OutputFormat) -> Result<String, TopicCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut out = String::new();
            for message in messages {
                out.push_str(&serde_json::to_string(message)?);
                out.push('\n');
            }
            Ok(out)
        }
        OutputFormat::Json => Ok(serde_json::to_string(messages)? + "\n"),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(messages)? + "\n"),
    }
}

fn input_json_schema() -> serde_json::Value {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "topic definition",
        "type": "object",
        "required": ["deviceName", "endpointName", "rules"],
        "properties": {
            "deviceName": { "type": "string" },
            "endpointName": { "type": "string" },
            "startTime": { "type": ["integer", "string"] },
            "endTime": { "type": ["integer", "string"] },
            "rules": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["lowerBound", "upperBound"],
                    "properties": {
                        "state": { "type": "integer", "minimum": 0 },
                        "lowerBound": { "type": "number" },
                        "upperBound": { "type": "number" },
                        "excludeRule": { "type": "integer", "minimum": 0, "maximum": 3 },
                        "windowSize": { "type": ["integer", "string"] },
                        "windowOffset": { "type": ["integer", "string"] },
                        "aggregation": { "type": "string" },
                        "repeatPub": {
                            "type": "object",
                            "properties": {
                                "duration": { "type": ["integer", "string"] },
                                "count": { "type": ["integer", "string"] },
                                "period": { "type": ["integer", "string"] }
                            }
                        }
                    }
                }
            }
        }
    })
}

fn output_json_schema() -> serde_json::Value {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "publish message",
        "type": "object",
        "required": ["time", "datas"],
        "properties": {
            "time": { "type": "integer" },
            "datas": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["device", "point", "value"],
                    "properties": {
                        "device": { "type": "string" },
                        "point": { "type": "string" },
                        "value": { "type": "number" }
                    }
                }
            }
        }
    })
}

// Error types

#[derive(Debug, thiserror::Error)]
enum TopicCliError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Topic(#[from] TopicError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} topic definition(s) failed validation")]
    ValidationFailed(usize),
    #[error("one or more health checks failed")]
    DoctorFailed,
    #[error("no topics defined")]
    NoTopics,
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<TopicCliError> for CliError {
    fn from(e: TopicCliError) -> Self {
        match e {
            TopicCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            TopicCliError::Topic(e) => {
                let hint = match &e {
                    TopicError::Validation(_) => "Run 'topicwatch validate' for details",
                    TopicError::ParseError(_) => "Check the sample stream format",
                    _ => "Check topic definitions and configuration",
                };
                CliError {
                    code: e.kind().to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            TopicCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            e @ TopicCliError::ValidationFailed(_) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: e.to_string(),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            e @ TopicCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: e.to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
            e @ TopicCliError::NoTopics => CliError {
                code: "NO_TOPICS".to_string(),
                message: e.to_string(),
                hint: Some("Ensure the topics file is not empty".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    total_topics: usize,
    valid_topics: usize,
    invalid_topics: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    index: usize,
    topic: String,
    error: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    engine: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
