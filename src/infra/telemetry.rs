use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

// Pool and client chatter stays at warn unless RUST_LOG is set.
const QUIET_DEPENDENCIES: [&str; 3] = ["sqlx=warn", "hyper_util=warn", "reqwest=warn"];

/// Install the process-wide subscriber. Metric descriptions are registered
/// first so the exporter sees units before the first sample lands.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let mut filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();
    let quiet = if std::env::var_os(EnvFilter::DEFAULT_ENV).is_none() {
        QUIET_DEPENDENCIES.as_slice()
    } else {
        &[]
    };
    for directive in quiet {
        let directive = directive
            .parse()
            .map_err(|err| InfraError::telemetry(format!("bad filter `{directive}`: {err}")))?;
        filter = filter.add_directive(directive);
    }

    let output = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_thread_ids(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default())
        .with(output)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("subscriber already installed: {err}")))
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "almanac_book_hit_total",
            Unit::Count,
            "Books served from storage without computing geometry."
        );
        describe_counter!(
            "almanac_book_miss_total",
            Unit::Count,
            "Book requests that required a geometry computation."
        );
        describe_counter!(
            "almanac_narrative_hit_total",
            Unit::Count,
            "Narrative or section requests satisfied by stored content."
        );
        describe_counter!(
            "almanac_narrative_miss_total",
            Unit::Count,
            "Narrative or section requests that needed generation."
        );
        describe_counter!(
            "almanac_generation_failed_total",
            Unit::Count,
            "Generation attempts that produced nothing cacheable, by reason."
        );
        describe_counter!(
            "almanac_gate_rejected_total",
            Unit::Count,
            "Generation attempts rejected by the request gate, by limit."
        );
        describe_counter!(
            "almanac_budget_exceeded_total",
            Unit::Count,
            "Generation attempts refused because the daily budget is spent."
        );
        describe_counter!(
            "almanac_generation_tokens_total",
            Unit::Count,
            "Tokens consumed by the generation service."
        );
        describe_histogram!(
            "almanac_generation_ms",
            Unit::Milliseconds,
            "Generation call latency in milliseconds."
        );
    });
}
