//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{
    CliArgs, Command, DatabaseOverride, KeyArgs, MigrateArgs, ServeArgs, ServeOverrides,
};

use std::{net::SocketAddr, num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::{
    coordinator::{BudgetPolicy, LockPolicy},
    gate::RatePolicy,
};
use crate::domain::{
    EngineConfig, Language, NarrativeRules,
    engine::{CURRENT_SCHEMA_VERSION, HouseSystem, ZodiacMode},
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "almanac";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_ENGINE_ENDPOINT: &str = "http://127.0.0.1:8088";
const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_ALGORITHM_VERSION: u32 = 1;
const DEFAULT_GENERATION_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_GENERATION_MODEL: &str = "gpt-4o-mini";
const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 45;
const DEFAULT_GENERATION_MAX_OUTPUT_TOKENS: u32 = 1200;
const DEFAULT_PROMPT_VERSION: u32 = 1;
const DEFAULT_LANGUAGE: &str = "en";
const DEFAULT_BURST_MAX: u32 = 5;
const DEFAULT_BURST_WINDOW_SECS: u64 = 10;
const DEFAULT_COOLDOWN_SECS: u64 = 3;
const DEFAULT_SUSTAINED_MAX: u32 = 60;
const DEFAULT_SUSTAINED_WINDOW_SECS: u64 = 3600;
const DEFAULT_DAILY_TOKEN_LIMIT: u64 = 2_000_000;
const DEFAULT_LOCK_TTL_SECS: u64 = 120;
const DEFAULT_LOCK_RETRY_HINT_SECS: u64 = 5;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub engine: EngineSettings,
    pub generation: GenerationSettings,
    pub narrative: NarrativeSettings,
    pub rate_limit: RateLimitSettings,
    pub budget: BudgetSettings,
    pub locks: LockSettings,
    pub coordination: CoordinationSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub endpoint: String,
    pub timeout: Duration,
    /// Configuration every new book is computed and keyed with.
    pub config: EngineConfig,
}

#[derive(Clone)]
pub struct GenerationSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_output_tokens: NonZeroU32,
}

impl std::fmt::Debug for GenerationSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSettings")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NarrativeSettings {
    pub prompt_version: u32,
    pub default_language: Language,
    pub rules: NarrativeRules,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub burst_max: NonZeroU32,
    pub burst_window: Duration,
    pub cooldown: Duration,
    pub sustained_max: NonZeroU32,
    pub sustained_window: Duration,
}

#[derive(Debug, Clone)]
pub struct BudgetSettings {
    pub daily_token_limit: u64,
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub ttl: Duration,
    pub retry_hint: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct CoordinationSettings {
    pub backend: CoordinationBackend,
    pub sweep_interval: Duration,
}

impl From<&RateLimitSettings> for RatePolicy {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            burst_max: settings.burst_max.get(),
            burst_window: settings.burst_window,
            cooldown: settings.cooldown,
            sustained_max: settings.sustained_max.get(),
            sustained_window: settings.sustained_window,
        }
    }
}

impl From<&BudgetSettings> for BudgetPolicy {
    fn from(settings: &BudgetSettings) -> Self {
        Self {
            daily_token_limit: settings.daily_token_limit,
        }
    }
}

impl From<&LockSettings> for LockPolicy {
    fn from(settings: &LockSettings) -> Self {
        Self {
            ttl: settings.ttl,
            retry_hint: settings.retry_hint,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("ALMANAC").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
        Some(Command::Key(_)) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    engine: RawEngineSettings,
    generation: RawGenerationSettings,
    narrative: RawNarrativeSettings,
    rate_limit: RawRateLimitSettings,
    budget: RawBudgetSettings,
    locks: RawLockSettings,
    coordination: RawCoordinationSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(endpoint) = overrides.engine_endpoint.as_ref() {
            self.engine.endpoint = Some(endpoint.clone());
        }
        if let Some(endpoint) = overrides.generation_endpoint.as_ref() {
            self.generation.endpoint = Some(endpoint.clone());
        }
        if let Some(model) = overrides.generation_model.as_ref() {
            self.generation.model = Some(model.clone());
        }
        if let Some(version) = overrides.narrative_prompt_version {
            self.narrative.prompt_version = Some(version);
        }
        if let Some(limit) = overrides.budget_daily_token_limit {
            self.budget.daily_token_limit = Some(limit);
        }
        if let Some(backend) = overrides.coordination_backend.as_ref() {
            self.coordination.backend = Some(backend.clone());
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            engine,
            generation,
            narrative,
            rate_limit,
            budget,
            locks,
            coordination,
        } = raw;

        let database = build_database_settings(database)?;
        let coordination = build_coordination_settings(coordination, &database)?;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database,
            engine: build_engine_settings(engine)?,
            generation: build_generation_settings(generation)?,
            narrative: build_narrative_settings(narrative)?,
            rate_limit: build_rate_limit_settings(rate_limit)?,
            budget: build_budget_settings(budget)?,
            locks: build_lock_settings(locks)?,
            coordination,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    let graceful_shutdown = positive_secs(graceful_secs, "server.graceful_shutdown_seconds")?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let endpoint = endpoint(engine.endpoint, DEFAULT_ENGINE_ENDPOINT, "engine.endpoint")?;
    let timeout = positive_secs(
        engine.timeout_seconds.unwrap_or(DEFAULT_ENGINE_TIMEOUT_SECS),
        "engine.timeout_seconds",
    )?;

    let schema_version = engine.schema_version.unwrap_or(CURRENT_SCHEMA_VERSION);
    if schema_version == 0 {
        return Err(LoadError::invalid(
            "engine.schema_version",
            "must be greater than zero",
        ));
    }
    let algorithm_version = engine
        .algorithm_version
        .unwrap_or(DEFAULT_ALGORITHM_VERSION);

    Ok(EngineSettings {
        endpoint,
        timeout,
        config: EngineConfig {
            house_system: engine.house_system.unwrap_or_default(),
            zodiac: engine.zodiac.unwrap_or_default(),
            schema_version,
            algorithm_version,
        },
    })
}

fn build_generation_settings(
    generation: RawGenerationSettings,
) -> Result<GenerationSettings, LoadError> {
    let endpoint = endpoint(
        generation.endpoint,
        DEFAULT_GENERATION_ENDPOINT,
        "generation.endpoint",
    )?;
    let model = non_blank(generation.model).unwrap_or_else(|| DEFAULT_GENERATION_MODEL.to_string());
    let timeout = positive_secs(
        generation
            .timeout_seconds
            .unwrap_or(DEFAULT_GENERATION_TIMEOUT_SECS),
        "generation.timeout_seconds",
    )?;
    let max_output_tokens = non_zero_u32(
        generation
            .max_output_tokens
            .unwrap_or(DEFAULT_GENERATION_MAX_OUTPUT_TOKENS)
            .into(),
        "generation.max_output_tokens",
    )?;

    Ok(GenerationSettings {
        endpoint,
        model,
        api_key: non_blank(generation.api_key),
        timeout,
        max_output_tokens,
    })
}

fn build_narrative_settings(
    narrative: RawNarrativeSettings,
) -> Result<NarrativeSettings, LoadError> {
    let defaults = NarrativeRules::default();
    let prompt_version = narrative.prompt_version.unwrap_or(DEFAULT_PROMPT_VERSION);
    let default_language = Language::parse(
        narrative
            .default_language
            .as_deref()
            .unwrap_or(DEFAULT_LANGUAGE),
    )
    .map_err(|err| LoadError::invalid("narrative.default_language", err.to_string()))?;

    let highlight_count = narrative.highlight_count.unwrap_or(defaults.highlight_count);
    if highlight_count == 0 {
        return Err(LoadError::invalid(
            "narrative.highlight_count",
            "must be greater than zero",
        ));
    }

    Ok(NarrativeSettings {
        prompt_version,
        default_language,
        rules: NarrativeRules {
            min_headline_chars: narrative
                .min_headline_chars
                .unwrap_or(defaults.min_headline_chars),
            min_summary_chars: narrative
                .min_summary_chars
                .unwrap_or(defaults.min_summary_chars),
            highlight_count,
            min_section_chars: narrative
                .min_section_chars
                .unwrap_or(defaults.min_section_chars),
        },
    })
}

fn build_rate_limit_settings(
    rate_limit: RawRateLimitSettings,
) -> Result<RateLimitSettings, LoadError> {
    let burst_max = non_zero_u32(
        rate_limit.burst_max.unwrap_or(DEFAULT_BURST_MAX.into()),
        "rate_limit.burst_max",
    )?;
    let burst_window = positive_secs(
        rate_limit
            .burst_window_seconds
            .unwrap_or(DEFAULT_BURST_WINDOW_SECS),
        "rate_limit.burst_window_seconds",
    )?;
    let cooldown = positive_secs(
        rate_limit.cooldown_seconds.unwrap_or(DEFAULT_COOLDOWN_SECS),
        "rate_limit.cooldown_seconds",
    )?;
    let sustained_max = non_zero_u32(
        rate_limit.sustained_max.unwrap_or(DEFAULT_SUSTAINED_MAX.into()),
        "rate_limit.sustained_max",
    )?;
    let sustained_window = positive_secs(
        rate_limit
            .sustained_window_seconds
            .unwrap_or(DEFAULT_SUSTAINED_WINDOW_SECS),
        "rate_limit.sustained_window_seconds",
    )?;

    if sustained_window < burst_window {
        return Err(LoadError::invalid(
            "rate_limit.sustained_window_seconds",
            "must not be shorter than the burst window",
        ));
    }

    Ok(RateLimitSettings {
        burst_max,
        burst_window,
        cooldown,
        sustained_max,
        sustained_window,
    })
}

fn build_budget_settings(budget: RawBudgetSettings) -> Result<BudgetSettings, LoadError> {
    let daily_token_limit = budget
        .daily_token_limit
        .unwrap_or(DEFAULT_DAILY_TOKEN_LIMIT);
    if i64::try_from(daily_token_limit).is_err() {
        return Err(LoadError::invalid(
            "budget.daily_token_limit",
            "value exceeds supported range for i64",
        ));
    }
    Ok(BudgetSettings { daily_token_limit })
}

fn build_lock_settings(locks: RawLockSettings) -> Result<LockSettings, LoadError> {
    let ttl = positive_secs(
        locks.ttl_seconds.unwrap_or(DEFAULT_LOCK_TTL_SECS),
        "locks.ttl_seconds",
    )?;
    let retry_hint = positive_secs(
        locks
            .retry_hint_seconds
            .unwrap_or(DEFAULT_LOCK_RETRY_HINT_SECS),
        "locks.retry_hint_seconds",
    )?;
    Ok(LockSettings { ttl, retry_hint })
}

fn build_coordination_settings(
    coordination: RawCoordinationSettings,
    database: &DatabaseSettings,
) -> Result<CoordinationSettings, LoadError> {
    let backend = match non_blank(coordination.backend).as_deref() {
        None | Some("memory") => CoordinationBackend::Memory,
        Some("postgres") => CoordinationBackend::Postgres,
        Some(other) => {
            return Err(LoadError::invalid(
                "coordination.backend",
                format!("expected `memory` or `postgres`, got `{other}`"),
            ));
        }
    };
    if backend == CoordinationBackend::Postgres && database.url.is_none() {
        return Err(LoadError::invalid(
            "coordination.backend",
            "`postgres` requires database.url",
        ));
    }
    let sweep_interval = positive_secs(
        coordination
            .sweep_interval_seconds
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        "coordination.sweep_interval_seconds",
    )?;

    Ok(CoordinationSettings {
        backend,
        sweep_interval,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    endpoint: Option<String>,
    timeout_seconds: Option<u64>,
    house_system: Option<HouseSystem>,
    zodiac: Option<ZodiacMode>,
    schema_version: Option<u32>,
    algorithm_version: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGenerationSettings {
    endpoint: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    timeout_seconds: Option<u64>,
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawNarrativeSettings {
    prompt_version: Option<u32>,
    default_language: Option<String>,
    min_headline_chars: Option<usize>,
    min_summary_chars: Option<usize>,
    highlight_count: Option<usize>,
    min_section_chars: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRateLimitSettings {
    burst_max: Option<u64>,
    burst_window_seconds: Option<u64>,
    cooldown_seconds: Option<u64>,
    sustained_max: Option<u64>,
    sustained_window_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBudgetSettings {
    daily_token_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLockSettings {
    ttl_seconds: Option<u64>,
    retry_hint_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCoordinationSettings {
    backend: Option<String>,
    sweep_interval_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn endpoint(
    value: Option<String>,
    default: &str,
    key: &'static str,
) -> Result<String, LoadError> {
    let endpoint = non_blank(value).unwrap_or_else(|| default.to_string());
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(LoadError::invalid(key, "must be an http(s) URL"));
    }
    Ok(endpoint)
}

fn positive_secs(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
