use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the almanac binary.
#[derive(Debug, Parser)]
#[command(name = "almanac", version, about = "Library book cache service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ALMANAC_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP API.
    Serve(Box<ServeArgs>),
    /// Apply database migrations and exit.
    Migrate(MigrateArgs),
    /// Print the normalized input and book key for a raw JSON input.
    Key(KeyArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Clone)]
pub struct KeyArgs {
    /// Raw input as JSON, e.g. '{"library":"natal","date":"1990-01-01",...}'.
    #[arg(value_name = "JSON")]
    pub input: String,

    /// Schema version to derive the key for; defaults to the configured one.
    #[arg(long = "schema-version", value_name = "VERSION")]
    pub schema_version: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the geometry engine endpoint.
    #[arg(long = "engine-endpoint", value_name = "URL")]
    pub engine_endpoint: Option<String>,

    /// Override the generation service endpoint.
    #[arg(long = "generation-endpoint", value_name = "URL")]
    pub generation_endpoint: Option<String>,

    /// Override the generation model name.
    #[arg(long = "generation-model", value_name = "MODEL")]
    pub generation_model: Option<String>,

    /// Override the current narrative prompt version.
    #[arg(long = "narrative-prompt-version", value_name = "VERSION")]
    pub narrative_prompt_version: Option<u32>,

    /// Override the daily generation token budget.
    #[arg(long = "budget-daily-token-limit", value_name = "TOKENS")]
    pub budget_daily_token_limit: Option<u64>,

    /// Override the coordination backend (memory|postgres).
    #[arg(long = "coordination-backend", value_name = "BACKEND")]
    pub coordination_backend: Option<String>,
}
