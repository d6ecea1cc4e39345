//! Daemon settings, sourced from flags or environment variables.

use clap::Parser;

/// aitaskd - orchestrator daemon for AI coding-agent sessions.
#[derive(Debug, Clone, Parser)]
#[command(name = "aitaskd", version, about)]
pub struct Settings {
    /// SQLite database URL.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./aitask.db?mode=rwc")]
    pub database_url: String,

    /// Bind address for the HTTP API.
    #[arg(long, env = "API_HOST", default_value = "127.0.0.1")]
    pub api_host: String,

    /// Bind port for the HTTP API.
    #[arg(long, env = "API_PORT", default_value_t = 8000)]
    pub api_port: u16,

    /// Comma-separated list of allowed CORS origins.
    #[arg(
        long,
        env = "CORS_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000,http://127.0.0.1:3000"
    )]
    pub cors_origins: Vec<String>,

    /// Seconds between scheduler ticks.
    #[arg(long, env = "SCHEDULER_INTERVAL", default_value_t = 5)]
    pub scheduler_interval: u64,

    /// Seconds between runner heartbeat refreshes.
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value_t = 30)]
    pub heartbeat_interval: u64,

    /// Environment label for the local runner row.
    #[arg(long, env = "RUNNER_ENV", default_value = "local")]
    pub runner_env: String,

    /// Default max parallel runs for the local runner.
    #[arg(long, env = "MAX_PARALLEL", default_value_t = 1)]
    pub max_parallel: u32,

    /// Log filter (fallback when RUST_LOG is unset).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Maximum accepted prompt length in characters.
    #[arg(long, env = "PROMPT_MAX_CHARS", default_value_t = 20_000)]
    pub prompt_max_chars: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self::parse_from::<_, &str>([])
    }
}
