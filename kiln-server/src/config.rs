//! Server configuration, loaded from environment variables at startup.

/// Runtime configuration for kiln-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set; vendor adapters are only
/// registered when their credentials are present.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// SQLite database URL (default: `"sqlite://kiln.db?mode=rwc"`).
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Worker count for the orchestrator pool.
    pub workers: usize,

    /// Orchestrator submission-queue capacity.
    pub queue_capacity: usize,

    /// Seconds between polls of a deferred vendor task.
    pub poll_interval_secs: u64,

    /// Poll attempts before a deferred task times out.
    pub poll_max_attempts: u32,

    /// Seconds a non-terminal task may go without progress before the
    /// reaper fails it.
    pub reaper_stale_after_secs: u64,

    /// Seconds between reaper sweeps.
    pub reaper_interval_secs: u64,

    /// Run the background reaper in this process. Disable on all but one
    /// replica so only the leader sweeps.
    pub reaper_enabled: bool,

    /// Directory artifacts are stored under.
    pub blob_dir: String,

    /// Public base URL artifacts are served from, e.g.
    /// `"http://localhost:3000/blobs"`. Used both to build result URLs and
    /// to recognize already-durable URLs.
    pub blob_public_url: String,

    /// Base URL of the entitlement service; when unset a permissive static
    /// policy is used.
    pub entitlements_url: Option<String>,

    /// Base URL of the credit ledger; when unset every charge is free.
    pub ledger_url: Option<String>,

    /// Concurrency limit used by the static entitlement fallback.
    pub default_max_concurrency: u32,

    /// MiniMax API key; the adapter registers only when set.
    pub minimax_api_key: Option<String>,

    /// Doubao (Ark) API key; the adapter registers only when set.
    pub doubao_api_key: Option<String>,

    /// Gemini relay base URL; the adapter registers only when set.
    pub gemini_url: Option<String>,

    /// Bearer secret for the Gemini relay.
    pub gemini_secret: Option<String>,

    /// Comma-separated CORS origin allow-list; wildcard when unset.
    pub cors_allowed_origins: Option<String>,

    /// Serve Swagger UI at `/swagger-ui` (default: true).
    pub enable_swagger: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("KILN_BIND", "0.0.0.0:3000"),
            database_url: env_or("KILN_DATABASE_URL", "sqlite://kiln.db?mode=rwc"),
            log_level: env_or("KILN_LOG", "info"),
            log_json: env_flag("KILN_LOG_JSON", false),
            workers: parse_env("KILN_WORKERS", 4),
            queue_capacity: parse_env("KILN_QUEUE_CAPACITY", 64),
            poll_interval_secs: parse_env("KILN_POLL_INTERVAL_SECS", 10),
            poll_max_attempts: parse_env("KILN_POLL_MAX_ATTEMPTS", 120),
            reaper_stale_after_secs: parse_env("KILN_REAPER_STALE_AFTER_SECS", 30 * 60),
            reaper_interval_secs: parse_env("KILN_REAPER_INTERVAL_SECS", 5 * 60),
            reaper_enabled: env_flag("KILN_REAPER_ENABLED", true),
            blob_dir: env_or("KILN_BLOB_DIR", "./blobs"),
            blob_public_url: env_or("KILN_BLOB_PUBLIC_URL", "http://localhost:3000/blobs"),
            entitlements_url: env_opt("KILN_ENTITLEMENTS_URL"),
            ledger_url: env_opt("KILN_LEDGER_URL"),
            default_max_concurrency: parse_env("KILN_DEFAULT_MAX_CONCURRENCY", 3),
            minimax_api_key: env_opt("KILN_MINIMAX_API_KEY"),
            doubao_api_key: env_opt("KILN_DOUBAO_API_KEY"),
            gemini_url: env_opt("KILN_GEMINI_URL"),
            gemini_secret: env_opt("KILN_GEMINI_SECRET"),
            cors_allowed_origins: env_opt("KILN_CORS_ORIGINS"),
            enable_swagger: env_flag("KILN_ENABLE_SWAGGER", true),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
