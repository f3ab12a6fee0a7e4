//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Webhook Security
//!
//! - `ML_WEBHOOK_SECRET`: Shared secret used both as HMAC key and as the legacy header value
//! - `ML_ALLOWED_IPS`: Sender egress IPs/CIDRs (defaults to the published Mercado Livre IPs)
//! - `WEBHOOK_ENFORCE_IP_ALLOWLIST`: Defaults to `true` when `APP_ENV=production`
//!
//! # Deadline
//!
//! - `WEBHOOK_TIMEOUT_MS`: Hard response ceiling enforced by the sender (default: 500)
//! - `WEBHOOK_DEADLINE_BUFFER_MS`: Safety margin subtracted from it (default: 25)
//!
//! # Recovery
//!
//! - `RECOVERY_BATCH_SIZE`, `RECOVERY_BATCH_DELAY_MS`, `RECOVERY_MAX_PAGES`
//! - `RECOVERY_SCHEDULE_INTERVAL_SECS` + `RECOVERY_SCHEDULED_TENANTS` enable the periodic sweep

use std::env;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Egress IPs Mercado Livre documents for webhook delivery.
pub const DEFAULT_SENDER_IPS: [&str; 4] = [
    "54.88.218.97",
    "18.215.140.160",
    "18.213.114.129",
    "18.206.34.84",
];

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Deployment environment name (default: "development")
    pub environment: String,

    /// Maximum request body size in bytes (default: 64KB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Store Configuration
    // =========================================================================
    /// Redis connection URL. When unset, an in-process store is used.
    pub redis_url: Option<String>,

    /// TTL for processed markers (default: 24h)
    pub processed_marker_ttl: Duration,

    /// TTL for refreshed marketplace entities written by topic handlers (default: 1h)
    pub entity_cache_ttl: Duration,

    /// Redis per-command response timeout (default: 250ms)
    pub store_response_timeout: Duration,

    /// Redis connection attempt timeout (default: 2s)
    pub store_connect_timeout: Duration,

    /// How often the in-process store drops expired entries (default: 60s, 0 disables)
    pub store_purge_interval: Duration,

    /// Entry cap for the in-process store (default: 100000)
    pub memory_store_max_entries: usize,

    // =========================================================================
    // Marketplace Configuration
    // =========================================================================
    /// Base URL of the marketplace API
    pub ml_api_base_url: String,

    /// Application id registered with the marketplace for this deployment
    pub ml_app_id: Option<String>,

    /// Timeout for individual marketplace API calls (default: 10 seconds)
    pub operation_timeout: Duration,

    /// Consecutive failures before the marketplace circuit opens (default: 5)
    pub circuit_breaker_failure_threshold: u32,

    /// Consecutive half-open successes needed to close the circuit (default: 2)
    pub circuit_breaker_success_threshold: u32,

    /// How long the circuit stays open before probing (default: 30s)
    pub circuit_breaker_open_duration: Duration,

    // =========================================================================
    // Webhook Configuration
    // =========================================================================
    /// Shared webhook secret (HMAC key and legacy header value)
    pub webhook_secret: Option<String>,

    /// Sender egress IPs or CIDR ranges
    pub allowed_sender_ips: Vec<String>,

    /// Reject requests whose client IP is not in `allowed_sender_ips`
    pub enforce_ip_allowlist: bool,

    /// Hard response ceiling enforced by the sender
    pub webhook_timeout: Duration,

    /// Margin subtracted from `webhook_timeout` to get the processing budget
    pub deadline_buffer: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// IPs that bypass every rate-limit policy
    pub rate_limit_whitelist: Vec<String>,

    /// Bound on each store call a rate-limit check makes (default: 100ms)
    pub rate_limit_store_timeout: Duration,

    /// Webhook requests per window per IP for unknown senders (default: 100)
    pub webhook_rate_limit_max: u32,

    /// Webhook requests per window per IP when the user-agent is the marketplace's (default: 1000)
    pub webhook_marketplace_rate_limit_max: u32,

    /// Window for the webhook policy (default: 60s)
    pub webhook_rate_limit_window: Duration,

    /// Generic per-IP requests per minute (default: 300)
    pub ip_rate_limit_max: u32,

    /// Per-user requests per minute (default: 120)
    pub user_rate_limit_max: u32,

    /// Per-(endpoint, IP) requests per minute (default: 60)
    pub endpoint_rate_limit_max: u32,

    /// Failed admin logins per window (default: 5)
    pub login_rate_limit_max: u32,

    /// Window for the brute-force policy (default: 15 minutes)
    pub login_rate_limit_window: Duration,

    /// Per-user ceiling over 24 hours (default: 1000)
    pub daily_user_rate_limit_max: u32,

    // =========================================================================
    // Recovery Configuration
    // =========================================================================
    /// Page size when listing missed feeds (default: 50)
    pub recovery_batch_size: u32,

    /// Pause between pages (default: 100ms)
    pub recovery_batch_delay: Duration,

    /// Upper bound on pages fetched in one run (default: 200)
    pub recovery_max_pages: u32,

    /// Age cutoff applied when a run does not specify one (default: 48)
    pub recovery_default_max_age_hours: u32,

    /// Period of the scheduled sweep (zero disables it)
    pub recovery_schedule_interval: Duration,

    /// Tenants swept by the scheduler
    pub recovery_scheduled_tenants: Vec<u64>,

    // =========================================================================
    // Admin & Security Configuration
    // =========================================================================
    /// API key for the admin routes (admin routes are not mounted when unset)
    pub admin_api_key: Option<String>,

    /// Capacity of the in-memory security event ring buffer (default: 1000)
    pub security_event_buffer: usize,

    /// Where fired alerts are POSTed. Alerts are only logged when unset.
    pub security_alert_webhook_url: Option<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Human-readable or JSON log lines
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse or the
    /// combination is inconsistent (e.g. buffer larger than the deadline).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let environment = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let production = environment.eq_ignore_ascii_case("production");

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            environment,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 64 * 1024)?,

            // Store
            redis_url: Self::optional_env("REDIS_URL"),
            processed_marker_ttl: Duration::from_secs(Self::parse_env(
                "PROCESSED_MARKER_TTL_SECS",
                86_400,
            )?),
            entity_cache_ttl: Duration::from_secs(Self::parse_env("ENTITY_CACHE_TTL_SECS", 3600)?),
            store_response_timeout: Duration::from_millis(Self::parse_env(
                "REDIS_RESPONSE_TIMEOUT_MS",
                250,
            )?),
            store_connect_timeout: Duration::from_millis(Self::parse_env(
                "REDIS_CONNECT_TIMEOUT_MS",
                2000,
            )?),
            store_purge_interval: Duration::from_secs(Self::parse_env(
                "STORE_PURGE_INTERVAL_SECS",
                60,
            )?),
            memory_store_max_entries: Self::parse_env("MEMORY_STORE_MAX_ENTRIES", 100_000)?,

            // Marketplace
            ml_api_base_url: env::var("ML_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.mercadolibre.com".to_string()),
            ml_app_id: Self::optional_env("ML_APP_ID"),
            operation_timeout: Duration::from_secs(Self::parse_env("OPERATION_TIMEOUT_SECS", 10)?),
            circuit_breaker_failure_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                5,
            )?,
            circuit_breaker_success_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_SUCCESS_THRESHOLD",
                2,
            )?,
            circuit_breaker_open_duration: Duration::from_secs(Self::parse_env(
                "CIRCUIT_BREAKER_OPEN_DURATION_SECS",
                30,
            )?),

            // Webhook
            webhook_secret: Self::optional_env("ML_WEBHOOK_SECRET"),
            allowed_sender_ips: Self::parse_list("ML_ALLOWED_IPS")
                .unwrap_or_else(|| DEFAULT_SENDER_IPS.iter().map(|s| (*s).to_string()).collect()),
            enforce_ip_allowlist: Self::parse_env("WEBHOOK_ENFORCE_IP_ALLOWLIST", production)?,
            webhook_timeout: Duration::from_millis(Self::parse_env("WEBHOOK_TIMEOUT_MS", 500)?),
            deadline_buffer: Duration::from_millis(Self::parse_env(
                "WEBHOOK_DEADLINE_BUFFER_MS",
                25,
            )?),

            // Rate limiting
            rate_limit_whitelist: Self::parse_list("RATE_LIMIT_WHITELIST").unwrap_or_default(),
            rate_limit_store_timeout: Duration::from_millis(Self::parse_env(
                "RATE_LIMIT_STORE_TIMEOUT_MS",
                100,
            )?),
            webhook_rate_limit_max: Self::parse_env("RATE_LIMIT_WEBHOOK_MAX", 100)?,
            webhook_marketplace_rate_limit_max: Self::parse_env(
                "RATE_LIMIT_WEBHOOK_MARKETPLACE_MAX",
                1000,
            )?,
            webhook_rate_limit_window: Duration::from_millis(Self::parse_env(
                "RATE_LIMIT_WEBHOOK_WINDOW_MS",
                60_000,
            )?),
            ip_rate_limit_max: Self::parse_env("RATE_LIMIT_IP_MAX", 300)?,
            user_rate_limit_max: Self::parse_env("RATE_LIMIT_USER_MAX", 120)?,
            endpoint_rate_limit_max: Self::parse_env("RATE_LIMIT_ENDPOINT_MAX", 60)?,
            login_rate_limit_max: Self::parse_env("RATE_LIMIT_LOGIN_MAX", 5)?,
            login_rate_limit_window: Duration::from_millis(Self::parse_env(
                "RATE_LIMIT_LOGIN_WINDOW_MS",
                900_000,
            )?),
            daily_user_rate_limit_max: Self::parse_env("RATE_LIMIT_DAILY_USER_MAX", 1000)?,

            // Recovery
            recovery_batch_size: Self::parse_env("RECOVERY_BATCH_SIZE", 50)?,
            recovery_batch_delay: Duration::from_millis(Self::parse_env(
                "RECOVERY_BATCH_DELAY_MS",
                100,
            )?),
            recovery_max_pages: Self::parse_env("RECOVERY_MAX_PAGES", 200)?,
            recovery_default_max_age_hours: Self::parse_env("RECOVERY_DEFAULT_MAX_AGE_HOURS", 48)?,
            recovery_schedule_interval: Duration::from_secs(Self::parse_env(
                "RECOVERY_SCHEDULE_INTERVAL_SECS",
                0,
            )?),
            recovery_scheduled_tenants: Self::parse_tenants()?,

            // Admin & security
            admin_api_key: Self::optional_env("ADMIN_API_KEY"),
            security_event_buffer: Self::parse_env("SECURITY_EVENT_BUFFER", 1000)?,
            security_alert_webhook_url: Self::optional_env("SECURITY_ALERT_WEBHOOK_URL"),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: match env::var("LOG_FORMAT") {
                Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    fn validate(&self) -> AppResult<()> {
        if self.deadline_buffer >= self.webhook_timeout {
            return Err(AppError::ConfigError(format!(
                "WEBHOOK_DEADLINE_BUFFER_MS ({:?}) must be smaller than WEBHOOK_TIMEOUT_MS ({:?})",
                self.deadline_buffer, self.webhook_timeout
            )));
        }

        if self.rate_limit_store_timeout.is_zero()
            || self.rate_limit_store_timeout >= self.processing_budget()
        {
            return Err(AppError::ConfigError(format!(
                "RATE_LIMIT_STORE_TIMEOUT_MS ({:?}) must be between 1ms and the processing budget ({:?})",
                self.rate_limit_store_timeout,
                self.processing_budget()
            )));
        }

        if self.memory_store_max_entries == 0 {
            return Err(AppError::ConfigError(
                "MEMORY_STORE_MAX_ENTRIES must be greater than 0".to_string(),
            ));
        }

        if self.recovery_batch_size == 0 || self.recovery_batch_size > 1000 {
            return Err(AppError::ConfigError(
                "RECOVERY_BATCH_SIZE must be between 1 and 1000".to_string(),
            ));
        }

        if self.recovery_max_pages == 0 {
            return Err(AppError::ConfigError(
                "RECOVERY_MAX_PAGES must be greater than 0".to_string(),
            ));
        }

        let limits = [
            ("RATE_LIMIT_WEBHOOK_MAX", self.webhook_rate_limit_max),
            (
                "RATE_LIMIT_WEBHOOK_MARKETPLACE_MAX",
                self.webhook_marketplace_rate_limit_max,
            ),
            ("RATE_LIMIT_IP_MAX", self.ip_rate_limit_max),
            ("RATE_LIMIT_USER_MAX", self.user_rate_limit_max),
            ("RATE_LIMIT_ENDPOINT_MAX", self.endpoint_rate_limit_max),
            ("RATE_LIMIT_LOGIN_MAX", self.login_rate_limit_max),
            ("RATE_LIMIT_DAILY_USER_MAX", self.daily_user_rate_limit_max),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, max)| *max == 0) {
            return Err(AppError::ConfigError(format!(
                "{name} must be greater than 0"
            )));
        }

        if self.webhook_rate_limit_window.is_zero() || self.login_rate_limit_window.is_zero() {
            return Err(AppError::ConfigError(
                "Rate limit windows must be greater than 0".to_string(),
            ));
        }

        if self.security_event_buffer == 0 {
            return Err(AppError::ConfigError(
                "SECURITY_EVENT_BUFFER must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.recovery_scheduling_enabled() && self.ml_app_id.is_none() {
            return Err(AppError::ConfigError(
                "ML_APP_ID is required when RECOVERY_SCHEDULE_INTERVAL_SECS is set".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether this deployment runs in production.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Processing budget left after subtracting the safety buffer.
    pub fn processing_budget(&self) -> Duration {
        self.webhook_timeout.saturating_sub(self.deadline_buffer)
    }

    /// Check if the admin surface is enabled.
    pub fn admin_enabled(&self) -> bool {
        self.admin_api_key.is_some()
    }

    /// Check if the periodic recovery sweep is enabled.
    pub fn recovery_scheduling_enabled(&self) -> bool {
        !self.recovery_schedule_interval.is_zero() && !self.recovery_scheduled_tenants.is_empty()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        self.metrics_enabled()
            .then(|| std::net::SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn optional_env(name: &str) -> Option<String> {
        env::var(name).ok().filter(|v| !v.trim().is_empty())
    }

    /// Parse a comma-separated list. `None` when the variable is unset or blank.
    fn parse_list(name: &str) -> Option<Vec<String>> {
        Self::optional_env(name).map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }

    fn parse_tenants() -> AppResult<Vec<u64>> {
        Self::parse_list("RECOVERY_SCHEDULED_TENANTS")
            .unwrap_or_default()
            .iter()
            .map(|t| {
                t.parse::<u64>().map_err(|e| {
                    AppError::ConfigError(format!("Invalid RECOVERY_SCHEDULED_TENANTS entry '{t}': {e}"))
                })
            })
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: "development".to_string(),
            max_request_body_size: 64 * 1024,
            // Store
            redis_url: None,
            processed_marker_ttl: Duration::from_secs(86_400),
            entity_cache_ttl: Duration::from_secs(3600),
            store_response_timeout: Duration::from_millis(250),
            store_connect_timeout: Duration::from_secs(2),
            store_purge_interval: Duration::from_secs(60),
            memory_store_max_entries: 100_000,
            // Marketplace
            ml_api_base_url: "https://api.mercadolibre.com".to_string(),
            ml_app_id: None,
            operation_timeout: Duration::from_secs(10),
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_success_threshold: 2,
            circuit_breaker_open_duration: Duration::from_secs(30),
            // Webhook
            webhook_secret: None,
            allowed_sender_ips: DEFAULT_SENDER_IPS.iter().map(|s| (*s).to_string()).collect(),
            enforce_ip_allowlist: false,
            webhook_timeout: Duration::from_millis(500),
            deadline_buffer: Duration::from_millis(25),
            // Rate limiting
            rate_limit_whitelist: vec![],
            rate_limit_store_timeout: Duration::from_millis(100),
            webhook_rate_limit_max: 100,
            webhook_marketplace_rate_limit_max: 1000,
            webhook_rate_limit_window: Duration::from_secs(60),
            ip_rate_limit_max: 300,
            user_rate_limit_max: 120,
            endpoint_rate_limit_max: 60,
            login_rate_limit_max: 5,
            login_rate_limit_window: Duration::from_secs(900),
            daily_user_rate_limit_max: 1000,
            // Recovery
            recovery_batch_size: 50,
            recovery_batch_delay: Duration::from_millis(100),
            recovery_max_pages: 200,
            recovery_default_max_age_hours: 48,
            recovery_schedule_interval: Duration::ZERO,
            recovery_scheduled_tenants: vec![],
            // Admin & security
            admin_api_key: None,
            security_event_buffer: 1000,
            security_alert_webhook_url: None,
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.port, 3000);
        assert_eq!(config.webhook_timeout, Duration::from_millis(500));
        assert_eq!(config.deadline_buffer, Duration::from_millis(25));
        assert_eq!(config.recovery_batch_size, 50);
        assert_eq!(config.allowed_sender_ips.len(), 4);
        assert!(!config.enforce_ip_allowlist);
        assert!(config.webhook_secret.is_none());
    }

    #[test]
    fn test_processing_budget_subtracts_buffer() {
        let config = Config::default();
        assert_eq!(config.processing_budget(), Duration::from_millis(475));
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "localhost".to_string(),
            port: 8080,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "localhost:8080");
    }

    #[test]
    fn test_validate_buffer_must_be_below_timeout() {
        let config = Config {
            deadline_buffer: Duration::from_millis(500),
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("WEBHOOK_DEADLINE_BUFFER_MS")
        );
    }

    #[test]
    fn test_validate_batch_size_bounds() {
        let config = Config {
            recovery_batch_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            recovery_batch_size: 1001,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_rate_limit() {
        let config = Config {
            login_rate_limit_max: 0,
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("RATE_LIMIT_LOGIN_MAX"));
    }

    #[test]
    fn test_validate_rate_limit_store_timeout_fits_budget() {
        let config = Config {
            rate_limit_store_timeout: Duration::from_millis(475),
            ..Config::default()
        };
        let result = config.validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("RATE_LIMIT_STORE_TIMEOUT_MS")
        );

        let config = Config {
            rate_limit_store_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_scheduling_requires_app_id() {
        let config = Config {
            recovery_schedule_interval: Duration::from_secs(300),
            recovery_scheduled_tenants: vec![123],
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            ml_app_id: Some("app123".to_string()),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheduling_enabled_needs_interval_and_tenants() {
        let config = Config {
            recovery_schedule_interval: Duration::from_secs(300),
            ..Config::default()
        };
        assert!(!config.recovery_scheduling_enabled());
    }

    #[test]
    fn test_metrics_addr_disabled() {
        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }
}
