//! Configuration management

use anyhow::{Context, Result};

use crate::types::OptimizerOptions;

/// Which travel-time provider backs the matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Haversine,
    Remote,
}

/// Application configuration, loaded from the environment
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,

    /// HTTP listen address
    pub bind_addr: String,

    /// Optional NATS server URL; enables the external progress transport
    pub nats_url: Option<String>,

    /// Async fabric switch; false runs submissions inline
    pub queue_enabled: bool,

    /// Gate for the /ws/* endpoints
    pub websocket_enabled: bool,

    pub worker_concurrency: usize,
    pub job_time_limit_seconds: u64,

    pub travel_time_provider: ProviderKind,
    pub remote_routing_url: Option<String>,
    pub remote_routing_table_url: Option<String>,

    pub progress_min_interval_ms: u64,
    pub progress_min_delta_pct: u8,

    /// Server-side defaults for per-job optimizer options
    pub max_time_shift_minutes: i32,
    pub transition_buffer_minutes: i32,
    pub lns_iteration_budget: u32,
    pub lns_time_budget_seconds: u64,
    pub lns_patience: u32,
    pub ilp_time_limit_seconds: u64,
    pub ilp_max_pairs: usize,

    /// Haversine estimator parameters (provider and fallback)
    pub haversine_speed_kmh: f64,
    pub fallback_detour_factor: f64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set")?;

        let travel_time_provider = match std::env::var("TRAVEL_TIME_PROVIDER").as_deref() {
            Ok("remote") => ProviderKind::Remote,
            _ => ProviderKind::Haversine,
        };

        let remote_routing_url = std::env::var("REMOTE_ROUTING_URL").ok();
        let remote_routing_table_url = std::env::var("REMOTE_ROUTING_TABLE_URL").ok();
        if travel_time_provider == ProviderKind::Remote {
            if remote_routing_url.is_none() || remote_routing_table_url.is_none() {
                anyhow::bail!(
                    "REMOTE_ROUTING_URL and REMOTE_ROUTING_TABLE_URL are required when TRAVEL_TIME_PROVIDER=remote"
                );
            }
        }

        Ok(Self {
            database_url,
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            nats_url: std::env::var("NATS_URL").ok(),
            queue_enabled: env_bool("QUEUE_ENABLED", true),
            websocket_enabled: env_bool("WEBSOCKET_ENABLED", true),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 4),
            job_time_limit_seconds: env_parse("JOB_TIME_LIMIT_SECONDS", 3_600),
            travel_time_provider,
            remote_routing_url,
            remote_routing_table_url,
            progress_min_interval_ms: env_parse("PROGRESS_MIN_INTERVAL_MS", 1_000),
            progress_min_delta_pct: env_parse("PROGRESS_MIN_DELTA_PCT", 5),
            max_time_shift_minutes: env_parse("MAX_TIME_SHIFT_MINUTES", 15),
            transition_buffer_minutes: env_parse("TRANSITION_BUFFER_MINUTES", 0),
            lns_iteration_budget: env_parse("LNS_ITERATION_BUDGET", 2_000),
            lns_time_budget_seconds: env_parse("LNS_TIME_BUDGET_SECONDS", 30),
            lns_patience: env_parse("LNS_PATIENCE", 200),
            ilp_time_limit_seconds: env_parse("ILP_TIME_LIMIT_SECONDS", 10),
            ilp_max_pairs: env_parse("ILP_MAX_PAIRS", 5_000),
            haversine_speed_kmh: env_parse("HAVERSINE_SPEED_KMH", 40.0),
            fallback_detour_factor: env_parse("FALLBACK_DETOUR_FACTOR", 1.3),
        })
    }

    /// Overlay server defaults onto a submitted job's options. A client
    /// value wins when it differs from the compiled-in default; fields the
    /// client left untouched take the configured default.
    pub fn effective_options(&self, submitted: OptimizerOptions) -> OptimizerOptions {
        let compiled = OptimizerOptions::default();
        let mut options = submitted;

        if options.max_time_shift_minutes == compiled.max_time_shift_minutes {
            options.max_time_shift_minutes = self.max_time_shift_minutes;
        }
        if options.transition_buffer_minutes == compiled.transition_buffer_minutes {
            options.transition_buffer_minutes = self.transition_buffer_minutes;
        }
        if options.lns_iteration_budget == compiled.lns_iteration_budget {
            options.lns_iteration_budget = self.lns_iteration_budget;
        }
        if options.lns_time_budget_seconds == compiled.lns_time_budget_seconds {
            options.lns_time_budget_seconds = self.lns_time_budget_seconds;
        }
        if options.lns_patience == compiled.lns_patience {
            options.lns_patience = self.lns_patience;
        }
        if options.ilp_time_limit_seconds == compiled.ilp_time_limit_seconds {
            options.ilp_time_limit_seconds = self.ilp_time_limit_seconds;
        }
        if options.ilp_max_pairs == compiled.ilp_max_pairs {
            options.ilp_max_pairs = self.ilp_max_pairs;
        }

        options
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            database_url: "postgres://test".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            nats_url: None,
            queue_enabled: true,
            websocket_enabled: true,
            worker_concurrency: 4,
            job_time_limit_seconds: 3_600,
            travel_time_provider: ProviderKind::Haversine,
            remote_routing_url: None,
            remote_routing_table_url: None,
            progress_min_interval_ms: 1_000,
            progress_min_delta_pct: 5,
            max_time_shift_minutes: 15,
            transition_buffer_minutes: 0,
            lns_iteration_budget: 2_000,
            lns_time_budget_seconds: 30,
            lns_patience: 200,
            ilp_time_limit_seconds: 10,
            ilp_max_pairs: 5_000,
            haversine_speed_kmh: 40.0,
            fallback_detour_factor: 1.3,
        }
    }

    #[test]
    fn test_env_bool_parses_common_truthy_values() {
        std::env::set_var("TEST_FLAG_A", "true");
        assert!(env_bool("TEST_FLAG_A", false));
        std::env::set_var("TEST_FLAG_A", "0");
        assert!(!env_bool("TEST_FLAG_A", true));
        std::env::remove_var("TEST_FLAG_A");
        assert!(env_bool("TEST_FLAG_A", true));
    }

    #[test]
    fn test_effective_options_applies_server_defaults() {
        let mut config = base_config();
        config.max_time_shift_minutes = 20;
        config.lns_patience = 500;

        let options = config.effective_options(OptimizerOptions::default());
        assert_eq!(options.max_time_shift_minutes, 20);
        assert_eq!(options.lns_patience, 500);
    }

    #[test]
    fn test_effective_options_keeps_client_overrides() {
        let mut config = base_config();
        config.max_time_shift_minutes = 20;

        let submitted = OptimizerOptions {
            max_time_shift_minutes: 5,
            ..Default::default()
        };
        let options = config.effective_options(submitted);
        assert_eq!(options.max_time_shift_minutes, 5);
    }
}
