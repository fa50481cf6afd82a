//! Process settings, read from the environment.
//!
//! Every setting has a default so a minimal run needs no environment at all.
//! Pipeline-specific configuration (sources, model, sink) travels inside the
//! [`crate::factory::PipelineConfig`] payload instead; this module only holds
//! process-wide tuning: endpoints, credentials, timeouts, batch bounds, and
//! queue behaviour.
//!
//! # Variables
//!
//! | Variable | Default | Purpose |
//! |----------|---------|---------|
//! | `RAGLINE_BIND` | `127.0.0.1:8000` | HTTP API bind address |
//! | `EMBEDDINGS_ENDPOINT` | `http://localhost:9100/embeddings` | gateway embeddings URL |
//! | `EMBEDDINGS_TIMEOUT_SECS` | `30` | per-request timeout |
//! | `EMBEDDINGS_BATCH_SIZE` | `10` | starting batch size |
//! | `EMBEDDINGS_BATCH_MODE` | `static` | `static` or `dynamic` |
//! | `GATEWAY_API_KEY` | empty | `x-api-key` header value |
//! | `RETRY_COUNT` | `3` | transport retries (connect errors only) |
//! | `DYNAMIC_BATCH_WINDOW` | `5` | latency window size |
//! | `LATENCY_THRESHOLD_MS` | `1000.0` | grow/shrink threshold |
//! | `MIN_BATCH_SIZE` / `MAX_BATCH_SIZE` | `1` / `500` | dynamic-mode bounds |
//! | `THINKTANK_ENDPOINT` | `http://localhost:9200/embeddings` | thinktank embeddings URL |
//! | `QUOTA_ENDPOINT` | empty | thinktank access validation (skipped if empty) |
//! | `OAUTH_URL` | empty | token endpoint (no bearer header if empty) |
//! | `OAUTH_CLIENT_CREDENTIALS` | empty | pre-encoded Basic credentials |
//! | `OAUTH_USERNAME` / `OAUTH_PASSWORD` | empty | password-grant credentials |
//! | `SINK_TIMEOUT_SECS` | `30` | index write/query timeout |
//! | `FLUSH_THRESHOLD` | `200` | chunks per embed-ingest job |
//! | `WORKFLOW_RETRY` | `3` | queue-level retries before dead-letter |
//! | `TELEMETRY_QUEUE_SIZE` | `1024` | bounded telemetry channel capacity |
//! | `METRICS_ENABLED` | `true` | emit token-usage metrics |
//! | `USAGE_HISTORY_ENABLED` | `true` | publish usage records |

use anyhow::Result;

/// Process-wide settings. Constructed once at startup and shared by
/// reference; connector factories copy out what they need.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: String,

    // Embedding gateway
    pub embeddings_endpoint: String,
    pub embeddings_timeout_secs: u64,
    pub embeddings_batch_size: usize,
    pub batch_mode: String,
    pub gateway_api_key: String,
    pub retry_count: u32,

    // Dynamic batching
    pub dynamic_batch_window: usize,
    pub latency_threshold_ms: f64,
    pub min_batch_size: usize,
    pub max_batch_size: usize,

    // Thinktank
    pub thinktank_endpoint: String,
    pub quota_endpoint: String,

    // OAuth
    pub oauth_url: String,
    pub oauth_client_credentials: String,
    pub oauth_username: String,
    pub oauth_password: String,

    // Sink
    pub sink_timeout_secs: u64,

    // Queue
    pub flush_threshold: usize,
    pub workflow_retry: u32,

    // Telemetry
    pub telemetry_queue_size: usize,
    pub metrics_enabled: bool,
    pub usage_history_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            embeddings_endpoint: "http://localhost:9100/embeddings".to_string(),
            embeddings_timeout_secs: 30,
            embeddings_batch_size: 10,
            batch_mode: "static".to_string(),
            gateway_api_key: String::new(),
            retry_count: 3,
            dynamic_batch_window: 5,
            latency_threshold_ms: 1000.0,
            min_batch_size: 1,
            max_batch_size: 500,
            thinktank_endpoint: "http://localhost:9200/embeddings".to_string(),
            quota_endpoint: String::new(),
            oauth_url: String::new(),
            oauth_client_credentials: String::new(),
            oauth_username: String::new(),
            oauth_password: String::new(),
            sink_timeout_secs: 30,
            flush_threshold: 200,
            workflow_retry: 3,
            telemetry_queue_size: 1024,
            metrics_enabled: true,
            usage_history_enabled: true,
        }
    }
}

impl Settings {
    /// Read settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let d = Settings::default();

        let settings = Settings {
            bind: env_or("RAGLINE_BIND", d.bind),
            embeddings_endpoint: env_or("EMBEDDINGS_ENDPOINT", d.embeddings_endpoint),
            embeddings_timeout_secs: env_parse(
                "EMBEDDINGS_TIMEOUT_SECS",
                d.embeddings_timeout_secs,
            )?,
            embeddings_batch_size: env_parse("EMBEDDINGS_BATCH_SIZE", d.embeddings_batch_size)?,
            batch_mode: env_or("EMBEDDINGS_BATCH_MODE", d.batch_mode),
            gateway_api_key: env_or("GATEWAY_API_KEY", d.gateway_api_key),
            retry_count: env_parse("RETRY_COUNT", d.retry_count)?,
            dynamic_batch_window: env_parse("DYNAMIC_BATCH_WINDOW", d.dynamic_batch_window)?,
            latency_threshold_ms: env_parse("LATENCY_THRESHOLD_MS", d.latency_threshold_ms)?,
            min_batch_size: env_parse("MIN_BATCH_SIZE", d.min_batch_size)?,
            max_batch_size: env_parse("MAX_BATCH_SIZE", d.max_batch_size)?,
            thinktank_endpoint: env_or("THINKTANK_ENDPOINT", d.thinktank_endpoint),
            quota_endpoint: env_or("QUOTA_ENDPOINT", d.quota_endpoint),
            oauth_url: env_or("OAUTH_URL", d.oauth_url),
            oauth_client_credentials: env_or(
                "OAUTH_CLIENT_CREDENTIALS",
                d.oauth_client_credentials,
            ),
            oauth_username: env_or("OAUTH_USERNAME", d.oauth_username),
            oauth_password: env_or("OAUTH_PASSWORD", d.oauth_password),
            sink_timeout_secs: env_parse("SINK_TIMEOUT_SECS", d.sink_timeout_secs)?,
            flush_threshold: env_parse("FLUSH_THRESHOLD", d.flush_threshold)?,
            workflow_retry: env_parse("WORKFLOW_RETRY", d.workflow_retry)?,
            telemetry_queue_size: env_parse("TELEMETRY_QUEUE_SIZE", d.telemetry_queue_size)?,
            metrics_enabled: env_bool("METRICS_ENABLED", d.metrics_enabled),
            usage_history_enabled: env_bool("USAGE_HISTORY_ENABLED", d.usage_history_enabled),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.embeddings_batch_size == 0 {
            anyhow::bail!("EMBEDDINGS_BATCH_SIZE must be > 0");
        }
        if self.min_batch_size == 0 || self.min_batch_size > self.max_batch_size {
            anyhow::bail!("MIN_BATCH_SIZE must be in [1, MAX_BATCH_SIZE]");
        }
        if self.dynamic_batch_window == 0 {
            anyhow::bail!("DYNAMIC_BATCH_WINDOW must be > 0");
        }
        if self.flush_threshold == 0 {
            anyhow::bail!("FLUSH_THRESHOLD must be > 0");
        }
        match self.batch_mode.as_str() {
            "static" | "dynamic" => {}
            other => anyhow::bail!(
                "Unknown EMBEDDINGS_BATCH_MODE: '{}'. Must be static or dynamic.",
                other
            ),
        }
        Ok(())
    }
}

fn env_or(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e)),
        _ => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.flush_threshold, 200);
        assert_eq!(settings.workflow_retry, 3);
        assert_eq!(settings.dynamic_batch_window, 5);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let settings = Settings {
            embeddings_batch_size: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unknown_batch_mode_rejected() {
        let settings = Settings {
            batch_mode: "adaptive".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_min_above_max_rejected() {
        let settings = Settings {
            min_batch_size: 600,
            max_batch_size: 500,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
