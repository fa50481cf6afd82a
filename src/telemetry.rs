//! Token-usage telemetry.
//!
//! Embedding connectors must not block their response path on metrics, so
//! each completed batch pushes a [`TokenUsageEvent`] onto a bounded channel
//! and moves on. A single worker task drains the channel, computes token
//! counts, emits the `embeddings_token_usage` metric, and hands a usage
//! record to the configured [`UsagePublisher`].
//!
//! Everything here is best-effort by contract:
//! - a full channel drops the event and bumps a counter;
//! - publisher failures are logged, counted, and swallowed.
//!
//! Token counts prefer the gateway-reported `prompt_tokens`; when the
//! gateway reports none, a chars-per-token estimate stands in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;

/// Approximate chars-per-token ratio used when the gateway reports no usage.
const CHARS_PER_TOKEN: usize = 4;

/// Per-token cost by model, for usage records.
fn model_token_cost(model: &str) -> f64 {
    match model {
        "text-embedding-3-small" => 0.000_000_02,
        "jina-v2-base" => 0.000_000_1,
        "text-embedding-ada-002" => 0.000_000_1,
        "text-embedding-3-large" => 0.000_000_13,
        _ => 0.0,
    }
}

/// One completed embedding batch, as seen by telemetry.
#[derive(Debug, Clone)]
pub struct TokenUsageEvent {
    pub model: String,
    pub user_id: String,
    /// Number of texts in the batch.
    pub input_item_count: usize,
    /// Total characters across the batch, for local token estimation.
    pub content_chars: usize,
    /// Prompt tokens reported by the gateway; 0 when absent.
    pub prompt_tokens: u64,
    pub response_time_ms: f64,
}

impl TokenUsageEvent {
    fn total_tokens(&self) -> u64 {
        if self.prompt_tokens > 0 {
            self.prompt_tokens
        } else {
            (self.content_chars / CHARS_PER_TOKEN) as u64
        }
    }
}

/// A usage-history record handed to the publisher.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub model_name: String,
    pub completion_tokens: u64,
    pub requests: u32,
    pub cost: f64,
    pub transaction_id: String,
    pub source_platform_application: &'static str,
}

/// Destination for usage-history records. The transport behind it (an event
/// bus in production) is external; failures must be tolerated.
pub trait UsagePublisher: Send + Sync {
    fn publish(&self, record: &UsageRecord) -> Result<(), String>;
}

/// Default publisher: logs the record. Stands in where no broker is wired.
pub struct LogPublisher;

impl UsagePublisher for LogPublisher {
    fn publish(&self, record: &UsageRecord) -> Result<(), String> {
        info!(
            user_id = %record.user_id,
            model = %record.model_name,
            tokens = record.completion_tokens,
            cost = record.cost,
            transaction_id = %record.transaction_id,
            "usage history record"
        );
        Ok(())
    }
}

/// Telemetry front end: non-blocking producer side of the channel.
pub struct Telemetry {
    tx: mpsc::Sender<TokenUsageEvent>,
    dropped: AtomicU64,
    publish_failures: Arc<AtomicU64>,
}

impl Telemetry {
    /// Build the channel pair without spawning the worker. Used by tests and
    /// by [`start`].
    fn new(capacity: usize) -> (Self, mpsc::Receiver<TokenUsageEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
                publish_failures: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queue an event. Never blocks; a full channel drops the event.
    pub fn record(&self, event: TokenUsageEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "telemetry queue full, dropping token usage event");
        }
    }

    /// Events dropped because the channel was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Usage publications that failed and were swallowed.
    pub fn publish_failure_count(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }
}

/// Consume one event: metric plus usage record.
fn process_event(
    event: &TokenUsageEvent,
    publisher: &dyn UsagePublisher,
    publish_failures: &AtomicU64,
    metrics_enabled: bool,
    usage_history_enabled: bool,
) {
    let total_tokens = event.total_tokens();

    if usage_history_enabled {
        let record = UsageRecord {
            user_id: event.user_id.clone(),
            model_name: event.model.clone(),
            completion_tokens: total_tokens,
            requests: 1,
            cost: model_token_cost(&event.model) * total_tokens as f64,
            transaction_id: Uuid::new_v4().to_string(),
            source_platform_application: "ragline",
        };
        if let Err(reason) = publisher.publish(&record) {
            publish_failures.fetch_add(1, Ordering::Relaxed);
            warn!(%reason, user_id = %event.user_id, "usage history publication failed");
        }
    }

    if metrics_enabled {
        info!(
            target: "ragline::metrics",
            metric = "embeddings_token_usage",
            model = %event.model,
            user_id = %event.user_id,
            total_token_count = total_tokens,
            input_item_count = event.input_item_count,
            response_time_ms = event.response_time_ms,
        );
    }
}

/// Start the telemetry worker and return the shared front end.
pub fn start(settings: &Settings, publisher: Arc<dyn UsagePublisher>) -> Arc<Telemetry> {
    let (telemetry, mut rx) = Telemetry::new(settings.telemetry_queue_size);
    let telemetry = Arc::new(telemetry);

    let metrics_enabled = settings.metrics_enabled;
    let usage_history_enabled = settings.usage_history_enabled;
    let publish_failures = telemetry.publish_failures.clone();

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            process_event(
                &event,
                publisher.as_ref(),
                &publish_failures,
                metrics_enabled,
                usage_history_enabled,
            );
        }
    });

    telemetry
}

static TELEMETRY: OnceLock<Arc<Telemetry>> = OnceLock::new();

/// Install the process-global telemetry handle. Later calls are no-ops.
pub fn init(settings: &Settings) {
    let _ = TELEMETRY.set(start(settings, Arc::new(LogPublisher)));
}

/// Record an event on the global handle, if telemetry was initialized.
pub fn record(event: TokenUsageEvent) {
    if let Some(telemetry) = TELEMETRY.get() {
        telemetry.record(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(chars: usize, prompt_tokens: u64) -> TokenUsageEvent {
        TokenUsageEvent {
            model: "jina-v2-base".to_string(),
            user_id: "u1".to_string(),
            input_item_count: 2,
            content_chars: chars,
            prompt_tokens,
            response_time_ms: 12.5,
        }
    }

    #[test]
    fn test_prompt_tokens_preferred_over_estimate() {
        assert_eq!(event(400, 37).total_tokens(), 37);
        assert_eq!(event(400, 0).total_tokens(), 100);
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let (telemetry, _rx) = Telemetry::new(1);
        telemetry.record(event(4, 0));
        telemetry.record(event(4, 0));
        telemetry.record(event(4, 0));
        assert_eq!(telemetry.dropped_count(), 2);
    }

    #[test]
    fn test_publisher_failure_is_swallowed_and_counted() {
        struct FailingPublisher;
        impl UsagePublisher for FailingPublisher {
            fn publish(&self, _record: &UsageRecord) -> Result<(), String> {
                Err("buffer full".to_string())
            }
        }

        let failures = AtomicU64::new(0);
        process_event(&event(4, 0), &FailingPublisher, &failures, true, true);
        assert_eq!(failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unknown_model_cost_is_zero() {
        assert_eq!(model_token_cost("mystery-model"), 0.0);
        assert!(model_token_cost("jina-v2-base") > 0.0);
    }
}
