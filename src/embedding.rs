//! Embedding connectors and the adaptive batcher.
//!
//! Chunk texts are turned into vectors by a remote embedding gateway. The
//! batcher on top of the wire protocol supports two modes:
//!
//! - **Static** — split the input into fixed-size batches and issue them all
//!   in parallel; results are concatenated in input order. A single input
//!   (or a single batch) is sent directly, with no fan-out.
//! - **Dynamic** — process batches sequentially, keeping a sliding window of
//!   the last `W` batch latencies. After each batch the size grows by one
//!   while the average stays under the latency threshold and shrinks by one
//!   when it is above, clamped to `[min_batch_size, max_batch_size]`.
//!
//! # Wire protocol
//!
//! `POST {endpoint}` with `{"input_text": [...], "dimensions"?: n}` and
//! headers `Authorization: Bearer <oauth>` (omitted when no OAuth is
//! configured) and `x-api-key: <gateway key>`. Responses:
//!
//! | Status | Result |
//! |--------|--------|
//! | 200 | parse `embeddings` + optional `usage` |
//! | 429 | [`EmbedError::RateLimited`] — never retried here |
//! | other | [`EmbedError::Response`] |
//! | transport | retried on connection errors up to `retry_count`, then [`EmbedError::Request`] |
//!
//! A response whose embedding count differs from the batch length is a
//! semantic failure ([`EmbedError::SizeMismatch`]).
//!
//! Each completed batch pushes a token-usage event to [`crate::telemetry`];
//! that path never blocks embedding.
//!
//! # Dimension policy
//!
//! A static table declares the native dimension per model, whether the model
//! accepts an override, and the allowed override values. Requests outside
//! the table or the allowlist fail at construction, before any network call.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::config::Settings;
use crate::errors::EmbedError;
use crate::models::RagDocument;
use crate::oauth::OauthService;
use crate::telemetry::{self, TokenUsageEvent};

/// Hard per-batch cap of the thinktank service.
const THINKTANK_MAX_BATCH: usize = 16;

/// Token usage reported across one embed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedUsage {
    pub prompt_tokens: u64,
    pub total_tokens: u64,
}

/// Transforms chunk texts to vectors via a remote service.
#[async_trait]
pub trait EmbedConnector: std::fmt::Debug + Send + Sync {
    /// Model identifier (e.g. `"jina-v2-base"`).
    fn model_name(&self) -> &str;

    /// Vector dimension every embed call will produce.
    fn dimensions(&self) -> usize;

    /// Embed documents, returning vectors positionally aligned with the
    /// input, plus usage stats.
    async fn embed(
        &self,
        documents: &[RagDocument],
    ) -> Result<(Vec<Vec<f32>>, EmbedUsage), EmbedError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Dimension policy
// ═══════════════════════════════════════════════════════════════════════

/// Per-model dimension constraints.
#[derive(Debug, Clone, Copy)]
pub struct ModelDims {
    pub default: usize,
    pub supports_override: bool,
    pub allowed: &'static [usize],
}

fn model_dims(model: &str) -> Option<ModelDims> {
    match model {
        "text-embedding-3-small" => Some(ModelDims {
            default: 1024,
            supports_override: true,
            allowed: &[256, 512, 1024, 1536],
        }),
        "jina-v2-base" => Some(ModelDims {
            default: 768,
            supports_override: false,
            allowed: &[768],
        }),
        "text-embedding-ada-002" => Some(ModelDims {
            default: 1536,
            supports_override: false,
            allowed: &[1536],
        }),
        "text-embedding-3-large" => Some(ModelDims {
            default: 1024,
            supports_override: true,
            allowed: &[256, 1024, 3072],
        }),
        "thinktank-v1-base" => Some(ModelDims {
            default: 768,
            supports_override: false,
            allowed: &[768],
        }),
        _ => None,
    }
}

/// Model names accepted by [`embedding_dims`], for factory error messages.
pub fn supported_models() -> Vec<&'static str> {
    vec![
        "text-embedding-3-small",
        "jina-v2-base",
        "text-embedding-ada-002",
        "text-embedding-3-large",
        "thinktank-v1-base",
    ]
}

/// Resolve the vector dimension for `model`, honoring an optional override.
///
/// An override equal to the default passes even on non-override models.
pub fn embedding_dims(model: &str, requested: Option<usize>) -> Result<usize, EmbedError> {
    let dims = model_dims(model).ok_or_else(|| EmbedError::InvalidModel(model.to_string()))?;

    let Some(requested) = requested else {
        return Ok(dims.default);
    };

    if !dims.supports_override && requested != dims.default {
        return Err(EmbedError::InvalidModelDimensions {
            model: model.to_string(),
            dimensions: requested,
            expected: dims.default,
        });
    }
    if !dims.allowed.contains(&requested) {
        return Err(EmbedError::UnsupportedDimensions {
            model: model.to_string(),
            dimensions: requested,
            allowed: dims.allowed.to_vec(),
        });
    }
    Ok(requested)
}

// ═══════════════════════════════════════════════════════════════════════
// Batching
// ═══════════════════════════════════════════════════════════════════════

/// Split `texts` into batches of at most `batch_size`, preserving order.
pub fn content_batches(texts: &[String], batch_size: usize) -> Result<Vec<Vec<String>>, EmbedError> {
    if batch_size == 0 {
        return Err(EmbedError::ZeroBatchSize);
    }
    Ok(texts
        .chunks(batch_size)
        .map(|chunk| chunk.to_vec())
        .collect())
}

/// Latency-driven batch size tuner for dynamic mode.
#[derive(Debug)]
pub struct BatchTuner {
    size: usize,
    min: usize,
    max: usize,
    threshold_ms: f64,
    window: VecDeque<f64>,
    window_len: usize,
}

impl BatchTuner {
    pub fn new(start: usize, min: usize, max: usize, threshold_ms: f64, window_len: usize) -> Self {
        Self {
            size: start.clamp(min, max),
            min,
            max,
            threshold_ms,
            window: VecDeque::with_capacity(window_len),
            window_len,
        }
    }

    /// Current batch size, always within `[min, max]`.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Record one batch latency and adjust the size by at most one step.
    pub fn observe(&mut self, latency_ms: f64) {
        self.window.push_back(latency_ms);
        while self.window.len() > self.window_len {
            self.window.pop_front();
        }

        let avg = self.window.iter().sum::<f64>() / self.window.len() as f64;
        if avg < self.threshold_ms && self.size < self.max {
            self.size = (self.size + 1).min(self.max);
        } else if avg > self.threshold_ms && self.size > self.min {
            self.size = (self.size - 1).max(self.min);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Wire protocol
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsPayload {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

/// Shared HTTP client for embedding endpoints: signing headers, timeout,
/// connect-error retries, status mapping, and response validation.
#[derive(Debug)]
struct RemoteEmbedClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    retry_count: u32,
    user_id: String,
}

impl RemoteEmbedClient {
    fn new(endpoint: String, settings: &Settings) -> Result<Self, EmbedError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.embeddings_timeout_secs))
            .build()
            .map_err(|e| EmbedError::Request(e.to_string()))?;
        Ok(Self {
            http,
            endpoint,
            api_key: settings.gateway_api_key.clone(),
            retry_count: settings.retry_count,
            user_id: "system".to_string(),
        })
    }

    /// Issue one batch request and validate the response.
    async fn send_batch(
        &self,
        model: &str,
        texts: &[String],
        bearer: &str,
        dimensions: Option<usize>,
    ) -> Result<(Vec<Vec<f32>>, EmbedUsage), EmbedError> {
        if texts.is_empty() {
            return Ok((Vec::new(), EmbedUsage::default()));
        }

        let mut payload = serde_json::json!({ "input_text": texts });
        if let Some(dims) = dimensions {
            payload["dimensions"] = serde_json::json!(dims);
        }

        let started = Instant::now();
        let response = self.post_with_retries(&payload, bearer).await?;
        let status = response.status();

        if status.as_u16() == 429 {
            return Err(EmbedError::RateLimited);
        }
        if !status.is_success() {
            return Err(EmbedError::Response(status.as_u16()));
        }

        let parsed: EmbeddingsPayload = response
            .json()
            .await
            .map_err(|e| EmbedError::Malformed(e.to_string()))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(EmbedError::SizeMismatch {
                input: texts.len(),
                returned: parsed.embeddings.len(),
            });
        }

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let usage = parsed
            .usage
            .map(|u| EmbedUsage {
                prompt_tokens: u.prompt_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        // Fire-and-forget: the telemetry channel never blocks this path.
        telemetry::record(TokenUsageEvent {
            model: model.to_string(),
            user_id: self.user_id.clone(),
            input_item_count: texts.len(),
            content_chars: texts.iter().map(|t| t.chars().count()).sum(),
            prompt_tokens: usage.prompt_tokens,
            response_time_ms: latency_ms,
        });

        debug!(model, batch = texts.len(), latency_ms, "embedding batch complete");
        Ok((parsed.embeddings, usage))
    }

    /// POST the payload, re-attempting on connection errors only.
    async fn post_with_retries(
        &self,
        payload: &serde_json::Value,
        bearer: &str,
    ) -> Result<reqwest::Response, EmbedError> {
        let mut attempt = 0;
        loop {
            let mut request = self
                .http
                .post(&self.endpoint)
                .header("x-api-key", &self.api_key)
                .json(payload);
            if !bearer.is_empty() {
                request = request.header("Authorization", format!("Bearer {}", bearer));
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() && attempt < self.retry_count => {
                    attempt += 1;
                    debug!(attempt, "embedding request connect error, retrying");
                }
                Err(e) => return Err(EmbedError::Request(e.to_string())),
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Gateway connector
// ═══════════════════════════════════════════════════════════════════════

/// Embedding connector for the gateway-hosted model families
/// (`jina-v2-base`, `text-embedding-*`).
#[derive(Debug)]
pub struct GatewayEmbedModel {
    model: String,
    dimensions: usize,
    /// Sent on the wire only when the request configured an override.
    dimension_override: Option<usize>,
    batch_mode: String,
    batch_size: usize,
    min_batch_size: usize,
    max_batch_size: usize,
    latency_threshold_ms: f64,
    window_len: usize,
    client: RemoteEmbedClient,
    oauth: &'static OauthService,
}

impl GatewayEmbedModel {
    /// Resolve the dimension policy and build the connector. No network I/O
    /// happens here; invalid model/dimension combinations fail immediately.
    pub fn new(
        model: &str,
        dimension_override: Option<usize>,
        settings: &Settings,
    ) -> Result<Self, EmbedError> {
        let dimensions = embedding_dims(model, dimension_override)?;
        if settings.embeddings_batch_size == 0 {
            return Err(EmbedError::ZeroBatchSize);
        }
        Ok(Self {
            model: model.to_string(),
            dimensions,
            dimension_override,
            batch_mode: settings.batch_mode.clone(),
            batch_size: settings.embeddings_batch_size,
            min_batch_size: settings.min_batch_size,
            max_batch_size: settings.max_batch_size,
            latency_threshold_ms: settings.latency_threshold_ms,
            window_len: settings.dynamic_batch_window,
            client: RemoteEmbedClient::new(settings.embeddings_endpoint.clone(), settings)?,
            oauth: crate::oauth::global(settings),
        })
    }

    async fn embed_static(
        &self,
        texts: Vec<String>,
        bearer: &str,
    ) -> Result<(Vec<Vec<f32>>, EmbedUsage), EmbedError> {
        // One undersized input goes out as a single request, not a fan-out.
        if texts.len() <= self.batch_size {
            return self
                .client
                .send_batch(&self.model, &texts, bearer, self.dimension_override)
                .await;
        }

        let batches = content_batches(&texts, self.batch_size)?;
        let results = try_join_all(batches.iter().map(|batch| {
            self.client
                .send_batch(&self.model, batch, bearer, self.dimension_override)
        }))
        .await?;

        let mut vectors = Vec::with_capacity(texts.len());
        let mut usage = EmbedUsage::default();
        for (batch_vectors, batch_usage) in results {
            vectors.extend(batch_vectors);
            usage.prompt_tokens += batch_usage.prompt_tokens;
            usage.total_tokens += batch_usage.total_tokens;
        }
        Ok((vectors, usage))
    }

    async fn embed_dynamic(
        &self,
        texts: Vec<String>,
        bearer: &str,
    ) -> Result<(Vec<Vec<f32>>, EmbedUsage), EmbedError> {
        let mut tuner = BatchTuner::new(
            self.batch_size,
            self.min_batch_size,
            self.max_batch_size,
            self.latency_threshold_ms,
            self.window_len,
        );

        let mut vectors = Vec::with_capacity(texts.len());
        let mut usage = EmbedUsage::default();
        let mut cursor = 0;

        while cursor < texts.len() {
            let end = (cursor + tuner.size()).min(texts.len());
            let batch = &texts[cursor..end];

            let started = Instant::now();
            let (batch_vectors, batch_usage) = self
                .client
                .send_batch(&self.model, batch, bearer, self.dimension_override)
                .await?;
            tuner.observe(started.elapsed().as_secs_f64() * 1000.0);

            vectors.extend(batch_vectors);
            usage.prompt_tokens += batch_usage.prompt_tokens;
            usage.total_tokens += batch_usage.total_tokens;
            cursor = end;
        }
        Ok((vectors, usage))
    }
}

#[async_trait]
impl EmbedConnector for GatewayEmbedModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[instrument(skip_all, fields(model = %self.model, docs = documents.len()))]
    async fn embed(
        &self,
        documents: &[RagDocument],
    ) -> Result<(Vec<Vec<f32>>, EmbedUsage), EmbedError> {
        if documents.is_empty() {
            return Ok((Vec::new(), EmbedUsage::default()));
        }

        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let bearer = self
            .oauth
            .token()
            .await
            .map_err(|e| EmbedError::Request(e.to_string()))?;

        match self.batch_mode.as_str() {
            "dynamic" => self.embed_dynamic(texts, &bearer).await,
            _ => self.embed_static(texts, &bearer).await,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Thinktank connector
// ═══════════════════════════════════════════════════════════════════════

/// Embedding connector for the thinktank service: a per-user bearer token,
/// a hard 16-item batch cap, and a separate access-validation step.
#[derive(Debug)]
pub struct ThinktankEmbedModel {
    model: String,
    dimensions: usize,
    user_token: String,
    quota_endpoint: String,
    client: RemoteEmbedClient,
}

impl ThinktankEmbedModel {
    pub fn new(
        model: &str,
        user_token: String,
        settings: &Settings,
    ) -> Result<Self, EmbedError> {
        let dimensions = embedding_dims(model, None)?;
        Ok(Self {
            model: model.to_string(),
            dimensions,
            user_token,
            quota_endpoint: settings.quota_endpoint.clone(),
            client: RemoteEmbedClient::new(settings.thinktank_endpoint.clone(), settings)?,
        })
    }

    /// Check that the caller still has quota. Callable before ingestion; a
    /// blank quota endpoint skips the check.
    pub async fn validate_access(&self) -> Result<(), EmbedError> {
        if self.quota_endpoint.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .http
            .get(&self.quota_endpoint)
            .header("Authorization", format!("Bearer {}", self.user_token))
            .send()
            .await
            .map_err(|e| EmbedError::AccessDenied(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EmbedError::AccessDenied(format!(
                "quota endpoint returned status {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbedError::AccessDenied(e.to_string()))?;
        let available = body
            .get("usage_available")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if available <= 0 {
            return Err(EmbedError::AccessDenied(
                "quota unavailable or exhausted".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EmbedConnector for ThinktankEmbedModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[instrument(skip_all, fields(model = %self.model, docs = documents.len()))]
    async fn embed(
        &self,
        documents: &[RagDocument],
    ) -> Result<(Vec<Vec<f32>>, EmbedUsage), EmbedError> {
        if documents.is_empty() {
            return Ok((Vec::new(), EmbedUsage::default()));
        }

        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let batches = content_batches(&texts, THINKTANK_MAX_BATCH)?;

        let results = try_join_all(batches.iter().map(|batch| {
            self.client
                .send_batch(&self.model, batch, &self.user_token, None)
        }))
        .await?;

        let mut vectors = Vec::with_capacity(texts.len());
        let mut usage = EmbedUsage::default();
        for (batch_vectors, batch_usage) in results {
            vectors.extend(batch_vectors);
            usage.prompt_tokens += batch_usage.prompt_tokens;
            usage.total_tokens += batch_usage.total_tokens;
        }
        Ok((vectors, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;

    #[test]
    fn test_default_dimensions() {
        assert_eq!(embedding_dims("jina-v2-base", None).unwrap(), 768);
        assert_eq!(embedding_dims("text-embedding-ada-002", None).unwrap(), 1536);
        assert_eq!(embedding_dims("text-embedding-3-small", None).unwrap(), 1024);
    }

    #[test]
    fn test_unknown_model_rejected() {
        let err = embedding_dims("mystery", None).unwrap_err();
        assert!(matches!(err, EmbedError::InvalidModel(m) if m == "mystery"));
    }

    #[test]
    fn test_override_on_non_override_model_rejected() {
        let err = embedding_dims("jina-v2-base", Some(1024)).unwrap_err();
        match err {
            EmbedError::InvalidModelDimensions {
                model,
                dimensions,
                expected,
            } => {
                assert_eq!(model, "jina-v2-base");
                assert_eq!(dimensions, 1024);
                assert_eq!(expected, 768);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_override_equal_to_default_accepted() {
        assert_eq!(embedding_dims("jina-v2-base", Some(768)).unwrap(), 768);
    }

    #[test]
    fn test_override_outside_allowlist_rejected() {
        let err = embedding_dims("text-embedding-3-small", Some(999)).unwrap_err();
        assert!(matches!(err, EmbedError::UnsupportedDimensions { .. }));
    }

    #[test]
    fn test_supported_override_accepted() {
        assert_eq!(
            embedding_dims("text-embedding-3-large", Some(3072)).unwrap(),
            3072
        );
    }

    #[test]
    fn test_content_batches_order_and_sizes() {
        let texts: Vec<String> = (0..7).map(|i| format!("t{}", i)).collect();
        let batches = content_batches(&texts, 3).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], vec!["t0", "t1", "t2"]);
        assert_eq!(batches[2], vec!["t6"]);
        let flattened: Vec<String> = batches.into_iter().flatten().collect();
        assert_eq!(flattened, texts);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = content_batches(&["a".to_string()], 0).unwrap_err();
        assert!(matches!(err, EmbedError::ZeroBatchSize));
    }

    #[test]
    fn test_tuner_grows_under_threshold() {
        // Scenario: threshold 200ms, five fast batches grow the size by one
        // each round.
        let mut tuner = BatchTuner::new(10, 1, 500, 200.0, 5);
        for step in 1..=5 {
            tuner.observe(50.0);
            assert_eq!(tuner.size(), 10 + step);
        }
    }

    #[test]
    fn test_tuner_shrinks_over_threshold() {
        let mut tuner = BatchTuner::new(10, 1, 500, 200.0, 5);
        tuner.observe(900.0);
        assert_eq!(tuner.size(), 9);
    }

    #[test]
    fn test_tuner_respects_bounds() {
        let mut tuner = BatchTuner::new(3, 2, 4, 200.0, 5);
        for _ in 0..20 {
            tuner.observe(10.0);
            assert!(tuner.size() <= 4);
        }
        assert_eq!(tuner.size(), 4);
        let mut tuner = BatchTuner::new(3, 2, 4, 200.0, 5);
        for _ in 0..20 {
            tuner.observe(10_000.0);
            assert!(tuner.size() >= 2);
        }
        assert_eq!(tuner.size(), 2);
    }

    #[test]
    fn test_tuner_window_slides() {
        let mut tuner = BatchTuner::new(10, 1, 500, 200.0, 2);
        tuner.observe(1000.0); // avg 1000 -> shrink to 9
        tuner.observe(1000.0); // avg 1000 -> shrink to 8
        tuner.observe(50.0); // window [1000, 50], avg 525 -> shrink to 7
        tuner.observe(50.0); // window [50, 50], avg 50 -> grow to 8
        assert_eq!(tuner.size(), 8);
    }

    #[tokio::test]
    async fn test_empty_input_embeds_to_empty_without_network() {
        let settings = Settings::default();
        let model = GatewayEmbedModel::new("jina-v2-base", None, &settings).unwrap();
        let (vectors, usage) = model.embed(&[]).await.unwrap();
        assert!(vectors.is_empty());
        assert_eq!(usage, EmbedUsage::default());
    }

    #[tokio::test]
    async fn test_construction_rejects_bad_dimensions_before_any_call() {
        let settings = Settings::default();
        let err = GatewayEmbedModel::new("jina-v2-base", Some(1024), &settings).unwrap_err();
        assert!(matches!(err, EmbedError::InvalidModelDimensions { .. }));
    }

    #[tokio::test]
    async fn test_thinktank_skips_validation_without_endpoint() {
        let settings = Settings::default();
        let model =
            ThinktankEmbedModel::new("thinktank-v1-base", "tok".to_string(), &settings).unwrap();
        assert!(model.validate_access().await.is_ok());
        assert_eq!(model.dimensions(), 768);
    }

    #[test]
    fn test_usage_is_summed_per_batch() {
        let mut usage = EmbedUsage::default();
        for part in [
            EmbedUsage {
                prompt_tokens: 3,
                total_tokens: 3,
            },
            EmbedUsage {
                prompt_tokens: 5,
                total_tokens: 6,
            },
        ] {
            usage.prompt_tokens += part.prompt_tokens;
            usage.total_tokens += part.total_tokens;
        }
        assert_eq!(usage.prompt_tokens, 8);
        assert_eq!(usage.total_tokens, 9);
    }

    #[test]
    fn test_rag_document_texts_preserved_in_order() {
        let docs: Vec<RagDocument> = (0..3)
            .map(|i| RagDocument::new(format!("c{}", i), format!("text {}", i), Metadata::new()))
            .collect();
        let texts: Vec<String> = docs.iter().map(|d| d.content.clone()).collect();
        assert_eq!(texts, vec!["text 0", "text 1", "text 2"]);
    }
}
