//! Job model and queue-driven stage composition.
//!
//! The production scheduler is an external system offering at-least-once
//! delivery of named jobs; what lives here is the contract the pipeline
//! consumes: the three job payloads, the [`JobQueue`] trait used to enqueue
//! follow-up work, a local in-process queue, and the worker loop with
//! bounded retries.
//!
//! # Stage topology
//!
//! ```text
//! data_extraction ──(one job per CloudFile)──▶ data_processing
//! data_processing ──(one job per 200 chunks)─▶ data_embed_ingest
//! ```
//!
//! The flush threshold bounds every embed-ingest payload, which bounds the
//! retry unit: re-running an embed-ingest job re-upserts the same chunk ids,
//! so at-least-once delivery stays idempotent.
//!
//! # Retries
//!
//! Each job gets up to `WORKFLOW_RETRY` (default 3) re-attempts for
//! retryable errors (transport, rate-limit, per-object I/O). Anything else,
//! or an exhausted budget, dead-letters the job: the original error is
//! logged with the job kind and the worker moves on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::errors::PipelineError;
use crate::factory::{create_source, PipelineConfig, SourceConfig};
use crate::models::{CloudFile, RagDocument};
use crate::pipeline::{ExtractType, Pipeline};

/// A named job with its exact JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    DataExtraction {
        pipeline_config: PipelineConfig,
        extract_type: ExtractType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_extraction: Option<DateTime<Utc>>,
    },
    DataProcessing {
        pipeline_config: PipelineConfig,
        source_config: SourceConfig,
        cloud_file: CloudFile,
    },
    DataEmbedIngest {
        pipeline_config: PipelineConfig,
        chunks: Vec<RagDocument>,
    },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::DataExtraction { .. } => "data_extraction",
            Job::DataProcessing { .. } => "data_processing",
            Job::DataEmbedIngest { .. } => "data_embed_ingest",
        }
    }
}

/// Enqueue side of the queue system.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job and return its task id.
    async fn enqueue(&self, job: Job) -> Result<String, PipelineError>;
}

/// A queued job with its delivery bookkeeping.
#[derive(Debug)]
pub struct Envelope {
    pub task_id: String,
    pub job: Job,
}

/// In-process queue backing the worker loop. Stands in for the external
/// scheduler in single-process deployments and tests.
pub struct LocalQueue {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl LocalQueue {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn enqueue(&self, job: Job) -> Result<String, PipelineError> {
        let task_id = Uuid::new_v4().to_string();
        info!(task_id = %task_id, kind = job.kind(), "job enqueued");
        self.tx
            .send(Envelope {
                task_id: task_id.clone(),
                job,
            })
            .map_err(|_| PipelineError::Config("job queue is closed".to_string()))?;
        Ok(task_id)
    }
}

/// Drain full batches out of the accumulator. With `force` the remainder is
/// flushed too, as a final possibly-smaller batch.
pub fn drain_flushes(
    accumulator: &mut Vec<RagDocument>,
    threshold: usize,
    force: bool,
) -> Vec<Vec<RagDocument>> {
    let mut flushes = Vec::new();
    while accumulator.len() >= threshold {
        let rest = accumulator.split_off(threshold);
        flushes.push(std::mem::replace(accumulator, rest));
    }
    if force && !accumulator.is_empty() {
        flushes.push(std::mem::take(accumulator));
    }
    flushes
}

/// Run one job to completion.
async fn handle_job(
    job: &Job,
    queue: &dyn JobQueue,
    settings: &Settings,
) -> Result<(), PipelineError> {
    match job {
        Job::DataExtraction {
            pipeline_config,
            extract_type,
            last_extraction,
        } => {
            let pipeline = Pipeline::from_config(pipeline_config.clone(), settings).await?;
            let pairs = pipeline.extract(*extract_type, *last_extraction).await?;
            info!(pipeline = %pipeline_config.id, files = pairs.len(), "extraction complete");

            for (source_index, cloud_file) in pairs {
                let source_config = pipeline_config
                    .sources
                    .get(source_index)
                    .ok_or_else(|| {
                        PipelineError::Config(format!("no source at index {}", source_index))
                    })?
                    .clone();
                queue
                    .enqueue(Job::DataProcessing {
                        pipeline_config: pipeline_config.clone(),
                        source_config,
                        cloud_file,
                    })
                    .await?;
            }
            Ok(())
        }

        Job::DataProcessing {
            pipeline_config,
            source_config,
            cloud_file,
        } => {
            let pipeline = Pipeline::from_config(pipeline_config.clone(), settings).await?;
            let source = create_source(source_config).await?;

            let mut accumulator: Vec<RagDocument> = Vec::new();
            for batch in pipeline.process_file(source.as_ref(), cloud_file).await? {
                accumulator.extend(batch);
                for flush in drain_flushes(&mut accumulator, settings.flush_threshold, false) {
                    queue
                        .enqueue(Job::DataEmbedIngest {
                            pipeline_config: pipeline_config.clone(),
                            chunks: flush,
                        })
                        .await?;
                }
            }
            for flush in drain_flushes(&mut accumulator, settings.flush_threshold, true) {
                queue
                    .enqueue(Job::DataEmbedIngest {
                        pipeline_config: pipeline_config.clone(),
                        chunks: flush,
                    })
                    .await?;
            }
            Ok(())
        }

        Job::DataEmbedIngest {
            pipeline_config,
            chunks,
        } => {
            let pipeline = Pipeline::from_config(pipeline_config.clone(), settings).await?;
            let written = pipeline.embed_and_ingest(chunks).await?;
            info!(pipeline = %pipeline_config.id, written, "embed-ingest complete");
            Ok(())
        }
    }
}

/// Worker loop: dispatch envelopes with bounded retries, then dead-letter.
pub async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    queue: Arc<dyn JobQueue>,
    settings: Settings,
) {
    while let Some(envelope) = rx.recv().await {
        let mut attempt = 0u32;
        loop {
            match handle_job(&envelope.job, queue.as_ref(), &settings).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < settings.workflow_retry => {
                    attempt += 1;
                    warn!(
                        task_id = %envelope.task_id,
                        kind = envelope.job.kind(),
                        attempt,
                        error = %e,
                        "job failed, retrying"
                    );
                }
                Err(e) => {
                    error!(
                        task_id = %envelope.task_id,
                        kind = envelope.job.kind(),
                        attempts = attempt + 1,
                        error = %e,
                        "job dead-lettered"
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;

    fn chunk(i: usize) -> RagDocument {
        RagDocument::new(format!("c_{}", i), "text", Metadata::new())
    }

    #[test]
    fn test_drain_holds_below_threshold() {
        let mut acc: Vec<RagDocument> = (0..150).map(chunk).collect();
        let flushes = drain_flushes(&mut acc, 200, false);
        assert!(flushes.is_empty());
        assert_eq!(acc.len(), 150);
    }

    #[test]
    fn test_drain_emits_full_batches_in_order() {
        let mut acc: Vec<RagDocument> = (0..450).map(chunk).collect();
        let flushes = drain_flushes(&mut acc, 200, false);
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0].len(), 200);
        assert_eq!(flushes[0][0].id, "c_0");
        assert_eq!(flushes[1][0].id, "c_200");
        assert_eq!(acc.len(), 50);
    }

    #[test]
    fn test_drain_force_flushes_remainder() {
        let mut acc: Vec<RagDocument> = (0..250).map(chunk).collect();
        let flushes = drain_flushes(&mut acc, 200, true);
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[1].len(), 50);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_drain_force_on_empty_is_noop() {
        let mut acc: Vec<RagDocument> = Vec::new();
        assert!(drain_flushes(&mut acc, 200, true).is_empty());
    }

    #[test]
    fn test_job_payload_wire_shape() {
        let job = Job::DataEmbedIngest {
            pipeline_config: sample_pipeline_config(),
            chunks: vec![chunk(0)],
        };
        let encoded = serde_json::to_value(&job).unwrap();
        assert_eq!(encoded["job"], serde_json::json!("data_embed_ingest"));
        assert_eq!(encoded["chunks"][0]["id"], serde_json::json!("c_0"));
        let decoded: Job = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.kind(), "data_embed_ingest");
    }

    #[tokio::test]
    async fn test_local_queue_delivers_in_order() {
        let (queue, mut rx) = LocalQueue::new();
        let first = queue
            .enqueue(Job::DataExtraction {
                pipeline_config: sample_pipeline_config(),
                extract_type: ExtractType::Full,
                last_extraction: None,
            })
            .await
            .unwrap();
        queue
            .enqueue(Job::DataEmbedIngest {
                pipeline_config: sample_pipeline_config(),
                chunks: vec![],
            })
            .await
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.task_id, first);
        assert_eq!(envelope.job.kind(), "data_extraction");
        assert_eq!(rx.recv().await.unwrap().job.kind(), "data_embed_ingest");
    }

    fn sample_pipeline_config() -> PipelineConfig {
        serde_json::from_value(serde_json::json!({
            "id": "p1",
            "name": "Docs",
            "sources": [],
            "embed_model": { "model_name": "jina-v2-base" },
            "sink": {
                "type": "search_index",
                "settings": { "hosts": ["http://localhost:9200"], "index": "docs" }
            }
        }))
        .unwrap()
    }
}
