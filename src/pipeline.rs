//! Pipeline orchestration: extract → process → embed-and-ingest.
//!
//! A [`Pipeline`] is resolved from a [`PipelineConfig`] through the factory
//! registry; any connector failure there is fatal to the run. The three
//! operations mirror the queue stages:
//!
//! 1. [`extract`](Pipeline::extract) — enumerate `(source, CloudFile)` pairs,
//!    full or delta.
//! 2. [`process_file`](Pipeline::process_file) — download (scoped), select a
//!    loader by file type, chunk, and return chunk batches. The downloaded
//!    temp file is deleted when processing finishes, on every exit path.
//! 3. [`embed_and_ingest`](Pipeline::embed_and_ingest) — embed chunks, pair
//!    vectors with chunks positionally, and upsert into the sink.
//!
//! Chunks of a single document keep source order and vectors are
//! order-aligned with their batch, so the positional zip in step 3 is sound.
//! Across documents no ordering is guaranteed; jobs may be reordered by the
//! queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::embedding::EmbedConnector;
use crate::errors::{EmbedError, PipelineError};
use crate::factory::{
    create_chunker, create_embedder, create_sink, create_source, PipelineConfig,
};
use crate::loader::AutoLoader;
use crate::models::{CloudFile, RagDocument, RagVector, METADATA_FILE_ENTRY_ID};
use crate::sink::SinkConnector;
use crate::source::SourceConnector;
use crate::config::Settings;

/// Extraction mode: everything, or only objects newer than a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractType {
    Full,
    Delta,
}

impl std::str::FromStr for ExtractType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(ExtractType::Full),
            "delta" => Ok(ExtractType::Delta),
            other => Err(PipelineError::Config(format!(
                "invalid extract_type '{}'; must be full or delta",
                other
            ))),
        }
    }
}

/// A fully resolved ingestion pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    sources: Vec<Box<dyn SourceConnector>>,
    embedder: Box<dyn EmbedConnector>,
    sink: Box<dyn SinkConnector>,
}

impl Pipeline {
    /// Resolve all connectors from the configuration. Source validation runs
    /// here, so a bad bucket or credential refuses the pipeline before any
    /// job work happens.
    pub async fn from_config(
        config: PipelineConfig,
        settings: &Settings,
    ) -> Result<Self, PipelineError> {
        let mut sources = Vec::with_capacity(config.sources.len());
        for source_config in &config.sources {
            sources.push(create_source(source_config).await?);
        }
        let embedder = create_embedder(&config.embed_model, settings)?;
        let sink = create_sink(&config.sink, settings)?;

        info!(pipeline = %config.id, sources = sources.len(), "pipeline ready");
        Ok(Self {
            config,
            sources,
            embedder,
            sink,
        })
    }

    /// Assemble a pipeline from pre-built connectors. Used by embedded
    /// callers and tests that bring their own implementations.
    pub fn from_parts(
        config: PipelineConfig,
        sources: Vec<Box<dyn SourceConnector>>,
        embedder: Box<dyn EmbedConnector>,
        sink: Box<dyn SinkConnector>,
    ) -> Self {
        Self {
            config,
            sources,
            embedder,
            sink,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn embedder(&self) -> &dyn EmbedConnector {
        self.embedder.as_ref()
    }

    pub fn sink(&self) -> &dyn SinkConnector {
        self.sink.as_ref()
    }

    /// Enumerate extracted files across all sources as
    /// `(source_index, CloudFile)` pairs. A delta run without a checkpoint
    /// behaves like a full run.
    #[instrument(skip(self), fields(pipeline = %self.config.id))]
    pub async fn extract(
        &self,
        extract_type: ExtractType,
        last_extraction: Option<DateTime<Utc>>,
    ) -> Result<Vec<(usize, CloudFile)>, PipelineError> {
        let mut pairs = Vec::new();
        for (index, source) in self.sources.iter().enumerate() {
            let files = match (extract_type, last_extraction) {
                (ExtractType::Delta, Some(since)) => source.list_delta(since).await?,
                _ => source.list_full().await?,
            };
            info!(source = source.name(), files = files.len(), "extraction listed source");
            pairs.extend(files.into_iter().map(|file| (index, file)));
        }
        Ok(pairs)
    }

    /// Download, load, and chunk one file through the pipeline's configured
    /// source at `source_index`.
    pub async fn process(
        &self,
        source_index: usize,
        cloud_file: &CloudFile,
    ) -> Result<Vec<Vec<RagDocument>>, PipelineError> {
        let source = self.sources.get(source_index).ok_or_else(|| {
            PipelineError::Config(format!("no source at index {}", source_index))
        })?;
        self.process_file(source.as_ref(), cloud_file).await
    }

    /// Download, load, and chunk one file. The temp file lives exactly as
    /// long as this call.
    #[instrument(skip(self, source), fields(pipeline = %self.config.id, file = %cloud_file.id))]
    pub async fn process_file(
        &self,
        source: &dyn SourceConnector,
        cloud_file: &CloudFile,
    ) -> Result<Vec<Vec<RagDocument>>, PipelineError> {
        let local = source.download(cloud_file).await?;

        let mut documents = AutoLoader::load(&local).map_err(|e| PipelineError::Load {
            file: cloud_file.id.clone(),
            reason: e.to_string(),
        })?;

        // Stamp provenance so delete_by_file_id can find these chunks later.
        for document in &mut documents {
            document.metadata.insert(
                METADATA_FILE_ENTRY_ID.to_string(),
                serde_json::Value::String(cloud_file.id.clone()),
            );
        }

        let chunker = create_chunker(&cloud_file.metadata)?;
        let batches = chunker.chunk(&documents);

        info!(
            file = %cloud_file.id,
            documents = documents.len(),
            batches = batches.len(),
            "file processed"
        );
        Ok(batches)
        // `local` drops here; the scoped temp directory is removed.
    }

    /// Embed chunks and upsert the resulting vectors. Returns the number of
    /// vectors written.
    #[instrument(skip_all, fields(pipeline = %self.config.id, chunks = chunks.len()))]
    pub async fn embed_and_ingest(&self, chunks: &[RagDocument]) -> Result<usize, PipelineError> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let (vectors, usage) = self.embedder.embed(chunks).await?;
        if vectors.len() != chunks.len() {
            return Err(EmbedError::SizeMismatch {
                input: chunks.len(),
                returned: vectors.len(),
            }
            .into());
        }

        let to_store: Vec<RagVector> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| RagVector {
                id: chunk.id.clone(),
                vector,
                metadata: chunk.metadata.clone(),
            })
            .collect();

        let written = self.sink.store(&to_store).await?;
        info!(written, prompt_tokens = usage.prompt_tokens, "chunks embedded and stored");
        Ok(written)
    }

    /// Embed a single query text and return the k nearest documents.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<crate::models::RagSearchResult>, PipelineError> {
        crate::search::search_with_connectors(self.embedder.as_ref(), self.sink.as_ref(), query, top_k)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_type_parses() {
        assert_eq!("full".parse::<ExtractType>().unwrap(), ExtractType::Full);
        assert_eq!("delta".parse::<ExtractType>().unwrap(), ExtractType::Delta);
        assert!("incremental".parse::<ExtractType>().is_err());
    }

    #[test]
    fn test_extract_type_serde() {
        assert_eq!(
            serde_json::to_string(&ExtractType::Delta).unwrap(),
            "\"delta\""
        );
        let parsed: ExtractType = serde_json::from_str("\"full\"").unwrap();
        assert_eq!(parsed, ExtractType::Full);
    }
}
