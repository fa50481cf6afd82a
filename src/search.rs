//! Query path: embed one text, retrieve ranked documents from the sink.
//!
//! The query is wrapped as a single-document batch so it goes through the
//! same embedding connector (and dimension policy) as ingestion, then handed
//! to the sink's k-NN search with no filters. Shared by the HTTP server and
//! the CLI.

use crate::config::Settings;
use crate::embedding::EmbedConnector;
use crate::errors::{EmbedError, PipelineError};
use crate::factory::{create_embedder, create_sink, PipelineConfig};
use crate::models::{Metadata, RagDocument, RagSearchResult};
use crate::sink::SinkConnector;

/// Embed `query` and return the `top_k` nearest documents.
pub async fn search_with_connectors(
    embedder: &dyn EmbedConnector,
    sink: &dyn SinkConnector,
    query: &str,
    top_k: usize,
) -> Result<Vec<RagSearchResult>, PipelineError> {
    let document = RagDocument::new("query", query, Metadata::new());
    let (vectors, _usage) = embedder.embed(std::slice::from_ref(&document)).await?;
    let vector = vectors.into_iter().next().ok_or(EmbedError::SizeMismatch {
        input: 1,
        returned: 0,
    })?;

    Ok(sink.search(&vector, top_k, &[]).await?)
}

/// Resolve the embedder and sink for `config` and run a search. Sources are
/// not constructed; the query path never touches them.
pub async fn run_search(
    config: &PipelineConfig,
    settings: &Settings,
    query: &str,
    top_k: usize,
) -> Result<Vec<RagSearchResult>, PipelineError> {
    let embedder = create_embedder(&config.embed_model, settings)?;
    let sink = create_sink(&config.sink, settings)?;
    search_with_connectors(embedder.as_ref(), sink.as_ref(), query, top_k).await
}
