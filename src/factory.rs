//! Pipeline configuration model and connector factories.
//!
//! A pipeline is declared as JSON:
//!
//! ```json
//! {
//!   "id": "docs-pipeline",
//!   "name": "Docs",
//!   "sources": [{
//!     "name": "runbooks",
//!     "type": "object_store",
//!     "settings": { "bucket": "acme-docs", "prefix": "engineering/" }
//!   }],
//!   "embed_model": { "model_name": "jina-v2-base", "settings": {} },
//!   "sink": {
//!     "type": "search_index",
//!     "settings": { "hosts": ["http://localhost:9200"], "index": "acme-docs" }
//!   }
//! }
//! ```
//!
//! Connector settings are tagged enums selected by the `type` field, so an
//! unknown family fails at deserialization and unknown settings keys are
//! rejected outright. Embedding models are keyed by `model_name` through a
//! compile-time table; unknown names produce an [`InvalidConnector`] that
//! lists the known keys. The pipeline never constructs a connector directly,
//! it always goes through the `create_*` functions here.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::chunker::{CharacterChunker, Chunker, RecursiveChunker};
use crate::config::Settings;
use crate::embedding::{
    supported_models, EmbedConnector, GatewayEmbedModel, ThinktankEmbedModel,
};
use crate::errors::{EmbedError, InvalidConnector, PipelineError};
use crate::models::Metadata;
use crate::sink::{SearchIndexSink, SinkConnector};
use crate::source::{ObjectStoreSource, SourceConnector};

// ═══════════════════════════════════════════════════════════════════════
// Configuration model
// ═══════════════════════════════════════════════════════════════════════

/// Declarative pipeline configuration. Immutable for the lifetime of a run
/// and unique per `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    pub name: String,
    pub sources: Vec<SourceConfig>,
    pub embed_model: EmbedConfig,
    pub sink: SinkConfig,
}

/// One source declaration: a name plus family-tagged settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(flatten)]
    pub settings: SourceSettings,
}

/// Source family settings, selected by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "settings", rename_all = "snake_case")]
pub enum SourceSettings {
    ObjectStore(ObjectStoreSettings),
}

/// Object-store source settings. Credentials may be omitted in favor of the
/// standard environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectStoreSettings {
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

/// Embedding model selection plus per-pipeline overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedConfig {
    pub model_name: String,
    #[serde(default)]
    pub settings: EmbedSettings,
}

/// Per-pipeline embedding settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbedSettings {
    /// Dimension override, constrained by the model's allowlist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dimensions: Option<usize>,
    /// Per-user bearer token for the thinktank family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_token: Option<String>,
}

/// Sink family settings, selected by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "settings", rename_all = "snake_case")]
pub enum SinkConfig {
    SearchIndex(SearchIndexSettings),
}

/// Search-index sink settings. `hosts` and `index` are mandatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchIndexSettings {
    pub hosts: Vec<String>,
    pub index: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Factories
// ═══════════════════════════════════════════════════════════════════════

/// Instantiate and validate a source connector. A failed validation refuses
/// the connector, which is fatal for the run.
pub async fn create_source(
    config: &SourceConfig,
) -> Result<Box<dyn SourceConnector>, PipelineError> {
    match &config.settings {
        SourceSettings::ObjectStore(settings) => {
            let source = ObjectStoreSource::new(config.name.clone(), settings)?;
            source.validate().await?;
            info!(source = %config.name, bucket = %settings.bucket, "source connector ready");
            Ok(Box::new(source))
        }
    }
}

/// Instantiate an embedding connector by model name.
pub fn create_embedder(
    config: &EmbedConfig,
    settings: &Settings,
) -> Result<Box<dyn EmbedConnector>, PipelineError> {
    let model = config.model_name.replace(' ', "").to_lowercase();

    let map_invalid = |e: EmbedError| -> PipelineError {
        match e {
            EmbedError::InvalidModel(name) => InvalidConnector {
                family: "embed",
                name,
                available: supported_models(),
            }
            .into(),
            other => other.into(),
        }
    };

    if model.starts_with("thinktank") {
        let token = config.settings.user_token.clone().unwrap_or_default();
        let connector = ThinktankEmbedModel::new(&model, token, settings).map_err(map_invalid)?;
        return Ok(Box::new(connector));
    }

    let connector =
        GatewayEmbedModel::new(&model, config.settings.embedding_dimensions, settings)
            .map_err(map_invalid)?;
    Ok(Box::new(connector))
}

/// Instantiate a sink connector.
pub fn create_sink(
    config: &SinkConfig,
    settings: &Settings,
) -> Result<Box<dyn SinkConnector>, PipelineError> {
    match config {
        SinkConfig::SearchIndex(index_settings) => Ok(Box::new(SearchIndexSink::new(
            &index_settings.hosts,
            &index_settings.index,
            settings.sink_timeout_secs,
        )?)),
    }
}

/// Chunker tuning carried in file metadata under `chunker_config`.
#[derive(Debug, Default, Deserialize)]
struct ChunkerTuning {
    #[serde(default)]
    chunk_size: Option<usize>,
    #[serde(default)]
    chunk_overlap: Option<usize>,
    #[serde(default)]
    batch_size: Option<usize>,
}

/// Instantiate the chunker selected by file metadata (`chunker_name`,
/// `chunker_config`), defaulting to the recursive chunker.
pub fn create_chunker(metadata: &Metadata) -> Result<Box<dyn Chunker>, PipelineError> {
    let name = metadata
        .get("chunker_name")
        .and_then(|v| v.as_str())
        .unwrap_or("recursive")
        .to_lowercase();

    let tuning: ChunkerTuning = metadata
        .get("chunker_config")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| PipelineError::Config(format!("invalid chunker_config: {e}")))?
        .unwrap_or_default();

    let chunk_size = tuning.chunk_size.unwrap_or(500);
    let chunk_overlap = tuning.chunk_overlap.unwrap_or(0);
    let batch_size = tuning.batch_size.unwrap_or(1000);

    match name.as_str() {
        "recursive" => Ok(Box::new(
            RecursiveChunker::new(chunk_size, chunk_overlap, batch_size)
                .map_err(|e| PipelineError::Config(e.to_string()))?,
        )),
        "character" => Ok(Box::new(
            CharacterChunker::new(chunk_size, chunk_overlap, batch_size)
                .map_err(|e| PipelineError::Config(e.to_string()))?,
        )),
        other => Err(InvalidConnector {
            family: "chunker",
            name: other.to_string(),
            available: vec!["recursive", "character"],
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config_json() -> serde_json::Value {
        json!({
            "id": "p1",
            "name": "Docs",
            "sources": [{
                "name": "runbooks",
                "type": "object_store",
                "settings": { "bucket": "acme-docs", "prefix": "eng/" }
            }],
            "embed_model": { "model_name": "jina-v2-base" },
            "sink": {
                "type": "search_index",
                "settings": { "hosts": ["http://localhost:9200"], "index": "docs" }
            }
        })
    }

    #[test]
    fn test_pipeline_config_parses() {
        let config: PipelineConfig = serde_json::from_value(sample_config_json()).unwrap();
        assert_eq!(config.id, "p1");
        assert_eq!(config.sources.len(), 1);
        let SourceSettings::ObjectStore(settings) = &config.sources[0].settings;
        assert_eq!(settings.bucket, "acme-docs");
        let SinkConfig::SearchIndex(sink) = &config.sink;
        assert_eq!(sink.index, "docs");
    }

    #[test]
    fn test_pipeline_config_roundtrips_wire_shape() {
        let config: PipelineConfig = serde_json::from_value(sample_config_json()).unwrap();
        let encoded = serde_json::to_value(&config).unwrap();
        assert_eq!(encoded["sources"][0]["type"], json!("object_store"));
        assert_eq!(encoded["sink"]["type"], json!("search_index"));
        assert_eq!(
            encoded["sources"][0]["settings"]["bucket"],
            json!("acme-docs")
        );
    }

    #[test]
    fn test_unknown_source_family_rejected() {
        let mut raw = sample_config_json();
        raw["sources"][0]["type"] = json!("carrier_pigeon");
        assert!(serde_json::from_value::<PipelineConfig>(raw).is_err());
    }

    #[test]
    fn test_unknown_settings_keys_rejected() {
        let mut raw = sample_config_json();
        raw["sources"][0]["settings"]["surprise"] = json!(true);
        assert!(serde_json::from_value::<PipelineConfig>(raw).is_err());
    }

    #[test]
    fn test_unknown_embed_model_lists_available() {
        let config = EmbedConfig {
            model_name: "made-up-model".to_string(),
            settings: EmbedSettings::default(),
        };
        let err = create_embedder(&config, &Settings::default()).unwrap_err();
        match err {
            PipelineError::Connector(inner) => {
                assert_eq!(inner.family, "embed");
                assert!(inner.available.contains(&"jina-v2-base"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_embedder_model_name_normalized() {
        let config = EmbedConfig {
            model_name: "Jina-V2-Base".to_string(),
            settings: EmbedSettings::default(),
        };
        let embedder = create_embedder(&config, &Settings::default()).unwrap();
        assert_eq!(embedder.model_name(), "jina-v2-base");
        assert_eq!(embedder.dimensions(), 768);
    }

    #[test]
    fn test_dimension_override_rejected_at_factory() {
        let config = EmbedConfig {
            model_name: "jina-v2-base".to_string(),
            settings: EmbedSettings {
                embedding_dimensions: Some(1024),
                user_token: None,
            },
        };
        let err = create_embedder(&config, &Settings::default()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Embed(EmbedError::InvalidModelDimensions { .. })
        ));
    }

    #[test]
    fn test_default_chunker_is_recursive() {
        let chunker = create_chunker(&Metadata::new()).unwrap();
        assert_eq!(chunker.name(), "recursive");
    }

    #[test]
    fn test_chunker_selected_from_metadata() {
        let mut metadata = Metadata::new();
        metadata.insert("chunker_name".to_string(), json!("character"));
        metadata.insert(
            "chunker_config".to_string(),
            json!({ "chunk_size": 100, "chunk_overlap": 10 }),
        );
        let chunker = create_chunker(&metadata).unwrap();
        assert_eq!(chunker.name(), "character");
    }

    #[test]
    fn test_unknown_chunker_rejected() {
        let mut metadata = Metadata::new();
        metadata.insert("chunker_name".to_string(), json!("semantic"));
        let err = create_chunker(&metadata).unwrap_err();
        assert!(matches!(err, PipelineError::Connector(_)));
    }

    #[test]
    fn test_invalid_chunker_config_rejected() {
        let mut metadata = Metadata::new();
        metadata.insert("chunker_config".to_string(), json!({ "chunk_size": 0 }));
        assert!(matches!(
            create_chunker(&metadata).unwrap_err(),
            PipelineError::Config(_)
        ));
    }
}
