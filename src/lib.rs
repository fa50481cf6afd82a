//! # ragline
//!
//! **A staged RAG ingestion and vector search pipeline.**
//!
//! ragline extracts documents from object stores, loads and splits them into
//! semantic chunks, computes embeddings for each chunk through a remote
//! embedding gateway, and upserts the vectors with their metadata into a
//! vector-capable search index. A companion path embeds a query and serves
//! k-NN search over previously ingested content.
//!
//! ## Architecture
//!
//! ```text
//! Config ──▶ Pipeline ──▶ Extractor ──▶ Processor ──▶ Embedder ──▶ Sink
//!               │           (Source)     (Loader+      (Adaptive    (Vector
//!               │                         Chunker)      Batcher)     Index)
//!               └──▶ Search ◀── Sink.search ◀── Embedder
//! ```
//!
//! ## Data flow
//!
//! 1. A `data_extraction` job enumerates [`models::CloudFile`]s from every
//!    configured source and enqueues one `data_processing` job per file.
//! 2. `data_processing` downloads the file to a scoped temp path, selects a
//!    loader by content type ([`loader`]), chunks the documents
//!    ([`chunker`]), and enqueues `data_embed_ingest` jobs of at most 200
//!    chunks each.
//! 3. `data_embed_ingest` embeds the chunks ([`embedding`]) and upserts the
//!    order-aligned vectors into the sink ([`sink`]).
//!
//! Jobs are delivered at-least-once; key-based upsert keeps re-runs
//! idempotent.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-driven settings, every key defaulted |
//! | [`models`] | `CloudFile`, `LocalFile`, `RagDocument`, `RagVector`, search results |
//! | [`errors`] | Typed error taxonomy per connector family |
//! | [`source`] | Source connectors: object-store listing + scoped downloads |
//! | [`loader`] | Extension-dispatched file loaders |
//! | [`chunker`] | Recursive and character chunkers with batch emission |
//! | [`embedding`] | Dimension policy, adaptive batcher, embedding connectors |
//! | [`oauth`] | Process-global single-flight OAuth token cache |
//! | [`telemetry`] | Bounded token-usage telemetry channel |
//! | [`sink`] | Sink connectors: upsert, k-NN search, filters |
//! | [`factory`] | Pipeline configuration model and connector factories |
//! | [`pipeline`] | The three stage operations |
//! | [`queue`] | Job payloads, local queue, worker loop with retries |
//! | [`search`] | Query path shared by CLI and server |
//! | [`server`] | HTTP configuration and search API (Axum) |

pub mod chunker;
pub mod config;
pub mod embedding;
pub mod errors;
pub mod factory;
pub mod loader;
pub mod models;
pub mod oauth;
pub mod pipeline;
pub mod queue;
pub mod search;
pub mod server;
pub mod sink;
pub mod source;
pub mod telemetry;
