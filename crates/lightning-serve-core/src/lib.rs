//! # Lightning Serve Core
//!
//! The query-serving pipeline of Lightning Serve: chunking, embedding,
//! vector retrieval, a single-flight answer cache with version-based
//! invalidation, generation, and per-stage metrics.
//!
//! This crate has no HTTP server, config file handling, or concrete network
//! providers. Those live in the `lightning-serve` application crate, which
//! plugs its providers into the [`embedding::EmbeddingProvider`],
//! [`generator::GenerationProvider`] and [`cache::CacheStore`] traits.
//!
//! | Module | Role |
//! |--------|------|
//! | [`chunk`] | Split documents into retrieval units |
//! | [`embedding`] | Batching, retrying embedder client |
//! | [`index`] | In-memory cosine-similarity vector index |
//! | [`cache`] | Answer cache, single-flight, lazy invalidation |
//! | [`retriever`] | Embed query, search index |
//! | [`generator`] | Timeout-bounded, retrying generation client |
//! | [`metrics`] | Lock-free per-stage counters and histograms |
//! | [`pipeline`] | Owns the components; ingest and query entry points |

pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod generator;
pub mod index;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod retriever;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
