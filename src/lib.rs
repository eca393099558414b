//! # Lightning Serve
//!
//! A retrieval-augmented inference gateway. Documents are chunked, embedded
//! and indexed in memory; queries are answered by retrieving the closest
//! passages and asking a language model, with a single-flight answer cache
//! in front that is invalidated whenever the corpus changes.
//!
//! The pipeline itself lives in [`lightning_serve_core`]. This crate adds
//! configuration, concrete providers, the HTTP surface and tooling.
//!
//! ## Architecture
//!
//! ```text
//!            ┌────────────┐   miss   ┌───────────┐   ┌───────────┐
//! POST ────▶ │ QueryCache │ ───────▶ │ Retriever │──▶│ Generator │
//! /query     │ (1 flight) │ ◀─────── │ embed+knn │   │ LLM call  │
//!            └────────────┘  answer  └───────────┘   └───────────┘
//!                  ▲                       ▲
//!                  │ corpus version        │
//! POST ──────▶ chunk ─▶ embed ─▶ VectorIndex
//! /documents
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`providers`] | Embedding and generation providers (offline or HTTP) |
//! | [`server`] | Axum HTTP server |
//! | [`exposition`] | Prometheus text rendering of pipeline statistics |
//! | [`bench`] | Load generator against a running server |
//! | `cache_redis` | Redis answer store (`redis-cache` feature) |

pub mod bench;
#[cfg(feature = "redis-cache")]
pub mod cache_redis;
pub mod config;
pub mod exposition;
pub mod providers;
pub mod server;
