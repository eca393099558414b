use std::sync::Arc;
use std::time::Duration;

use lightning_serve_core::cache::{CacheOutcome, InMemoryCacheStore};
use lightning_serve_core::error::{PipelineError, ProviderError};
use lightning_serve_core::metrics::{Outcome, Stage};
use lightning_serve_core::pipeline::{Pipeline, PipelineParams, QueryRequest};
use lightning_serve_core::testing::{CountingEmbedder, ScriptedGenerator};

const LIGHTNING: &str = "Lightning is a fast weather phenomenon.";

struct Harness {
    pipeline: Arc<Pipeline>,
    embedder: Arc<CountingEmbedder>,
    generator: Arc<ScriptedGenerator>,
}

fn harness_with(params: PipelineParams) -> Harness {
    let embedder = Arc::new(CountingEmbedder::new(256));
    let generator = Arc::new(ScriptedGenerator::new());
    let pipeline = Arc::new(Pipeline::new(
        embedder.clone(),
        generator.clone(),
        Arc::new(InMemoryCacheStore::new(128)),
        params,
    ));
    Harness {
        pipeline,
        embedder,
        generator,
    }
}

fn harness() -> Harness {
    harness_with(PipelineParams::default())
}

#[tokio::test]
async fn test_lightning_scenario_hits_cache_on_repeat() {
    let h = harness();
    h.pipeline.ingest("doc1", LIGHTNING).await.unwrap();

    let first = h
        .pipeline
        .query(QueryRequest::new("What is lightning?").with_top_k(1))
        .await
        .unwrap();
    assert!(first.answer.contains("Lightning is a fast weather phenomenon"));
    assert_eq!(first.chunk_ids, vec!["doc1:v1:0".to_string()]);
    assert!(!first.from_cache);

    let second = h
        .pipeline
        .query(QueryRequest::new("What is lightning?").with_top_k(1))
        .await
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(second.answer, first.answer);
    assert_eq!(second.chunk_ids, first.chunk_ids);
    assert_eq!(h.generator.calls(), 1);

    let metrics = h.pipeline.metrics();
    assert_eq!(metrics.count(Stage::CacheHit, Outcome::Success), 1);
    assert_eq!(metrics.count(Stage::CacheMiss, Outcome::Success), 1);
    assert_eq!(metrics.count(Stage::Query, Outcome::Success), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_identical_queries_share_one_computation() {
    let h = harness();
    h.pipeline.ingest("doc1", LIGHTNING).await.unwrap();
    let embed_calls_after_ingest = h.embedder.calls();
    h.generator.set_delay(Duration::from_millis(50));

    let (a, b) = tokio::join!(
        h.pipeline.query(QueryRequest::new("What is lightning?")),
        h.pipeline.query(QueryRequest::new("  what is LIGHTNING? ")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(h.embedder.calls() - embed_calls_after_ingest, 1);
    assert_eq!(h.generator.calls(), 1);
    assert_eq!(a.answer, b.answer);
    assert_eq!(a.chunk_ids, b.chunk_ids);
    let mut outcomes = vec![a.cache, b.cache];
    outcomes.sort_by_key(|o| *o as u8);
    assert_eq!(outcomes, vec![CacheOutcome::Computed, CacheOutcome::Shared]);
}

#[tokio::test]
async fn test_reupload_invalidates_cached_answer() {
    let h = harness();
    h.pipeline.ingest("doc1", LIGHTNING).await.unwrap();
    let before = h
        .pipeline
        .query(QueryRequest::new("What is lightning?"))
        .await
        .unwrap();

    let report = h
        .pipeline
        .ingest("doc1", "Lightning is actually a slow electrical discharge.")
        .await
        .unwrap();
    assert_eq!(report.version, 2);
    assert!(report.corpus_version > before.corpus_version);

    let after = h
        .pipeline
        .query(QueryRequest::new("What is lightning?"))
        .await
        .unwrap();
    assert!(!after.from_cache);
    assert_ne!(after.answer, before.answer);
    assert_eq!(after.chunk_ids, vec!["doc1:v2:0".to_string()]);
    assert_eq!(h.generator.calls(), 2);

    let stats = h.pipeline.cache().stats().await;
    assert_eq!(stats.stale_evictions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_generator_timeout_is_not_cached() {
    let h = harness_with(PipelineParams {
        generation_timeout: Duration::from_millis(100),
        ..PipelineParams::default()
    });
    h.pipeline.ingest("doc1", LIGHTNING).await.unwrap();
    h.generator.set_delay(Duration::from_secs(5));

    let err = h
        .pipeline
        .query(QueryRequest::new("What is lightning?"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::GenerationTimeout { .. }));
    assert!(err.is_retryable());

    let metrics = h.pipeline.metrics();
    assert_eq!(metrics.count(Stage::Generate, Outcome::Timeout), 1);
    assert_eq!(metrics.count(Stage::Query, Outcome::Timeout), 1);
    assert_eq!(h.pipeline.cache().stats().await.entries, Some(0));

    h.generator.set_delay(Duration::ZERO);
    let retry = h
        .pipeline
        .query(QueryRequest::new("What is lightning?"))
        .await
        .unwrap();
    assert!(!retry.from_cache);
}

#[tokio::test]
async fn test_failed_generation_does_not_poison_key() {
    let h = harness();
    h.pipeline.ingest("doc1", LIGHTNING).await.unwrap();
    h.generator
        .fail_next(ProviderError::permanent("HTTP 400: bad request"));

    let err = h
        .pipeline
        .query(QueryRequest::new("What is lightning?"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "generation_unavailable");

    let ok = h
        .pipeline
        .query(QueryRequest::new("What is lightning?"))
        .await
        .unwrap();
    assert!(!ok.from_cache);
    assert_eq!(h.generator.calls(), 2);
}

#[tokio::test]
async fn test_embedding_outage_surfaces_after_retries() {
    let h = harness_with(PipelineParams {
        embed_retry: lightning_serve_core::embedding::RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        ..PipelineParams::default()
    });
    h.pipeline.ingest("doc1", LIGHTNING).await.unwrap();
    h.embedder.fail_next(ProviderError::transient("HTTP 503"));
    h.embedder.fail_next(ProviderError::transient("HTTP 503"));

    let err = h
        .pipeline
        .query(QueryRequest::new("What is lightning?"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        PipelineError::EmbeddingService {
            attempts: 2,
            cause: "HTTP 503".into()
        }
    );
    assert_eq!(h.generator.calls(), 0);
    assert_eq!(h.pipeline.metrics().count(Stage::Embed, Outcome::Error), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_request_releases_its_permit() {
    let h = harness_with(PipelineParams {
        max_concurrency: 1,
        request_timeout: Duration::from_millis(50),
        ..PipelineParams::default()
    });
    h.pipeline.ingest("doc1", LIGHTNING).await.unwrap();
    h.pipeline.ingest("doc2", "Thunder follows the flash.").await.unwrap();
    h.generator.set_delay(Duration::from_secs(30));

    let err = h
        .pipeline
        .query(QueryRequest::new("What is lightning?"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::RequestTimeout { .. }));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let stats = h.pipeline.stats().await;
    assert_eq!(stats.available_permits, 1);
    assert_eq!(stats.cache.in_flight, 0);
    assert_eq!(stats.cache.entries, Some(0));

    h.generator.set_delay(Duration::ZERO);
    let other = h
        .pipeline
        .query(QueryRequest::new("What follows the flash?"))
        .await
        .unwrap();
    assert!(!other.from_cache);
    assert_eq!(h.generator.calls(), 2);
}

#[tokio::test]
async fn test_shared_store_never_serves_another_processes_corpus() {
    let store = Arc::new(InMemoryCacheStore::new(128));
    let replica = |generator: &Arc<ScriptedGenerator>| {
        Pipeline::new(
            Arc::new(CountingEmbedder::new(256)),
            generator.clone(),
            store.clone(),
            PipelineParams::default(),
        )
    };
    let first_generator = Arc::new(ScriptedGenerator::new());
    let second_generator = Arc::new(ScriptedGenerator::new());
    let first = replica(&first_generator);
    let second = replica(&second_generator);

    first.ingest("doc1", LIGHTNING).await.unwrap();
    let old = first
        .query(QueryRequest::new("What is lightning?"))
        .await
        .unwrap();
    assert!(old.answer.contains("fast"));

    second
        .ingest("doc1", "Lightning is actually a slow electrical discharge.")
        .await
        .unwrap();
    assert_eq!(second.corpus_version(), first.corpus_version());

    let fresh = second
        .query(QueryRequest::new("What is lightning?"))
        .await
        .unwrap();
    assert!(!fresh.from_cache);
    assert!(fresh.answer.contains("slow"), "answer: {}", fresh.answer);
    assert_eq!(second_generator.calls(), 1);

    let repeat = second
        .query(QueryRequest::new("What is lightning?"))
        .await
        .unwrap();
    assert!(repeat.from_cache);
    assert_eq!(repeat.answer, fresh.answer);
}

#[tokio::test]
async fn test_nearest_neighbour_is_reproducible() {
    let docs = [
        ("weather", LIGHTNING),
        ("baking", "Bread rises when yeast ferments the dough."),
        ("rivers", "Rivers carry sediment from mountains to the sea."),
    ];
    let mut answers = Vec::new();
    for _ in 0..2 {
        let h = harness();
        for (id, text) in docs {
            h.pipeline.ingest(id, text).await.unwrap();
        }
        let response = h
            .pipeline
            .query(QueryRequest::new("How does yeast make bread rise?").with_top_k(1))
            .await
            .unwrap();
        answers.push(response.chunk_ids);
    }
    assert_eq!(answers[0], vec!["baking:v1:0".to_string()]);
    assert_eq!(answers[0], answers[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_and_query() {
    let h = harness();
    h.pipeline.ingest("seed", LIGHTNING).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let pipeline = Arc::clone(&h.pipeline);
        tasks.push(tokio::spawn(async move {
            pipeline
                .ingest(&format!("doc{}", i), &format!("Document {} talks about storms.", i))
                .await
                .map(|_| ())
        }));
        let pipeline = Arc::clone(&h.pipeline);
        tasks.push(tokio::spawn(async move {
            pipeline
                .query(QueryRequest::new(format!("storms {}", i % 3)))
                .await
                .map(|_| ())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.pipeline.list_documents().len(), 9);
    assert_eq!(h.pipeline.index().len(), 9);
    assert_eq!(h.pipeline.cache().in_flight(), 0);
}
