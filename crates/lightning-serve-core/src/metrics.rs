//! Pipeline metrics collector.
//!
//! Every stage of ingestion and query serving reports a [`PipelineMetric`]
//! (stage, latency, outcome). Recording is a handful of relaxed atomic
//! increments: it cannot fail and never blocks the serving path.
//!
//! [`MetricsCollector::snapshot`] produces a read-only, serializable view
//! (per-stage outcome counters, cumulative latency histograms, a similarity
//! score histogram). Rendering it in a text exposition format is left to the
//! HTTP layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Latency histogram bucket upper bounds, in seconds.
pub const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Similarity histogram bucket upper bounds.
pub const SIMILARITY_BUCKETS: [f64; 10] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Embed,
    Retrieve,
    Generate,
    CacheHit,
    CacheMiss,
    CacheStore,
    Ingest,
    Query,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Embed,
        Stage::Retrieve,
        Stage::Generate,
        Stage::CacheHit,
        Stage::CacheMiss,
        Stage::CacheStore,
        Stage::Ingest,
        Stage::Query,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Embed => "embed",
            Stage::Retrieve => "retrieve",
            Stage::Generate => "generate",
            Stage::CacheHit => "cache_hit",
            Stage::CacheMiss => "cache_miss",
            Stage::CacheStore => "cache_store",
            Stage::Ingest => "ingest",
            Stage::Query => "query",
        }
    }

    fn slot(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
    Timeout,
}

impl Outcome {
    pub const ALL: [Outcome; 3] = [Outcome::Success, Outcome::Error, Outcome::Timeout];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
            Outcome::Timeout => "timeout",
        }
    }

    fn slot(&self) -> usize {
        *self as usize
    }
}

/// One observation of a pipeline stage.
#[derive(Debug, Clone, Copy)]
pub struct PipelineMetric {
    pub stage: Stage,
    pub latency: Duration,
    pub outcome: Outcome,
}

struct Histogram<const N: usize> {
    bounds: &'static [f64; N],
    /// Per-bucket (non-cumulative) counts; the last slot is `+Inf`.
    counts: [AtomicU64; N],
    overflow: AtomicU64,
    /// Sum of observations in micro-units.
    sum_micros: AtomicU64,
}

impl<const N: usize> Histogram<N> {
    fn new(bounds: &'static [f64; N]) -> Self {
        Self {
            bounds,
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            overflow: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        match self.bounds.iter().position(|b| value <= *b) {
            Some(i) => self.counts[i].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
        let micros = (value.max(0.0) * 1_000_000.0) as u64;
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = 0u64;
        let mut buckets = Vec::with_capacity(N);
        for (bound, count) in self.bounds.iter().zip(self.counts.iter()) {
            cumulative += count.load(Ordering::Relaxed);
            buckets.push(BucketSnapshot {
                le: *bound,
                count: cumulative,
            });
        }
        let count = cumulative + self.overflow.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets,
            count,
            sum: self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

struct StageCounters {
    outcomes: [AtomicU64; 3],
    latency: Histogram<11>,
}

/// Aggregates [`PipelineMetric`]s. Shared by reference across all tasks.
pub struct MetricsCollector {
    started: Instant,
    stages: [StageCounters; 8],
    similarity: Histogram<10>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            stages: std::array::from_fn(|_| StageCounters {
                outcomes: std::array::from_fn(|_| AtomicU64::new(0)),
                latency: Histogram::new(&LATENCY_BUCKETS),
            }),
            similarity: Histogram::new(&SIMILARITY_BUCKETS),
        }
    }

    /// Record one stage observation.
    pub fn record(&self, stage: Stage, latency: Duration, outcome: Outcome) {
        self.record_metric(PipelineMetric {
            stage,
            latency,
            outcome,
        });
    }

    pub fn record_metric(&self, metric: PipelineMetric) {
        let counters = &self.stages[metric.stage.slot()];
        counters.outcomes[metric.outcome.slot()].fetch_add(1, Ordering::Relaxed);
        counters.latency.observe(metric.latency.as_secs_f64());
    }

    /// Record the best similarity score of a retrieval.
    pub fn record_similarity(&self, score: f32) {
        if score.is_finite() {
            self.similarity.observe(score as f64);
        }
    }

    /// Count for one stage and outcome.
    pub fn count(&self, stage: Stage, outcome: Outcome) -> u64 {
        self.stages[stage.slot()].outcomes[outcome.slot()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stages = Stage::ALL
            .iter()
            .map(|stage| {
                let counters = &self.stages[stage.slot()];
                StageSnapshot {
                    stage: *stage,
                    success: counters.outcomes[Outcome::Success.slot()].load(Ordering::Relaxed),
                    error: counters.outcomes[Outcome::Error.slot()].load(Ordering::Relaxed),
                    timeout: counters.outcomes[Outcome::Timeout.slot()].load(Ordering::Relaxed),
                    latency_seconds: counters.latency.snapshot(),
                }
            })
            .collect();

        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            stages,
            similarity: self.similarity.snapshot(),
        }
    }
}

/// Read-only view of all collected metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub stages: Vec<StageSnapshot>,
    pub similarity: HistogramSnapshot,
}

impl MetricsSnapshot {
    pub fn stage(&self, stage: Stage) -> Option<&StageSnapshot> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Fraction of cache lookups that hit, in `[0, 1]`.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.stage(Stage::CacheHit).map(|s| s.total()).unwrap_or(0);
        let misses = self.stage(Stage::CacheMiss).map(|s| s.total()).unwrap_or(0);
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSnapshot {
    pub stage: Stage,
    pub success: u64,
    pub error: u64,
    pub timeout: u64,
    pub latency_seconds: HistogramSnapshot,
}

impl StageSnapshot {
    pub fn total(&self) -> u64 {
        self.success + self.error + self.timeout
    }

    pub fn by_outcome(&self, outcome: Outcome) -> u64 {
        match outcome {
            Outcome::Success => self.success,
            Outcome::Error => self.error,
            Outcome::Timeout => self.timeout,
        }
    }
}

/// Cumulative histogram: each bucket counts observations `<= le`.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<BucketSnapshot>,
    pub count: u64,
    pub sum: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub le: f64,
    pub count: u64,
}
