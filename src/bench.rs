//! Load generator for a running server.
//!
//! Sends `total` queries to `POST {url}/query`, at most `concurrency` at a
//! time, cycling through the given query texts. Repeated texts exercise the
//! answer cache; distinct texts exercise the full pipeline.

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Queries used when none are given on the command line.
pub const DEFAULT_QUERIES: &[&str] = &[
    "What is lightning?",
    "How fast does lightning travel?",
    "What causes thunder?",
    "Where does lightning strike most often?",
    "How is lightning measured?",
];

#[derive(Debug, Clone)]
pub struct BenchOptions {
    pub url: String,
    pub queries: Vec<String>,
    pub total: usize,
    pub concurrency: usize,
    pub top_k: Option<usize>,
    pub timeout: Duration,
}

/// Only the field the driver reads from a `/query` response.
#[derive(Deserialize)]
struct QueryReply {
    from_cache: bool,
}

struct Sample {
    latency: Duration,
    ok: bool,
    from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct BenchReport {
    pub requests: usize,
    pub errors: usize,
    pub cache_hits: usize,
    pub wall_time: Duration,
    /// Successful request latencies in milliseconds, ascending.
    pub latencies_ms: Vec<f64>,
}

impl BenchReport {
    pub fn error_rate(&self) -> f64 {
        ratio(self.errors, self.requests)
    }

    /// Fraction of successful responses served from cache.
    pub fn cache_hit_rate(&self) -> f64 {
        ratio(self.cache_hits, self.requests - self.errors)
    }

    pub fn throughput(&self) -> f64 {
        let secs = self.wall_time.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.requests as f64 / secs
        }
    }

    pub fn mean_ms(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64
    }

    pub fn percentile_ms(&self, p: f64) -> f64 {
        percentile(&self.latencies_ms, p)
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "requests:     {}", self.requests)?;
        writeln!(f, "errors:       {} ({:.1}%)", self.errors, self.error_rate() * 100.0)?;
        writeln!(f, "cache hits:   {:.1}%", self.cache_hit_rate() * 100.0)?;
        writeln!(f, "wall time:    {:.2}s", self.wall_time.as_secs_f64())?;
        writeln!(f, "throughput:   {:.1} req/s", self.throughput())?;
        writeln!(f, "latency mean: {:.1} ms", self.mean_ms())?;
        writeln!(f, "latency p50:  {:.1} ms", self.percentile_ms(50.0))?;
        writeln!(f, "latency p95:  {:.1} ms", self.percentile_ms(95.0))?;
        write!(f, "latency p99:  {:.1} ms", self.percentile_ms(99.0))
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

pub async fn run_bench(options: &BenchOptions) -> Result<BenchReport> {
    if options.queries.is_empty() {
        bail!("at least one query text is required");
    }
    if options.concurrency == 0 {
        bail!("concurrency must be > 0");
    }

    let client = reqwest::Client::builder()
        .timeout(options.timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let endpoint = format!("{}/query", options.url.trim_end_matches('/'));

    let started = Instant::now();
    let samples: Vec<Sample> = stream::iter(0..options.total)
        .map(|i| {
            let client = client.clone();
            let endpoint = endpoint.clone();
            let query = options.queries[i % options.queries.len()].clone();
            let top_k = options.top_k;
            async move { send_one(&client, &endpoint, query, top_k).await }
        })
        .buffer_unordered(options.concurrency)
        .collect()
        .await;
    let wall_time = started.elapsed();

    let errors = samples.iter().filter(|s| !s.ok).count();
    let cache_hits = samples.iter().filter(|s| s.from_cache).count();
    let mut latencies_ms: Vec<f64> = samples
        .iter()
        .filter(|s| s.ok)
        .map(|s| s.latency.as_secs_f64() * 1000.0)
        .collect();
    latencies_ms.sort_by(|a, b| a.total_cmp(b));

    Ok(BenchReport {
        requests: samples.len(),
        errors,
        cache_hits,
        wall_time,
        latencies_ms,
    })
}

async fn send_one(
    client: &reqwest::Client,
    endpoint: &str,
    query: String,
    top_k: Option<usize>,
) -> Sample {
    let started = Instant::now();
    let body = serde_json::json!({ "query": query, "top_k": top_k, "include_context": false });
    let result = async {
        let response = client.post(endpoint).json(&body).send().await?;
        let response = response.error_for_status()?;
        response.json::<QueryReply>().await
    }
    .await;
    let latency = started.elapsed();

    match result {
        Ok(reply) => Sample {
            latency,
            ok: true,
            from_cache: reply.from_cache,
        },
        Err(e) => {
            debug!(error = %e, "bench request failed");
            Sample {
                latency,
                ok: false,
                from_cache: false,
            }
        }
    }
}
