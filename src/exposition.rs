//! Prometheus text exposition (format 0.0.4) of pipeline statistics.

use std::fmt::Write;

use lightning_serve_core::metrics::{HistogramSnapshot, Outcome};
use lightning_serve_core::pipeline::PipelineStats;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render a stats snapshot as Prometheus text.
pub fn render(stats: &PipelineStats) -> String {
    let mut out = String::with_capacity(8 * 1024);
    let metrics = &stats.metrics;

    header(
        &mut out,
        "lightning_stage_events_total",
        "counter",
        "Pipeline stage observations by outcome.",
    );
    for stage in &metrics.stages {
        for outcome in Outcome::ALL {
            let _ = writeln!(
                out,
                "lightning_stage_events_total{{stage=\"{}\",outcome=\"{}\"}} {}",
                stage.stage.as_str(),
                outcome.as_str(),
                stage.by_outcome(outcome)
            );
        }
    }

    header(
        &mut out,
        "lightning_stage_duration_seconds",
        "histogram",
        "Pipeline stage latency.",
    );
    for stage in &metrics.stages {
        histogram(
            &mut out,
            "lightning_stage_duration_seconds",
            &format!("stage=\"{}\"", stage.stage.as_str()),
            &stage.latency_seconds,
        );
    }

    header(
        &mut out,
        "lightning_similarity_score",
        "histogram",
        "Best retrieval similarity score per query.",
    );
    histogram(&mut out, "lightning_similarity_score", "", &metrics.similarity);

    gauge(
        &mut out,
        "lightning_cache_hit_ratio",
        "Fraction of cache lookups served from cache.",
        metrics.cache_hit_rate(),
    );
    gauge(
        &mut out,
        "lightning_cache_in_flight",
        "Answer computations currently running.",
        stats.cache.in_flight as f64,
    );
    if let Some(entries) = stats.cache.entries {
        gauge(
            &mut out,
            "lightning_cache_entries",
            "Entries held by the cache store.",
            entries as f64,
        );
    }
    counter(
        &mut out,
        "lightning_cache_stale_evictions_total",
        "Entries dropped because the corpus changed.",
        stats.cache.stale_evictions,
    );
    counter(
        &mut out,
        "lightning_cache_store_errors_total",
        "Failed cache store operations.",
        stats.cache.store_errors,
    );
    gauge(
        &mut out,
        "lightning_documents",
        "Documents currently indexed.",
        stats.documents as f64,
    );
    gauge(
        &mut out,
        "lightning_chunks",
        "Chunks currently indexed.",
        stats.chunks as f64,
    );
    gauge(
        &mut out,
        "lightning_corpus_version",
        "Current corpus version.",
        stats.corpus_version as f64,
    );
    gauge(
        &mut out,
        "lightning_available_permits",
        "Unused concurrency permits.",
        stats.available_permits as f64,
    );
    gauge(
        &mut out,
        "lightning_uptime_seconds",
        "Seconds since the process started.",
        metrics.uptime_seconds,
    );

    out
}

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

fn gauge(out: &mut String, name: &str, help: &str, value: f64) {
    header(out, name, "gauge", help);
    let _ = writeln!(out, "{} {}", name, value);
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    header(out, name, "counter", help);
    let _ = writeln!(out, "{} {}", name, value);
}

fn histogram(out: &mut String, name: &str, labels: &str, h: &HistogramSnapshot) {
    let sep = if labels.is_empty() { "" } else { "," };
    for bucket in &h.buckets {
        let _ = writeln!(
            out,
            "{}_bucket{{{}{}le=\"{}\"}} {}",
            name, labels, sep, bucket.le, bucket.count
        );
    }
    let _ = writeln!(out, "{}_bucket{{{}{}le=\"+Inf\"}} {}", name, labels, sep, h.count);
    let braces = if labels.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", labels)
    };
    let _ = writeln!(out, "{}_sum{} {}", name, braces, h.sum);
    let _ = writeln!(out, "{}_count{} {}", name, braces, h.count);
}
