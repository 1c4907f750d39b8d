//! Timeline Metrics
//!
//! Prometheus metrics for publish, fan-out, cache and read paths

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};
use std::time::Duration;

static POSTS_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "timeline_posts_published_total",
        "Total posts published, by fan-out mode",
        &["mode"]
    )
    .expect("Failed to register posts published metric")
});

static FANOUT_INSERTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "timeline_fanout_inserts_total",
        "Per-follower fan-out inserts (delivered/duplicate/dropped/cancelled)",
        &["result"]
    )
    .expect("Failed to register fan-out inserts metric")
});

static FANOUT_BATCH_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "timeline_fanout_batch_duration_seconds",
        "Duration of one publish's fan-out batch",
        &["status"],
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    )
    .expect("Failed to register fan-out batch duration metric")
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "timeline_cache_evictions_total",
        "Feed cache entries evicted by capacity trimming"
    )
    .expect("Failed to register cache evictions metric")
});

static UNFOLLOW_PURGED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "timeline_unfollow_purged_entries_total",
        "Feed cache entries removed by unfollow purges"
    )
    .expect("Failed to register unfollow purge metric")
});

static PULL_FETCH_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "timeline_pull_fetch_failures_total",
        "Pull-mode author fetches omitted from a feed read",
        &["reason"]
    )
    .expect("Failed to register pull fetch failures metric")
});

static FEED_READS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "timeline_feed_reads_total",
        "Feed reads, split by whether pull merge was needed",
        &["merge"]
    )
    .expect("Failed to register feed reads metric")
});

pub fn record_publish(mode: &str) {
    POSTS_PUBLISHED_TOTAL.with_label_values(&[mode]).inc();
}

pub fn record_fanout_inserts(result: &str, count: u64) {
    if count > 0 {
        FANOUT_INSERTS_TOTAL.with_label_values(&[result]).inc_by(count);
    }
}

pub fn record_fanout_batch(status: &str, duration: Duration) {
    FANOUT_BATCH_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration.as_secs_f64());
}

pub fn record_evictions(count: u64) {
    if count > 0 {
        CACHE_EVICTIONS_TOTAL.inc_by(count);
    }
}

pub fn record_unfollow_purge(count: u64) {
    UNFOLLOW_PURGED_TOTAL.inc_by(count);
}

/// Reason is "error" or "timeout"
pub fn record_pull_failure(reason: &str) {
    PULL_FETCH_FAILURES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_feed_read(merged: bool) {
    let label = if merged { "pull" } else { "cache_only" };
    FEED_READS_TOTAL.with_label_values(&[label]).inc();
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    use prometheus::{Encoder, TextEncoder};

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
