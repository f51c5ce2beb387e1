use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;
use salvo::prelude::*;

static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

static MESSAGES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_RELAYED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_DROPPED: AtomicU64 = AtomicU64::new(0);
static DELIVERIES_OK: AtomicU64 = AtomicU64::new(0);
static DELIVERIES_FAILED: AtomicU64 = AtomicU64::new(0);
static DELIVERIES_RETRIED: AtomicU64 = AtomicU64::new(0);
static CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static CACHE_MISSES: AtomicU64 = AtomicU64::new(0);
static WS_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

pub struct Metrics;

impl Metrics {
    /// Pins the process start time; call once at boot.
    pub fn init() {
        Lazy::force(&STARTED_AT);
    }

    pub fn message_received() {
        MESSAGES_RECEIVED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_relayed() {
        MESSAGES_RELAYED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped() {
        MESSAGES_DROPPED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_ok() {
        DELIVERIES_OK.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_failed() {
        DELIVERIES_FAILED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_retried() {
        DELIVERIES_RETRIED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit() {
        CACHE_HITS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss() {
        CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ws_connected() {
        WS_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ws_disconnected() {
        let _ = WS_CONNECTIONS.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    pub fn ws_connection_count() -> u64 {
        WS_CONNECTIONS.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds() -> u64 {
        STARTED_AT.elapsed().as_secs()
    }
}

pub fn format_prometheus() -> String {
    let uptime = Metrics::uptime_seconds();
    let received = MESSAGES_RECEIVED.load(Ordering::Relaxed);
    let relayed = MESSAGES_RELAYED.load(Ordering::Relaxed);
    let dropped = MESSAGES_DROPPED.load(Ordering::Relaxed);
    let deliveries_ok = DELIVERIES_OK.load(Ordering::Relaxed);
    let deliveries_failed = DELIVERIES_FAILED.load(Ordering::Relaxed);
    let deliveries_retried = DELIVERIES_RETRIED.load(Ordering::Relaxed);
    let cache_hits = CACHE_HITS.load(Ordering::Relaxed);
    let cache_misses = CACHE_MISSES.load(Ordering::Relaxed);
    let ws_connections = WS_CONNECTIONS.load(Ordering::Relaxed);

    let total_cache = cache_hits + cache_misses;
    let cache_hit_rate = if total_cache > 0 {
        (cache_hits as f64 / total_cache as f64) * 100.0
    } else {
        0.0
    };

    format!(
        r#"# HELP relay_uptime_seconds Number of seconds the relay has been running
# TYPE relay_uptime_seconds gauge
relay_uptime_seconds {}

# HELP relay_messages_received Total number of inbound platform messages
# TYPE relay_messages_received counter
relay_messages_received {}

# HELP relay_messages_relayed Number of messages fanned out to room subscribers
# TYPE relay_messages_relayed counter
relay_messages_relayed {}

# HELP relay_messages_dropped Number of messages dropped by policy
# TYPE relay_messages_dropped counter
relay_messages_dropped {}

# HELP relay_deliveries_ok Number of successful per-target deliveries
# TYPE relay_deliveries_ok counter
relay_deliveries_ok {}

# HELP relay_deliveries_failed Number of per-target deliveries that exhausted retries
# TYPE relay_deliveries_failed counter
relay_deliveries_failed {}

# HELP relay_deliveries_retried Number of per-target delivery retries
# TYPE relay_deliveries_retried counter
relay_deliveries_retried {}

# HELP cache_hits_total Number of cache hits
# TYPE cache_hits_total counter
cache_hits_total {}

# HELP cache_misses_total Number of cache misses
# TYPE cache_misses_total counter
cache_misses_total {}

# HELP cache_hit_rate_percent Cache hit rate as percentage
# TYPE cache_hit_rate_percent gauge
cache_hit_rate_percent {}

# HELP ws_connections Current number of live push connections
# TYPE ws_connections gauge
ws_connections {}
"#,
        uptime,
        received,
        relayed,
        dropped,
        deliveries_ok,
        deliveries_failed,
        deliveries_retried,
        cache_hits,
        cache_misses,
        cache_hit_rate,
        ws_connections,
    )
}

#[handler]
pub async fn metrics_endpoint(res: &mut Response) {
    res.headers_mut()
        .insert("Content-Type", "text/plain; charset=utf-8".parse().unwrap());
    let _ = res.write_body(format_prometheus());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_increments_counters() {
        Metrics::message_received();
        Metrics::message_relayed();
        Metrics::delivery_ok();
        Metrics::cache_hit();
        Metrics::cache_miss();

        assert!(MESSAGES_RECEIVED.load(Ordering::Relaxed) >= 1);
        assert!(MESSAGES_RELAYED.load(Ordering::Relaxed) >= 1);
        assert!(DELIVERIES_OK.load(Ordering::Relaxed) >= 1);
        assert!(CACHE_HITS.load(Ordering::Relaxed) >= 1);
        assert!(CACHE_MISSES.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn format_prometheus_includes_all_metrics() {
        let output = format_prometheus();
        assert!(output.contains("relay_uptime_seconds"));
        assert!(output.contains("relay_messages_received"));
        assert!(output.contains("relay_deliveries_failed"));
        assert!(output.contains("cache_hits_total"));
        assert!(output.contains("ws_connections"));
    }

    #[test]
    fn ws_gauge_never_underflows() {
        Metrics::ws_disconnected();
        Metrics::ws_connected();
        Metrics::ws_disconnected();
        Metrics::ws_disconnected();
        // Gauge stays at zero rather than wrapping.
        assert!(Metrics::ws_connection_count() < u64::MAX / 2);
    }
}
