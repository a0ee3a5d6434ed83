//! Prometheus metrics (spec §6), reimplemented directly atop the
//! `prometheus` crate. `kumo-prometheus`'s `declare_metric!`-based
//! registries (see `proxy-server/src/metrics.rs`) are themselves a thin
//! wrapper over this same crate (`kumo_prometheus::prometheus`), so this
//! keeps the teacher's RAII session-metrics shape (`ProxySessionMetrics`)
//! while depending on the thing it wraps rather than the internal wrapper
//! crate itself (see DESIGN.md).

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pulsar_proxy_active_connections",
        "Current number of active client connections"
    )
    .expect("register pulsar_proxy_active_connections")
});

pub static NEW_CONNECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pulsar_proxy_new_connections",
        "Total number of new connections accepted"
    )
    .expect("register pulsar_proxy_new_connections")
});

pub static REJECTED_CONNECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pulsar_proxy_rejected_connections",
        "Total number of connections rejected by the admission layer"
    )
    .expect("register pulsar_proxy_rejected_connections")
});

pub static BINARY_OPS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pulsar_proxy_binary_ops",
        "Total number of binary protocol operations processed"
    )
    .expect("register pulsar_proxy_binary_ops")
});

pub static BINARY_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pulsar_proxy_binary_bytes",
        "Total number of bytes forwarded across all connections"
    )
    .expect("register pulsar_proxy_binary_bytes")
});

pub static TOPIC_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulsar_proxy_topic_bytes",
        "Bytes forwarded, labelled by topic",
        &["topic"]
    )
    .expect("register pulsar_proxy_topic_bytes")
});

pub static TOPIC_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulsar_proxy_topic_messages",
        "Messages forwarded, labelled by topic",
        &["topic"]
    )
    .expect("register pulsar_proxy_topic_messages")
});

/// Call once at service construction (spec §9 design note: "process-wide
/// counters ... initialised at service construction, not at static-init
/// time, to keep tests isolatable"). Forcing `Lazy` evaluation here, rather
/// than leaving it to whichever test happens to touch a metric first,
/// keeps registration order deterministic.
pub fn init() {
    Lazy::force(&ACTIVE_CONNECTIONS);
    Lazy::force(&NEW_CONNECTIONS);
    Lazy::force(&REJECTED_CONNECTIONS);
    Lazy::force(&BINARY_OPS);
    Lazy::force(&BINARY_BYTES);
    Lazy::force(&TOPIC_BYTES);
    Lazy::force(&TOPIC_MESSAGES);
}

pub fn record_topic_bytes(topic: &str, bytes: u64, msgs: u64) {
    TOPIC_BYTES.with_label_values(&[topic]).inc_by(bytes);
    TOPIC_MESSAGES.with_label_values(&[topic]).inc_by(msgs);
    BINARY_BYTES.inc_by(bytes);
}

/// RAII guard: increments `active_connections` on creation, decrements on
/// drop, mirroring `ProxySessionMetrics` in `proxy-server/src/metrics.rs`.
pub struct ConnectionMetricsGuard {
    _private: (),
}

impl ConnectionMetricsGuard {
    pub fn new() -> Self {
        NEW_CONNECTIONS.inc();
        ACTIVE_CONNECTIONS.inc();
        ConnectionMetricsGuard { _private: () }
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.dec();
    }
}

pub fn record_rejected_connection() {
    REJECTED_CONNECTIONS.inc();
}

pub fn record_op() {
    BINARY_OPS.inc();
}

/// Renders the current metric set in Prometheus text exposition format,
/// for whatever embeds the metrics HTTP endpoint (spec §1: out of scope
/// here, but the core exposes this so that endpoint can be a thin wrapper).
pub fn gather_text() -> anyhow::Result<String> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    encoder.encode(&metric_families, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_connections_tracks_guard_lifetime() {
        init();
        let before = ACTIVE_CONNECTIONS.get();
        let guard = ConnectionMetricsGuard::new();
        assert_eq!(ACTIVE_CONNECTIONS.get(), before + 1);
        drop(guard);
        assert_eq!(ACTIVE_CONNECTIONS.get(), before);
    }
}
