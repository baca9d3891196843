// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Prometheus Metrics
//!
//! Counters and gauges for monitoring the chat server.

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Chat server metrics.
#[derive(Clone)]
pub struct ServerMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Current active WebSocket connections.
    pub connections_active: IntGauge,
    /// Handshake failures and timeouts.
    pub connection_errors: IntCounter,
    /// Identified sessions currently online.
    pub sessions_online: IntGauge,
    /// Sessions reaped for missing heartbeats.
    pub heartbeat_timeouts: IntCounter,

    // Packet metrics
    /// Frames received from clients.
    pub packets_received: IntCounter,
    /// Frames dropped as oversized, malformed or out of order.
    pub packets_rejected: IntCounter,
    /// Packets handed to a live connection.
    pub messages_routed: IntCounter,
    /// Packets diverted to an offline queue.
    pub messages_queued: IntCounter,
    /// Queued packets dropped to make room.
    pub offline_evictions: IntCounter,
    /// Packets currently waiting in offline queues.
    pub offline_queued: IntGauge,

    /// History store failures.
    pub history_errors: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let metric = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let metric = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl ServerMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let r = &registry;

        Ok(ServerMetrics {
            connections_total: counter(
                r,
                "nexchat_connections_total",
                "Total WebSocket connections accepted",
            )?,
            connections_active: gauge(
                r,
                "nexchat_connections_active",
                "Current active WebSocket connections",
            )?,
            connection_errors: counter(
                r,
                "nexchat_connection_errors_total",
                "Total connection errors",
            )?,
            sessions_online: gauge(r, "nexchat_sessions_online", "Identified sessions online")?,
            heartbeat_timeouts: counter(
                r,
                "nexchat_heartbeat_timeouts_total",
                "Sessions reaped for missing heartbeats",
            )?,
            packets_received: counter(
                r,
                "nexchat_packets_received_total",
                "Total packets received",
            )?,
            packets_rejected: counter(
                r,
                "nexchat_packets_rejected_total",
                "Total packets rejected",
            )?,
            messages_routed: counter(
                r,
                "nexchat_messages_routed_total",
                "Packets delivered to a live connection",
            )?,
            messages_queued: counter(
                r,
                "nexchat_messages_queued_total",
                "Packets diverted to an offline queue",
            )?,
            offline_evictions: counter(
                r,
                "nexchat_offline_evictions_total",
                "Queued packets evicted by overflow",
            )?,
            offline_queued: gauge(
                r,
                "nexchat_offline_queued",
                "Packets waiting in offline queues",
            )?,
            history_errors: counter(
                r,
                "nexchat_history_errors_total",
                "History store failures",
            )?,
            registry: Arc::new(registry),
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_lists_registered_metrics() {
        let metrics = ServerMetrics::new().unwrap();
        metrics.messages_routed.inc();
        metrics.sessions_online.set(3);

        let text = metrics.encode();
        assert!(text.contains("nexchat_messages_routed_total 1"));
        assert!(text.contains("nexchat_sessions_online 3"));
        assert!(text.contains("nexchat_history_errors_total 0"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = ServerMetrics::new().unwrap();
        let b = ServerMetrics::new().unwrap();
        a.packets_received.inc();
        assert_eq!(b.packets_received.get(), 0);
    }
}
