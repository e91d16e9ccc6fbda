//! Delivery metrics.
//!
//! Instruments are taken from the global OpenTelemetry meter provider, which
//! is a no-op until the host installs one. [`render_prometheus`] exposes a
//! hub's own counters in Prometheus text format without any provider.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::fmt::Write;
use std::sync::OnceLock;

use crate::hub::StatsSnapshot;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("cryptachat-relay"))
}

/// Counter for frames queued onto a client connection.
pub fn frames_delivered() -> Counter<u64> {
    meter()
        .u64_counter("relay.frames.delivered")
        .with_description("Frames queued onto a client connection")
        .with_unit("frame")
        .build()
}

/// Counter for pushes that never reached a client queue.
pub fn frames_dropped() -> Counter<u64> {
    meter()
        .u64_counter("relay.frames.dropped")
        .with_description("Pushes dropped before reaching a client queue")
        .with_unit("frame")
        .build()
}

/// Counter for connections replaced by a newer one for the same user.
pub fn connections_superseded() -> Counter<u64> {
    meter()
        .u64_counter("relay.connections.superseded")
        .with_description("Connections closed because the user reconnected")
        .with_unit("connection")
        .build()
}

/// Gauge for registered push connections.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("relay.connections.active")
        .with_description("Current number of registered push connections")
        .with_unit("connection")
        .build()
}

pub fn record_delivered(kind: &'static str) {
    frames_delivered().add(1, &[KeyValue::new("kind", kind)]);
}

pub fn record_drop(reason: &'static str) {
    frames_dropped().add(1, &[KeyValue::new("reason", reason)]);
}

pub fn record_superseded() {
    connections_superseded().add(1, &[]);
}

pub fn record_active_connections(count: i64) {
    connections_active().record(count, &[]);
}

/// Render hub counters and the online gauge in Prometheus text format.
pub fn render_prometheus(stats: &StatsSnapshot, online: usize) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# HELP cryptachat_online_users Users with a registered push connection.");
    let _ = writeln!(out, "# TYPE cryptachat_online_users gauge");
    let _ = writeln!(out, "cryptachat_online_users {online}");

    let _ = writeln!(out, "# HELP cryptachat_frames_delivered_total Frames queued onto a client connection.");
    let _ = writeln!(out, "# TYPE cryptachat_frames_delivered_total counter");
    let _ = writeln!(out, "cryptachat_frames_delivered_total {}", stats.delivered);

    let _ = writeln!(out, "# HELP cryptachat_frames_dropped_total Pushes dropped before reaching a client queue.");
    let _ = writeln!(out, "# TYPE cryptachat_frames_dropped_total counter");
    for (reason, value) in [
        ("offline", stats.dropped_offline),
        ("queue_full", stats.dropped_queue_full),
        ("queue_closed", stats.dropped_queue_closed),
        ("serialize_failed", stats.dropped_serialize_failed),
        ("hub_saturated", stats.dropped_hub_saturated),
        ("hub_stopped", stats.dropped_hub_stopped),
    ] {
        let _ = writeln!(out, "cryptachat_frames_dropped_total{{reason=\"{reason}\"}} {value}");
    }

    let _ = writeln!(out, "# HELP cryptachat_connections_total Connection lifecycle events.");
    let _ = writeln!(out, "# TYPE cryptachat_connections_total counter");
    for (event, value) in [
        ("registered", stats.registered),
        ("superseded", stats.superseded),
        ("unregistered", stats.unregistered),
    ] {
        let _ = writeln!(out, "cryptachat_connections_total{{event=\"{event}\"}} {value}");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_provider_is_harmless() {
        record_delivered("message");
        record_drop("offline");
        record_superseded();
        record_active_connections(3);
    }

    #[test]
    fn test_render_prometheus() {
        let stats = StatsSnapshot {
            delivered: 12,
            dropped_offline: 4,
            dropped_queue_full: 1,
            registered: 7,
            ..StatsSnapshot::default()
        };
        let text = render_prometheus(&stats, 2);

        assert!(text.contains("cryptachat_online_users 2\n"));
        assert!(text.contains("cryptachat_frames_delivered_total 12\n"));
        assert!(text.contains("cryptachat_frames_dropped_total{reason=\"offline\"} 4\n"));
        assert!(text.contains("cryptachat_frames_dropped_total{reason=\"queue_full\"} 1\n"));
        assert!(text.contains("cryptachat_connections_total{event=\"registered\"} 7\n"));
    }
}
