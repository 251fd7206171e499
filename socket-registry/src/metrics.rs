//! Process-global counters for the registry and fanout paths.
//!
//! Incremented from the manager and relay listener, rendered in Prometheus
//! text format by whichever binary embeds the crate.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Metrics {
    /// Connections registered via on_open
    pub connections_opened: AtomicU64,
    /// Connections removed via on_close
    pub connections_closed: AtomicU64,
    /// Broadcasts published to a topic channel
    pub broadcasts_published: AtomicU64,
    /// Broadcasts skipped because the topic had no subscribers
    pub broadcasts_skipped: AtomicU64,
    /// Messages received from the topic channel pattern
    pub relay_messages_received: AtomicU64,
    /// Writes to local connections that succeeded (relay and direct)
    pub local_deliveries: AtomicU64,
    /// Writes to local connections that failed
    pub delivery_failures: AtomicU64,
    /// Direct sends where none of the client's sockets were local
    pub direct_sends_unreached: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            broadcasts_published: AtomicU64::new(0),
            broadcasts_skipped: AtomicU64::new(0),
            relay_messages_received: AtomicU64::new(0),
            local_deliveries: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            direct_sends_unreached: AtomicU64::new(0),
        }
    }

    pub fn inc_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_broadcast_published(&self) {
        self.broadcasts_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_broadcast_skipped(&self) {
        self.broadcasts_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_relay_message(&self) {
        self.relay_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_local_deliveries(&self, count: u64) {
        self.local_deliveries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_delivery_failures(&self, count: u64) {
        self.delivery_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_direct_send_unreached(&self) {
        self.direct_sends_unreached.fetch_add(1, Ordering::Relaxed);
    }

    /// Format all metrics as Prometheus text
    pub fn to_prometheus(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 8] = [
            (
                "socket_registry_connections_opened_total",
                "Connections registered on this instance",
                &self.connections_opened,
            ),
            (
                "socket_registry_connections_closed_total",
                "Connections closed on this instance",
                &self.connections_closed,
            ),
            (
                "socket_registry_broadcasts_published_total",
                "Broadcasts published to a topic channel",
                &self.broadcasts_published,
            ),
            (
                "socket_registry_broadcasts_skipped_total",
                "Broadcasts skipped because the topic had no subscribers",
                &self.broadcasts_skipped,
            ),
            (
                "socket_registry_relay_messages_total",
                "Messages received from the topic channel pattern",
                &self.relay_messages_received,
            ),
            (
                "socket_registry_local_deliveries_total",
                "Successful writes to connections on this instance",
                &self.local_deliveries,
            ),
            (
                "socket_registry_delivery_failures_total",
                "Failed writes to connections on this instance",
                &self.delivery_failures,
            ),
            (
                "socket_registry_direct_sends_unreached_total",
                "Direct sends where no socket of the client was local",
                &self.direct_sends_unreached,
            ),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value.load(Ordering::Relaxed)));
        }
        output
    }
}

/// Global metrics instance
pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_output_lists_every_counter() {
        let metrics = Metrics::new();
        metrics.inc_broadcast_skipped();
        metrics.add_local_deliveries(3);

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE socket_registry_broadcasts_skipped_total counter"));
        assert!(text.contains("socket_registry_broadcasts_skipped_total 1\n"));
        assert!(text.contains("socket_registry_local_deliveries_total 3\n"));
        assert_eq!(text.matches("# HELP").count(), 8);
    }
}
