use futures_util::future::join_all;

use crate::local::LocalConnections;
use crate::metrics::METRICS;
use crate::{ConnectionHandle, SocketId};

/// Outcome of a local delivery pass (relay or direct send).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Writes that completed.
    pub delivered: usize,
    /// Writes that returned an error.
    pub failed: usize,
    /// Socket ids not registered in this process (owned by another instance).
    pub not_local: usize,
    /// Local sockets skipped because they were no longer available.
    pub unavailable: usize,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }

    /// True if at least one socket of this process was written to.
    pub fn reached_local(&self) -> bool {
        self.attempted() > 0
    }
}

/// Resolve `socket_ids` against the local table, appending available
/// connections to `targets`. Misses are expected and only counted.
pub(crate) fn collect_local(
    local: &LocalConnections,
    socket_ids: &[SocketId],
    targets: &mut Vec<ConnectionHandle>,
    report: &mut DeliveryReport,
) {
    for socket_id in socket_ids {
        let Some(conn) = local.lookup(socket_id) else {
            report.not_local += 1;
            continue;
        };
        if !conn.is_available() {
            tracing::debug!(%socket_id, "Local socket found but is not available");
            report.unavailable += 1;
            continue;
        }
        targets.push(conn);
    }
}

/// Start every write at once and wait for all of them. A failing socket is
/// logged and counted without affecting its siblings.
pub(crate) async fn write_all(targets: &[ConnectionHandle], text: &str, report: &mut DeliveryReport) {
    let results = join_all(targets.iter().map(|conn| async move {
        let socket_id = conn.id();
        match conn.send(text).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(%socket_id, "Error sending to local socket: {}", e);
                false
            }
        }
    }))
    .await;

    let delivered = results.iter().filter(|ok| **ok).count();
    let failed = results.len() - delivered;
    report.delivered += delivered;
    report.failed += failed;

    METRICS.add_local_deliveries(delivered as u64);
    if failed > 0 {
        METRICS.add_delivery_failures(failed as u64);
    }
}
