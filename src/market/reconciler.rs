use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::Marketplace;

/// Background task that periodically resolves settlements left `pending`
/// or `processing` for longer than `settle_after`.
///
/// Returns `None` without spawning when `interval` is zero.
pub fn spawn_reconciler(
    market: Arc<Marketplace>,
    interval: Duration,
    settle_after: Duration,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval.is_zero() {
        tracing::info!("Settlement reconciler disabled");
        return None;
    }
    let settle_after = chrono::Duration::from_std(settle_after).unwrap_or_else(|_| chrono::Duration::minutes(2));

    Some(tokio::spawn(async move {
        tracing::info!(
            interval_secs = interval.as_secs(),
            settle_after_secs = settle_after.num_seconds(),
            "Starting settlement reconciler"
        );
        loop {
            tokio::time::sleep(interval).await;

            match market.reconcile_stale(Utc::now() - settle_after).await {
                Ok(report) if report.checked > 0 => tracing::info!(
                    checked = report.checked,
                    completed = report.completed,
                    failed = report.failed,
                    still_pending = report.still_pending,
                    "Reconciled unconfirmed settlements"
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Settlement reconciliation pass failed"),
            }
        }
    }))
}
