use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::errors::ServiceError;
use crate::services::shipping::{ShippingService, TrackingSweepSummary};

/// Background poller that periodically refreshes every non-terminal
/// shipment from its carrier. The safety net for shipments whose carriers
/// never deliver a webhook, and for webhooks lost in transit.
pub struct TrackingPoller {
    service: ShippingService,
    interval: Duration,
    last_sweep_tx: watch::Sender<Option<TrackingSweepSummary>>,
}

impl TrackingPoller {
    pub fn new(service: ShippingService, interval: Duration) -> Self {
        let (last_sweep_tx, _) = watch::channel(None);
        Self {
            service,
            interval,
            last_sweep_tx,
        }
    }

    /// Observer handle for the most recent sweep summary.
    pub fn last_sweep(&self) -> watch::Receiver<Option<TrackingSweepSummary>> {
        self.last_sweep_tx.subscribe()
    }

    /// Runs a single sweep. Exposed separately so the manual refresh
    /// endpoint and tests can trigger a sweep without the timer.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<TrackingSweepSummary, ServiceError> {
        let summary = self.service.update_all_tracking().await?;
        info!(
            total = summary.total,
            refreshed = summary.refreshed,
            failed = summary.failed,
            skipped = summary.skipped,
            "tracking sweep finished"
        );
        let _ = self.last_sweep_tx.send(Some(summary));
        Ok(summary)
    }

    /// Sweeps on a fixed interval until `shutdown` flips to true. A failed
    /// sweep is logged and the loop keeps its schedule.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "tracking poller started");
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; skip it so startup is not a sweep.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "tracking sweep failed");
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("tracking poller stopped");
    }
}
