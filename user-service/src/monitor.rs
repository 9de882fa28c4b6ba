use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::metrics::ProviderMetrics;
use crate::store::UserStore;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically probe the store and publish the result to the availability
/// gauge. The task exits as soon as the shutdown channel flips.
pub(crate) fn spawn_availability_monitor(
    store: Arc<dyn UserStore>,
    metrics: Arc<ProviderMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    probe(store.as_ref(), &metrics).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("availability monitor stopped");
                        return;
                    }
                }
            }
        }
    })
}

pub(crate) async fn probe(store: &dyn UserStore, metrics: &ProviderMetrics) {
    match store.check_availability().await {
        Ok(()) => metrics.set_store_availability(true),
        Err(err) => {
            warn!(error = %err, "store availability check failed");
            metrics.set_store_availability(false);
        }
    }
}
