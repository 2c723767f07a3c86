use crate::harvest::model::{HarvestOptions, HarvestStatus};
use crate::harvest::service::HarvestService;
use log::{error, info};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Harvests every journal each `every` until `shutdown` fires.
/// The first pass starts immediately; a pass that overruns skips the missed ticks.
pub async fn run_schedule(service: HarvestService, every: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Scheduled harvesting every {}s.", every.as_secs());

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match service.harvest_all(HarvestOptions::default()).await {
            Ok(results) => {
                let succeeded = results
                    .iter()
                    .filter(|(_, r)| matches!(r, Ok(report) if report.status == HarvestStatus::Success))
                    .count();
                info!(
                    "Scheduled pass finished: {}/{} journal(s) succeeded.",
                    succeeded,
                    results.len()
                );
            }
            Err(e) => error!("Scheduled pass could not list journals: {}", e),
        }
    }
    info!("Scheduler stopped.");
}
