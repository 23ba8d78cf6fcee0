use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::state::AppState;

use super::updater::{full_scan, run_cycle, UpdateNotification};

/// Scan updater: regularly diffs the music dirs against the graph and
/// applies the differences. A single-slot semaphore ensures at most one
/// update runs at any time; a tick that finds it taken is skipped.
pub(crate) async fn run(
    state: AppState,
    notif_tx: mpsc::Sender<UpdateNotification>,
    err_tx: mpsc::Sender<anyhow::Error>,
    cancel: CancellationToken,
) {
    trace!("running scanner ...");

    let period = Duration::from_secs(state.config.content.update_interval);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let sema = Arc::new(Semaphore::new(1));
    let mut cycles: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Ok(permit) = sema.clone().try_acquire_owned() else {
                    trace!("update still running, skipping scan tick");
                    continue;
                };
                let state = state.clone();
                let notif_tx = notif_tx.clone();
                let err_tx = err_tx.clone();
                cycles.spawn(async move {
                    let _permit = permit;
                    match full_scan(&state).await {
                        Ok((del, add)) => run_cycle(&state, del, add, &notif_tx).await,
                        Err(e) => {
                            error!("scan failed: {e:#}");
                            let _ = err_tx.send(e).await;
                        }
                    }
                });
            }

            Some(_) = cycles.join_next() => {}

            _ = cancel.cancelled() => {
                // finish any in-flight cycle before returning
                while cycles.join_next().await.is_some() {}
                trace!("scanner stopped");
                return;
            }
        }
    }
}
