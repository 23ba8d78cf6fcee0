use anyhow::{anyhow, Result};
use notify::{RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

use crate::state::AppState;

use super::fileinfo::{dedup_by_path, diff, files_from_dirs, sort_by_path, FileInfo};
use super::updater::{run_cycle, UpdateNotification};

/// Notify updater: a recursive filesystem watcher on every music dir
/// feeds a mutex-guarded buffer of changed paths. Each interval tick
/// drains the buffer and turns the unique paths into an incremental diff.
pub(crate) async fn run(
    state: AppState,
    notif_tx: mpsc::Sender<UpdateNotification>,
    err_tx: mpsc::Sender<anyhow::Error>,
    cancel: CancellationToken,
) {
    trace!("running notifier ...");

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PathBuf>();
    let mut watcher =
        match notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                for path in event.paths {
                    let _ = event_tx.send(path);
                }
            }
            Err(e) => warn!("file watcher error: {e}"),
        }) {
            Ok(watcher) => watcher,
            Err(e) => {
                let _ = err_tx
                    .send(anyhow!("cannot create filesystem watcher: {e}"))
                    .await;
                return;
            }
        };
    for dir in &state.config.content.music_dirs {
        if let Err(e) = watcher.watch(dir, RecursiveMode::Recursive) {
            let _ = err_tx
                .send(anyhow!("cannot watch music dir '{}': {e}", dir.display()))
                .await;
            return;
        }
        trace!("watching '{}'", dir.display());
    }

    let buffer: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));

    let period = Duration::from_secs(state.config.content.update_interval);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let sema = Arc::new(Semaphore::new(1));
    let mut cycles: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            Some(path) = event_rx.recv() => {
                buffer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(path);
            }

            _ = ticker.tick() => {
                let Ok(permit) = sema.clone().try_acquire_owned() else {
                    trace!("update still running, skipping notify tick");
                    continue;
                };
                let state = state.clone();
                let notif_tx = notif_tx.clone();
                let err_tx = err_tx.clone();
                let buffer = buffer.clone();
                cycles.spawn(async move {
                    let _permit = permit;
                    let changes: Vec<PathBuf> = {
                        let mut buf = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                        std::mem::take(&mut *buf)
                    };
                    if changes.is_empty() {
                        trace!("no changes to process");
                        return;
                    }
                    match process_changes(&state, changes).await {
                        Ok((del, add)) => run_cycle(&state, del, add, &notif_tx).await,
                        Err(e) => {
                            error!("processing filesystem changes failed: {e:#}");
                            let _ = err_tx.send(e).await;
                        }
                    }
                });
            }

            Some(_) = cycles.join_next() => {}

            _ = cancel.cancelled() => {
                while cycles.join_next().await.is_some() {}
                trace!("notifier stopped");
                return;
            }
        }
    }
}

/// Expands the changed paths into a disk-side and a content-side file set
/// and diffs them: directories are enumerated recursively, single files
/// are classified by mime type, and everything the graph knows below a
/// changed path goes to the content side.
async fn process_changes(
    state: &AppState,
    changes: Vec<PathBuf>,
) -> Result<(Vec<FileInfo>, Vec<FileInfo>)> {
    trace!("processing {} filesystem notifications ...", changes.len());

    let unique: BTreeSet<PathBuf> = changes.into_iter().collect();
    let mut fi_cnt: Vec<FileInfo> = Vec::new();
    let mut fi_disk: Vec<FileInfo> = Vec::new();

    for path in unique {
        match tokio::fs::metadata(&path).await {
            Ok(md) if md.is_dir() => {
                match files_from_dirs(std::slice::from_ref(&path)).await {
                    Ok(files) => fi_disk.extend(files),
                    Err(e) => warn!("cannot enumerate '{}': {e:#}", path.display()),
                }
            }
            Ok(md) if md.is_file() => {
                if let Some(fi) = FileInfo::from_disk(&path, &md) {
                    fi_disk.push(fi);
                }
            }
            // the path vanished again; the content side covers the deletion
            _ => {}
        }
        fi_cnt.extend(
            state
                .content
                .read()
                .await
                .files_by_paths(std::slice::from_ref(&path)),
        );
    }

    sort_by_path(&mut fi_cnt);
    dedup_by_path(&mut fi_cnt);
    sort_by_path(&mut fi_disk);
    dedup_by_path(&mut fi_disk);

    Ok(diff(&fi_cnt, &fi_disk))
}
