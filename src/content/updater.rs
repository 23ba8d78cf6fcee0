use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::UpdateMode;
use crate::state::AppState;

use super::fileinfo::{diff, files_from_dirs, sort_by_path, FileInfo};
use super::{notifier, scanner};

/// Informs the server loop about a pending update. The loop signals
/// `proceed` when the updater may apply its changes and receives the
/// number of changed objects on `updated` once it has.
pub struct UpdateNotification {
    pub proceed: oneshot::Sender<()>,
    pub updated: oneshot::Receiver<u32>,
}

/// Receiving ends of the updater's coordination channels.
pub struct Updater {
    pub notifications: mpsc::Receiver<UpdateNotification>,
    pub errors: mpsc::Receiver<anyhow::Error>,
}

/// Spawns the updater configured by `update_mode`.
pub fn spawn(state: AppState, cancel: CancellationToken) -> Updater {
    let (notif_tx, notifications) = mpsc::channel(1);
    let (err_tx, errors) = mpsc::channel(8);

    match state.config.content.update_mode {
        UpdateMode::Scan => {
            tokio::spawn(scanner::run(state, notif_tx, err_tx, cancel));
        }
        UpdateMode::Notify => {
            tokio::spawn(notifier::run(state, notif_tx, err_tx, cancel));
        }
    }

    Updater {
        notifications,
        errors,
    }
}

/// One coordinated update cycle over an already computed diff: announce
/// the update, wait for the go-ahead, apply deletes then adds under the
/// graph's write lock, and report the change count back.
pub(crate) async fn run_cycle(
    state: &AppState,
    del: Vec<FileInfo>,
    add: Vec<FileInfo>,
    notif_tx: &mpsc::Sender<UpdateNotification>,
) {
    let (proceed_tx, proceed_rx) = oneshot::channel();
    let (updated_tx, updated_rx) = oneshot::channel();

    if notif_tx
        .send(UpdateNotification {
            proceed: proceed_tx,
            updated: updated_rx,
        })
        .await
        .is_err()
    {
        // server loop gone, shutdown in progress
        return;
    }
    if proceed_rx.await.is_err() {
        return;
    }

    let count = {
        let mut content = state.content.write().await;
        content.update(&del, &add).await
    };
    let _ = updated_tx.send(count);
}

/// Full scan: reads all files known to the graph and all files below the
/// music dirs, and computes which files must be deleted and added to make
/// the graph consistent with the disk.
pub async fn full_scan(state: &AppState) -> Result<(Vec<FileInfo>, Vec<FileInfo>)> {
    trace!("scanning ...");
    let dirs = &state.config.content.music_dirs;

    let mut cnt_files = { state.content.read().await.files_by_paths(dirs) };
    let mut disk_files = files_from_dirs(dirs).await?;
    sort_by_path(&mut cnt_files);
    sort_by_path(&mut disk_files);

    let changes = diff(&cnt_files, &disk_files);
    trace!(
        "scanning done, {} deletions and {} additions",
        changes.0.len(),
        changes.1.len()
    );
    Ok(changes)
}
