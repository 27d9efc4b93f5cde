//! Watcher (C9): a persistent data-watch on `…/watch` that feeds the
//! Reconfigure Loop's queue, plus the filesystem sentinel watch that signals
//! clean shutdown (C11 leans on the same `notify` plumbing).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::coordinator::CoordinatorClient;
use crate::reconfigure::RunFlag;

/// Polling interval used in place of a real coordination-service watch
/// callback, which this crate's in-process `CoordinatorBackend` has no
/// transport to invoke asynchronously.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Watches `…/watch` and enqueues a reconfigure token on first invocation,
/// reconnection, or any observed change; logs and rearms on every other
/// event (§4.9).
#[tracing::instrument(skip_all)]
pub async fn watch_coordinator(coordinator: &CoordinatorClient, enqueue: mpsc::Sender<()>, cancel: CancellationToken) {
    let mut last_seen: Option<Vec<u8>> = None;
    let mut first = true;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(WATCH_POLL_INTERVAL) => {}
        }

        let current = coordinator.watch_value().await;
        let changed = first || current != last_seen;
        if changed {
            if enqueue.send(()).await.is_err() {
                tracing::warn!("reconfigure queue receiver dropped; stopping coordinator watch");
                return;
            }
        } else {
            tracing::trace!("coordinator watch tick observed no change");
        }
        last_seen = current;
        first = false;
    }
}

/// Watches the shutdown sentinel file; its deletion triggers `cancel`.
/// Mirrors the config watcher's `notify`-backed event channel (§6.1), with a
/// coarse poll fallback since a single missing-file event can be delivered
/// as `Remove` on some platforms and as a parent-directory `Modify` on
/// others.
#[tracing::instrument(skip_all)]
pub async fn watch_shutdown_sentinel(sentinel_path: PathBuf, run_flag: RunFlag, cancel: CancellationToken) {
    use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
    use tokio::sync::mpsc::unbounded_channel;

    let (raw_tx, mut raw_rx) = unbounded_channel::<notify::Event>();
    let watch_dir = sentinel_path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let mut watcher = match RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = raw_tx.send(event);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(err) => {
            tracing::error!(%err, "failed to create shutdown sentinel watcher; falling back to polling only");
            return poll_until_absent(&sentinel_path, &run_flag, &cancel).await;
        }
    };
    if let Err(err) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        tracing::error!(%err, dir = %watch_dir.display(), "failed to watch sentinel directory; falling back to polling only");
        return poll_until_absent(&sentinel_path, &run_flag, &cancel).await;
    }

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(WATCH_POLL_INTERVAL) => {}
            _ = raw_rx.recv() => {}
        }
        if tokio::fs::metadata(&sentinel_path).await.is_err() {
            tracing::info!(path = %sentinel_path.display(), "shutdown sentinel removed; initiating clean shutdown");
            run_flag.stop();
            cancel.cancel();
            return;
        }
    }
}

async fn poll_until_absent(sentinel_path: &Path, run_flag: &RunFlag, cancel: &CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(WATCH_POLL_INTERVAL) => {}
        }
        if tokio::fs::metadata(sentinel_path).await.is_err() {
            run_flag.stop();
            cancel.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InMemoryBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn watch_coordinator_enqueues_on_first_invocation() {
        let coordinator = CoordinatorClient::new(Arc::new(InMemoryBackend::new()));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move { watch_coordinator(&coordinator, tx, cancel_clone).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        assert!(rx.recv().await.is_some());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn watch_shutdown_sentinel_cancels_when_file_absent() {
        let cancel = CancellationToken::new();
        let run_flag = RunFlag::new();
        let missing = PathBuf::from("/nonexistent/ezfrontend.alive");
        let cancel_clone = cancel.clone();
        let run_flag_clone = run_flag.clone();
        let handle = tokio::spawn(async move { watch_shutdown_sentinel(missing, run_flag_clone, cancel_clone).await });
        handle.await.unwrap();
        assert!(cancel.is_cancelled());
        assert!(!run_flag.is_running());
    }
}
