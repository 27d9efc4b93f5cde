//! Hot-reload watch on the config file.
//!
//! Mirrors this codebase's established policy for settings that cannot
//! safely change while the process is running: detect the diff, log that
//! live reload isn't supported, and keep serving with the original value
//! (§9 Design Notes, ambient Open Question).

use std::{path::PathBuf, sync::Arc};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc::unbounded_channel, watch};
use tracing::{error, info, warn};

use super::{loader::load_config, types::Config};

/// Watches the config file for modifications and publishes reloaded values
/// on the given watch channel. Settings that cannot be changed live
/// (`rpc.port`, `rpc.bind`, `db.path`) are diffed against the initial value
/// and a warning is logged instead of applying the change.
pub async fn watch_config_file(path: PathBuf, tx: watch::Sender<Arc<Config>>) {
    let (raw_tx, mut raw_rx) = unbounded_channel::<Event>();
    let initial = tx.borrow().clone();

    let mut watcher = match RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = raw_tx.send(event);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("failed to create config file watcher: {e}");
            return;
        }
    };

    if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
        error!("failed to watch config file {}: {e}", path.display());
        return;
    }

    while let Some(event) = raw_rx.recv().await {
        if !matches!(event.kind, EventKind::Modify(_)) {
            continue;
        }
        info!("config file modified, reloading");
        match load_config(&path).await {
            Ok(new_config) => {
                warn_on_unsupported_live_change(&initial, &new_config);
                let _ = tx.send(Arc::new(new_config));
                info!("config reloaded");
            }
            Err(e) => error!("failed to reload config: {e}"),
        }
    }
}

fn warn_on_unsupported_live_change(initial: &Config, new: &Config) {
    if new.rpc.port != initial.rpc.port {
        warn!(
            "rpc port change detected in config file; changing the listen port while running is not supported, continuing on {}",
            initial.rpc.port
        );
    }
    if new.rpc.bind != initial.rpc.bind {
        warn!(
            "rpc bind address change detected in config file; continuing on {}",
            initial.rpc.bind
        );
    }
    if new.db.path != initial.db.path {
        warn!(
            "db path change detected in config file; the running database connection is not reopened, continuing with {}",
            initial.db.path
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    const SAMPLE: &str = r#"
        [server]
        external_hostname = "example.com"
        internal_hostname = "internal.example.com"
        default_server_name = "example.com"
        [rpc]
        cert_path = "cert.pem"
        key_path = "key.pem"
        ca_path = "ca.pem"
        allowed_cn_pattern = ".*"
        [blob_store]
        host = "localhost"
        port = 9090
        user = "svc"
        password = "secret"
        "#;

    /// Mirrors how `run()` spawns this watcher: raced against a
    /// `CancellationToken` in `tokio::select!`, since `watch_config_file`
    /// itself never observes cancellation.
    #[tokio::test]
    async fn reloads_on_write_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ezfrontend.toml");
        tokio::fs::write(&path, SAMPLE).await.unwrap();

        let initial = load_config(&path).await.unwrap();
        let (tx, mut rx) = watch::channel(Arc::new(initial));
        let cancel = CancellationToken::new();

        let watch_path = path.clone();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel_clone.cancelled() => {}
                () = watch_config_file(watch_path, tx) => {}
            }
        });

        // give the watcher time to register before mutating the file.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let updated = SAMPLE.replace("example.com", "updated.example.com");
        tokio::fs::write(&path, updated).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if rx.changed().await.is_ok() && rx.borrow().server.external_hostname == "updated.example.com" {
                    break;
                }
            }
        })
        .await
        .expect("config reload observed");

        cancel.cancel();
        handle.await.unwrap();
    }
}
