//! Reconfigure Loop (C8): the single consumer of the reconfigure queue.
//! Every enqueue triggers a full pass over the latest coordination-service
//! state; duplicate enqueues during a pass are serviced once it completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cert_store::CertStore;
use crate::config::Config;
use crate::configurer::Configurer;
use crate::coordinator::CoordinatorClient;
use crate::static_handler::StaticContentHandler;
use crate::supervisor::Supervisor;

/// Flipped to `false` on a fatal (`CertStoreError`-class) failure; read by
/// `ping()` in the Control RPC Server (C10) and by `main` to decide whether
/// to drain and exit.
#[derive(Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReconfigureLoop {
    config: Arc<Config>,
    coordinator: Arc<CoordinatorClient>,
    cert_store: Arc<CertStore>,
    static_handler: Arc<StaticContentHandler>,
    run_flag: RunFlag,
}

impl ReconfigureLoop {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        coordinator: Arc<CoordinatorClient>,
        cert_store: Arc<CertStore>,
        static_handler: Arc<StaticContentHandler>,
        run_flag: RunFlag,
    ) -> Self {
        Self { config, coordinator, cert_store, static_handler, run_flag }
    }

    /// Runs until `cancel` fires, draining any pending enqueue before
    /// returning (§5: "drains the reconfigure queue" on shutdown).
    #[tracing::instrument(skip_all)]
    pub async fn run(
        &self,
        mut queue: mpsc::Receiver<()>,
        supervisor: &mut Supervisor<'_>,
        ssl_root: std::path::PathBuf,
        conf_path: std::path::PathBuf,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    while queue.try_recv().is_ok() {
                        self.run_pass(supervisor, &ssl_root, &conf_path).await;
                    }
                    return;
                }
                received = queue.recv() => {
                    if received.is_none() {
                        return;
                    }
                    // Collapse any further enqueues that arrived while we
                    // were dispatching this one; a pass always re-reads the
                    // latest state, so bursts are safe to coalesce.
                    while queue.try_recv().is_ok() {}
                    self.run_pass(supervisor, &ssl_root, &conf_path).await;
                }
            }
        }
    }

    async fn run_pass(&self, supervisor: &mut Supervisor<'_>, ssl_root: &std::path::Path, conf_path: &std::path::Path) {
        let configurer = Configurer::new(
            &self.config,
            &self.coordinator,
            &self.cert_store,
            &self.static_handler,
            ssl_root.to_path_buf(),
            conf_path.to_path_buf(),
        );
        match configurer.run().await {
            Ok(()) => {
                if let Err(err) = supervisor.reload().await {
                    tracing::warn!(%err, "worker reload signal failed; config already written, next pass retries");
                }
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(%err, "fatal error during reconfigure pass; stopping");
                self.run_flag.stop();
            }
            Err(err) => {
                tracing::warn!(%err, "transient error during reconfigure pass; will retry on next enqueue");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flag_starts_true_and_latches_false() {
        let flag = RunFlag::new();
        assert!(flag.is_running());
        flag.stop();
        assert!(!flag.is_running());
    }
}
