//! TLS listener setup and per-connection method dispatch.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use rustls::RootCertStore;
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::cert_store::CertStore;
use crate::config::Config;
use crate::coordinator::CoordinatorClient;
use crate::db::{self, BookkeepingRow, DbPool};
use crate::error::{FrontendError, Result};
use crate::reconfigure::RunFlag;
use crate::registration::Registration;
use crate::rpc::codec::{Request, Response, ResponseValue, StaticContentItem, read_frame, write_frame};
use crate::static_handler::{StaticContentHandler, StaticContentUpload};

/// Builds the server-side `rustls::ServerConfig` requiring a client
/// certificate signed by the configured CA (§4.10). Caller is responsible
/// for installing a crypto provider (`aws_lc_rs`) once at process startup.
pub fn build_server_tls_config(rpc: &crate::config::RpcConfig) -> Result<rustls::ServerConfig> {
    let certs = load_certs(Path::new(&rpc.cert_path))?;
    let key = load_key(Path::new(&rpc.key_path))?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(Path::new(&rpc.ca_path))? {
        roots
            .add(cert)
            .map_err(|e| FrontendError::BadRequest(format!("invalid CA certificate: {e}")))?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| FrontendError::BadRequest(format!("building client cert verifier: {e}")))?;

    rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| FrontendError::BadRequest(format!("invalid server cert/key pair: {e}")))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let bytes = std::fs::read(path)?;
    rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| FrontendError::BadRequest(format!("parsing certs in {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let bytes = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut bytes.as_slice())
        .map_err(|e| FrontendError::BadRequest(format!("parsing key in {}: {e}", path.display())))?
        .ok_or_else(|| FrontendError::BadRequest(format!("no private key found in {}", path.display())))
}

/// Extracts the leaf certificate's subject common name via `openssl`'s X.509
/// parser (rustls itself only handles the handshake, not certificate field
/// introspection).
fn peer_common_name(certs: &[CertificateDer<'_>]) -> Option<String> {
    let leaf = certs.first()?;
    let x509 = openssl::x509::X509::from_der(leaf.as_ref()).ok()?;
    x509.subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_millis() as i64
}

pub struct RpcServer {
    config: Arc<Config>,
    coordinator: Arc<CoordinatorClient>,
    cert_store: Arc<CertStore>,
    static_handler: Arc<StaticContentHandler>,
    db_pool: Option<DbPool>,
    run_flag: RunFlag,
    reconfigure_tx: tokio::sync::mpsc::Sender<()>,
    allowed_cn: Regex,
}

impl RpcServer {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        coordinator: Arc<CoordinatorClient>,
        cert_store: Arc<CertStore>,
        static_handler: Arc<StaticContentHandler>,
        db_pool: Option<DbPool>,
        run_flag: RunFlag,
        reconfigure_tx: tokio::sync::mpsc::Sender<()>,
    ) -> Result<Self> {
        let allowed_cn = Regex::new(&config.rpc.allowed_cn_pattern)
            .map_err(|e| FrontendError::BadRequest(format!("invalid allowed_cn_pattern: {e}")))?;
        Ok(Self { config, coordinator, cert_store, static_handler, db_pool, run_flag, reconfigure_tx, allowed_cn })
    }

    #[tracing::instrument(skip_all)]
    pub async fn serve(self: Arc<Self>, tls_config: rustls::ServerConfig, cancel: CancellationToken) -> Result<()> {
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let addr = format!("{}:{}", self.config.rpc.bind, self.config.rpc.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr, "control rpc server listening");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let this = Arc::clone(&self);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Err(err) = this.handle_connection(stream, acceptor, peer_addr).await {
                            tracing::warn!(%err, %peer_addr, "rpc connection ended with an error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, acceptor: TlsAcceptor, peer_addr: std::net::SocketAddr) -> Result<()> {
        let mut tls_stream = acceptor.accept(stream).await?;
        let (_, conn) = tls_stream.get_ref();
        let peer_certs = conn.peer_certificates().map(<[_]>::to_vec).unwrap_or_default();
        let cn = peer_common_name(&peer_certs);

        let Some(cn) = cn else {
            tracing::warn!(%peer_addr, "rejecting connection with no peer certificate common name");
            return Err(FrontendError::BadRequest("missing peer certificate common name".into()));
        };
        if !self.allowed_cn.is_match(&cn) {
            tracing::warn!(%peer_addr, cn, pattern = %self.allowed_cn.as_str(), "rejecting connection: cn does not match allowed pattern");
            return Err(FrontendError::BadRequest(format!("cn {cn} does not match allowed pattern")));
        }

        loop {
            let payload = match read_frame(&mut tls_stream).await {
                Ok(p) => p,
                Err(_) => return Ok(()),
            };
            let request: Request = serde_json::from_slice(&payload)
                .map_err(|e| FrontendError::BadRequest(format!("malformed request: {e}")))?;
            let response = self.dispatch(request).await;
            let bytes = serde_json::to_vec(&response).expect("Response always serializes");
            write_frame(&mut tls_stream, &bytes).await?;
        }
    }

    async fn bump_and_record(&self, method: &str, prefix_or_server: Option<&str>) {
        self.coordinator
            .with_lock(|locked| async move {
                locked.bump_watch().await;
            })
            .await;
        if self.reconfigure_tx.send(()).await.is_err() {
            tracing::warn!("reconfigure queue receiver dropped while rpc server tried to enqueue");
        }
        if let Some(pool) = &self.db_pool {
            if let Err(err) =
                db::record(pool, BookkeepingRow { method, prefix_or_server, watch_bumped_at_millis: now_millis() }).await
            {
                tracing::warn!(%err, method, "bookkeeping write failed; call already committed");
            }
        }
    }

    #[tracing::instrument(skip(self, request))]
    async fn dispatch(&self, request: Request) -> Response {
        let result = self.handle(request).await;
        Response::from_result(result)
    }

    async fn handle(&self, request: Request) -> Result<ResponseValue> {
        match request {
            Request::Ping => Ok(ResponseValue::Bool(self.run_flag.is_running())),

            Request::AddUpstreamServerRegistration { registration } => {
                registration.validate()?;
                let conflict = self
                    .coordinator
                    .all_registrations()
                    .await
                    .into_iter()
                    .any(|r| r.user_facing_url_prefix == registration.user_facing_url_prefix && r.upstream_path != registration.upstream_path);
                if conflict {
                    return Err(FrontendError::RegistrationInvalid(format!(
                        "prefix {} already registered with a different upstreamPath",
                        registration.user_facing_url_prefix
                    )));
                }
                let prefix = registration.user_facing_url_prefix.clone();
                if !self.coordinator.add_registration(&registration).await {
                    return Err(FrontendError::RegistrationInvalid(format!("node for {prefix} already exists")));
                }
                self.bump_and_record("addUpstreamServerRegistration", Some(&prefix)).await;
                Ok(ResponseValue::Unit)
            }

            Request::RemoveUpstreamServerRegistration { registration } => {
                registration.validate()?;
                let node_name = registration.node_name();
                if !self.coordinator.remove_registration(&node_name).await {
                    return Err(FrontendError::RegistrationNotFound(node_name));
                }
                let server_name = registration.server_name().to_string();
                let still_shared = self
                    .coordinator
                    .all_registrations()
                    .await
                    .iter()
                    .any(|r| r.server_name() == server_name);
                if !still_shared {
                    self.coordinator.remove_ssl_node(&server_name).await;
                    self.cert_store.remove(&server_name).await.ok();
                }
                self.bump_and_record("removeUpstreamServerRegistration", Some(&server_name)).await;
                Ok(ResponseValue::Unit)
            }

            Request::RemoveReverseProxiedPath { prefix } => {
                let node_prefix = crate::b62::encode(&prefix);
                let removed = self.coordinator.remove_registrations_with_node_prefix(&format!("{node_prefix}_")).await;
                if removed > 0 {
                    self.bump_and_record("removeReverseProxiedPath", Some(&prefix)).await;
                }
                Ok(ResponseValue::Unit)
            }

            Request::IsUpstreamServerRegistered { registration } => {
                let node_name = registration.node_name();
                let registered = self.coordinator.all_registrations().await.iter().any(|r| r.node_name() == node_name);
                Ok(ResponseValue::Bool(registered))
            }

            Request::IsReverseProxiedPathRegistered { prefix } => {
                let registered = self.coordinator.all_registrations().await.iter().any(|r| r.user_facing_url_prefix == prefix);
                Ok(ResponseValue::Bool(registered))
            }

            Request::GetAllUpstreamServerRegistrations => {
                Ok(ResponseValue::Registrations(self.coordinator.all_registrations().await))
            }

            Request::GetRegistrationsForProxiedPath { prefix } => {
                let matches: Vec<Registration> =
                    self.coordinator.all_registrations().await.into_iter().filter(|r| r.user_facing_url_prefix == prefix).collect();
                Ok(ResponseValue::Registrations(matches))
            }

            Request::GetRegistrationsForApp { app_name } => {
                let matches: Vec<Registration> =
                    self.coordinator.all_registrations().await.into_iter().filter(|r| r.app_name == app_name).collect();
                Ok(ResponseValue::Registrations(matches))
            }

            Request::AddServerCerts { server_name, cert_pem, key_pem } => {
                if server_name.is_empty() || cert_pem.is_empty() || key_pem.is_empty() {
                    return Err(FrontendError::BadRequest("serverName/certPEM/keyPEM must be non-empty".into()));
                }
                self.cert_store.put(&server_name, &cert_pem, &key_pem).await?;
                self.coordinator.ensure_ssl_node(&server_name).await;
                self.bump_and_record("addServerCerts", Some(&server_name)).await;
                Ok(ResponseValue::Unit)
            }

            Request::RemoveServerCerts { server_name } => {
                self.cert_store.remove(&server_name).await?;
                self.coordinator.remove_ssl_node(&server_name).await;
                self.bump_and_record("removeServerCerts", Some(&server_name)).await;
                Ok(ResponseValue::Unit)
            }

            Request::IsServerCertPresent { server_name } => {
                Ok(ResponseValue::Bool(self.cert_store.exists(&server_name).await?))
            }

            Request::AddStaticContent { items } => {
                let prefixes: Vec<String> = items.iter().map(|i| i.prefix.clone()).collect();
                let uploads = items.into_iter().map(|i| StaticContentUpload { prefix: i.prefix, bytes: i.bytes }).collect();
                self.static_handler.add_static_content(uploads).await?;
                self.bump_and_record("addStaticContent", prefixes.first().map(String::as_str)).await;
                Ok(ResponseValue::Unit)
            }

            Request::RemoveStaticContent { prefixes } => {
                let first = prefixes.first().cloned();
                self.static_handler.remove_static_content(prefixes).await?;
                self.bump_and_record("removeStaticContent", first.as_deref()).await;
                Ok(ResponseValue::Unit)
            }

            Request::IsStaticContentPresentForProxiedPath { prefix } => {
                Ok(ResponseValue::Bool(self.static_handler.contains_prefix(&prefix).await))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InMemoryBackend;
    use crate::registration::{AuthOperation, ContentServiceType};
    use crate::static_store::{ChunkedRowStore, StaticContentStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct NoopChunkedStore;

    #[async_trait]
    impl ChunkedRowStore for NoopChunkedStore {
        async fn put_column(&self, _key: &str, _column: &str, _value: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn get_column(&self, _key: &str, _column: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn delete_columns(&self, _key: &str, _columns: &[String]) -> Result<()> {
            Ok(())
        }
        async fn scan_hashes(&self) -> Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct NoopRowStore {
        rows: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl crate::cert_store::BlobRowStore for NoopRowStore {
        async fn put_row(&self, _table: &str, key: &str, _qualifier: &str, value: Vec<u8>) -> Result<()> {
            self.rows.lock().await.insert(key.to_string(), value);
            Ok(())
        }
        async fn get_row(&self, _table: &str, key: &str, _qualifier: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.rows.lock().await.get(key).cloned())
        }
        async fn delete_row(&self, _table: &str, key: &str) -> Result<()> {
            self.rows.lock().await.remove(key);
            Ok(())
        }
        async fn row_exists(&self, _table: &str, key: &str) -> Result<bool> {
            Ok(self.rows.lock().await.contains_key(key))
        }
    }

    fn sample_config() -> Config {
        toml::from_str(
            r#"
            [server]
            external_hostname = "example.com"
            internal_hostname = "internal.example.com"
            [rpc]
            cert_path = "cert.pem"
            key_path = "key.pem"
            ca_path = "ca.pem"
            allowed_cn_pattern = "^rpc-client$"
            [blob_store]
            host = "localhost"
            port = 9090
            user = "svc"
            password = "secret"
            "#,
        )
        .unwrap()
    }

    fn sample_registration(prefix: &str) -> Registration {
        Registration {
            user_facing_url_prefix: prefix.into(),
            upstream_host_and_port: "127.0.0.1:8443".into(),
            upstream_path: "/bar".into(),
            timeout: 30,
            timeout_tries: 2,
            upload_file_size: 0,
            sticky: false,
            disable_chunked_transfer_encoding: false,
            auth_operations: [AuthOperation::UserInfo].into_iter().collect(),
            content_service_type: ContentServiceType::Proxy,
            validate_upstream_connection: false,
            app_name: "app".into(),
            unknown_fields: Vec::new(),
        }
    }

    fn make_server() -> RpcServer {
        let config = Arc::new(sample_config());
        let coordinator = Arc::new(CoordinatorClient::new(Arc::new(InMemoryBackend::new())));
        let cert_store = Arc::new(CertStore::new(Arc::new(NoopRowStore::default()), None));
        let static_handler = Arc::new(StaticContentHandler::new(
            StaticContentStore::new(Box::new(NoopChunkedStore), 1024),
            std::env::temp_dir(),
            None,
        ));
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        RpcServer::new(config, coordinator, cert_store, static_handler, None, RunFlag::new(), tx).unwrap()
    }

    #[tokio::test]
    async fn ping_reports_run_flag() {
        let server = make_server();
        let value = server.handle(Request::Ping).await.unwrap();
        assert!(matches!(value, ResponseValue::Bool(true)));
    }

    #[tokio::test]
    async fn add_then_is_registered_round_trips() {
        let server = make_server();
        let r = sample_registration("app.example.com/foo");
        server.handle(Request::AddUpstreamServerRegistration { registration: r.clone() }).await.unwrap();
        let value = server.handle(Request::IsUpstreamServerRegistered { registration: r }).await.unwrap();
        assert!(matches!(value, ResponseValue::Bool(true)));
    }

    #[tokio::test]
    async fn add_rejects_conflicting_upstream_path_for_same_prefix() {
        let server = make_server();
        let a = sample_registration("app.example.com/foo");
        let mut b = a.clone();
        b.upstream_path = "/other".into();
        server.handle(Request::AddUpstreamServerRegistration { registration: a }).await.unwrap();
        let err = server.handle(Request::AddUpstreamServerRegistration { registration: b }).await.unwrap_err();
        assert!(matches!(err, FrontendError::RegistrationInvalid(_)));
    }

    #[tokio::test]
    async fn remove_unregistered_returns_not_found() {
        let server = make_server();
        let r = sample_registration("app.example.com/foo");
        let err = server.handle(Request::RemoveUpstreamServerRegistration { registration: r }).await.unwrap_err();
        assert!(matches!(err, FrontendError::RegistrationNotFound(_)));
    }

    #[tokio::test]
    async fn add_server_certs_rejects_empty_arguments() {
        let server = make_server();
        let err = server
            .handle(Request::AddServerCerts { server_name: String::new(), cert_pem: "x".into(), key_pem: "y".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, FrontendError::BadRequest(_)));
    }

    fn make_tar(path_in_archive: &str, contents: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_cksum();
        builder.append_data(&mut header, path_in_archive, contents).unwrap();
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn static_content_presence_tracks_add_and_remove() {
        let server = make_server();
        let archive = make_tar("index.html", b"<html></html>");
        let absent =
            server.handle(Request::IsStaticContentPresentForProxiedPath { prefix: "app/foo".into() }).await.unwrap();
        assert!(matches!(absent, ResponseValue::Bool(false)));

        server
            .handle(Request::AddStaticContent { items: vec![StaticContentItem { prefix: "app/foo".into(), bytes: archive }] })
            .await
            .unwrap();
        let present =
            server.handle(Request::IsStaticContentPresentForProxiedPath { prefix: "app/foo".into() }).await.unwrap();
        assert!(matches!(present, ResponseValue::Bool(true)));

        server.handle(Request::RemoveStaticContent { prefixes: vec!["app/foo".into()] }).await.unwrap();
        let gone =
            server.handle(Request::IsStaticContentPresentForProxiedPath { prefix: "app/foo".into() }).await.unwrap();
        assert!(matches!(gone, ResponseValue::Bool(false)));
    }
}
