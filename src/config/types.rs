//! Configuration data types for the control plane.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;

/// Root configuration, loaded from the TOML file named on the command line.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub rpc: RpcConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    pub blob_store: BlobStoreConfig,
    /// Optional private key used to HMAC-sign PKCS#12 passwords for
    /// tamper-evidence (§4.2). When absent, the password falls back to
    /// base64(salt + serverName).
    #[serde(default)]
    pub pkcs12_signing_key: Option<Arc<SecretString>>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_sentinel_path")]
    pub shutdown_sentinel_path: String,
}

impl PartialEq for Config {
    fn eq(&self, other: &Self) -> bool {
        self.server == other.server
            && self.rpc == other.rpc
            && self.db == other.db
            && self.paths == other.paths
            && self.blob_store == other.blob_store
            && match (&self.pkcs12_signing_key, &other.pkcs12_signing_key) {
                (Some(a), Some(b)) => a.expose_secret() == b.expose_secret(),
                (None, None) => true,
                _ => false,
            }
            && self.log_level == other.log_level
            && self.shutdown_sentinel_path == other.shutdown_sentinel_path
    }
}

/// Externally-visible listener configuration (§6).
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    pub external_hostname: String,
    pub internal_hostname: String,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    pub default_server_name: Option<String>,
    #[serde(default)]
    pub use_proxy_protocol: bool,
    #[serde(default = "default_max_ca_depth")]
    pub max_ca_depth: u32,
    #[serde(default = "default_max_static_mb")]
    pub max_static_content_mb: u32,
    #[serde(default = "default_chunk_mb")]
    pub static_chunk_mb: u32,
    pub ssl_crl_file: Option<String>,
    #[serde(default = "default_ngx_workers")]
    pub ngx_workers: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            external_hostname: "localhost".into(),
            internal_hostname: "localhost".into(),
            https_port: default_https_port(),
            http_port: default_http_port(),
            default_server_name: None,
            use_proxy_protocol: false,
            max_ca_depth: default_max_ca_depth(),
            max_static_content_mb: default_max_static_mb(),
            static_chunk_mb: default_chunk_mb(),
            ssl_crl_file: None,
            ngx_workers: default_ngx_workers(),
        }
    }
}

fn default_https_port() -> u16 {
    443
}

fn default_http_port() -> u16 {
    80
}

fn default_max_ca_depth() -> u32 {
    2
}

fn default_max_static_mb() -> u32 {
    100
}

fn default_chunk_mb() -> u32 {
    5
}

fn default_ngx_workers() -> u32 {
    std::thread::available_parallelism().map_or(2, |n| n.get().max(2) as u32)
}

/// The Control RPC Server's (C10) mutually-authenticated TLS listener configuration.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Path to this instance's TLS certificate (PEM).
    pub cert_path: String,
    /// Path to this instance's TLS private key (PEM).
    pub key_path: String,
    /// Path to the CA bundle used to verify client certificates.
    pub ca_path: String,
    /// Regular expression a peer certificate's common name must match.
    pub allowed_cn_pattern: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            port: default_rpc_port(),
            bind: default_bind(),
            cert_path: "./rpc_cert.pem".into(),
            key_path: "./rpc_key.pem".into(),
            ca_path: "./rpc_ca.pem".into(),
            allowed_cn_pattern: ".*".into(),
        }
    }
}

fn default_rpc_port() -> u16 {
    2020
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_sentinel_path() -> String {
    "./ezfrontend.alive".into()
}

/// Local `SQLite` bookkeeping store configuration (A4).
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_db_enable")]
    pub enable: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            enable: default_db_enable(),
        }
    }
}

fn default_db_path() -> String {
    "./ezfrontend.db".into()
}

const fn default_db_enable() -> bool {
    true
}

/// On-disk layout roots, all resolved relative to the config file (§4.7).
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PathsConfig {
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Internal mTLS cert/key/CA triple used for the upstream connection
    /// when a registration asserts `validateUpstreamConnection` (§4.6 step 4).
    #[serde(default = "default_internal_cert")]
    pub internal_cert_path: String,
    #[serde(default = "default_internal_key")]
    pub internal_key_path: String,
    #[serde(default = "default_internal_ca")]
    pub internal_ca_path: String,
    #[serde(default = "default_favicon")]
    pub favicon_path: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            internal_cert_path: default_internal_cert(),
            internal_key_path: default_internal_key(),
            internal_ca_path: default_internal_ca(),
            favicon_path: default_favicon(),
        }
    }
}

fn default_working_dir() -> String {
    "./wd".into()
}

fn default_internal_cert() -> String {
    "./internal/cert.pem".into()
}

fn default_internal_key() -> String {
    "./internal/key.pem".into()
}

fn default_internal_ca() -> String {
    "./internal/ca.pem".into()
}

fn default_favicon() -> String {
    "./favicon.ico".into()
}

/// Resolves a possibly-relative path against the config file's directory,
/// normalizing redundant `./`/`..` components.
#[must_use]
pub fn resolve_config_relative_paths(config_path: &Path, relative_path: &str) -> PathBuf {
    let path = Path::new(relative_path);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_path
            .parent()
            .map_or_else(|| path.to_path_buf(), |d| d.join(path))
    };
    normalize_path(&resolved)
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => result.push(c),
            Component::ParentDir => {
                result.pop();
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => result.push(component),
        }
    }
    result
}

/// Credentials for the blob-store proxy (Cert Store / Static-Content Store backing).
#[derive(Debug, Deserialize, Clone)]
pub struct BlobStoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Arc<SecretString>,
}

impl PartialEq for BlobStoreConfig {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.user == other.user
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_paths_against_config_dir() {
        let config_path = Path::new("/etc/ezfrontend/ezfrontend.toml");
        let resolved = resolve_config_relative_paths(config_path, "./tls/cert.pem");
        assert_eq!(resolved, PathBuf::from("/etc/ezfrontend/tls/cert.pem"));
    }

    #[test]
    fn absolute_paths_pass_through() {
        let config_path = Path::new("/etc/ezfrontend/ezfrontend.toml");
        let resolved = resolve_config_relative_paths(config_path, "/var/lib/cert.pem");
        assert_eq!(resolved, PathBuf::from("/var/lib/cert.pem"));
    }
}
