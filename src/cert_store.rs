//! Cert Store (C2): durable per-`serverName` storage of cert/key material,
//! bundled as PKCS#12 with a deterministic, optionally signed password.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac as _};
use openssl::{
    hash::MessageDigest,
    pkcs12::Pkcs12,
    pkey::PKey,
    symm::Cipher,
    x509::X509,
};
use secrecy::{ExposeSecret as _, SecretString};
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::error::{FrontendError, Result};

/// Backing row store capability set a Cert Store can be built on. Kept
/// separate from the blob-store client itself so the same trait could be
/// satisfied by an in-memory test double or a real Accumulo-proxy client.
#[async_trait]
pub trait BlobRowStore: Send + Sync {
    async fn put_row(&self, table: &str, key: &str, qualifier: &str, value: Vec<u8>) -> Result<()>;
    async fn get_row(&self, table: &str, key: &str, qualifier: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_row(&self, table: &str, key: &str) -> Result<()>;
    async fn row_exists(&self, table: &str, key: &str) -> Result<bool>;
}

const TABLE: &str = "ezfrontend";
const QUALIFIER: &str = "enc";

/// Derives the deterministic PKCS#12 password for a server name (§4.2):
/// HMAC-SHA256 with the configured signing key when present, otherwise
/// base64 of a fixed salt concatenated with the server name.
fn derive_password(server_name: &str, signing_key: Option<&SecretString>) -> String {
    const SALT: &str = "ezfrontend-pkcs12-salt-v1";
    match signing_key {
        Some(key) => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key.expose_secret().as_bytes())
                .expect("HMAC accepts a key of any size");
            mac.update(server_name.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }
        None => {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.encode(format!("{SALT}{server_name}"))
        }
    }
}

fn bundle_pkcs12(server_name: &str, cert_pem: &str, key_pem: &str, password: &str) -> Result<Vec<u8>> {
    let cert = X509::from_pem(cert_pem.as_bytes())
        .map_err(|e| FrontendError::CertStoreError(format!("parsing cert PEM: {e}")))?;
    let key = PKey::private_key_from_pem(key_pem.as_bytes())
        .map_err(|e| FrontendError::CertStoreError(format!("parsing key PEM: {e}")))?;
    let pkcs12 = Pkcs12::builder()
        .cert_algorithm(Cipher::aes_256_cbc())
        .key_algorithm(Cipher::aes_256_cbc())
        .mac_md(MessageDigest::sha256())
        .name(server_name)
        .pkey(&key)
        .cert(&cert)
        .build2(password)
        .map_err(|e| FrontendError::CertStoreError(format!("building pkcs12: {e}")))?;
    pkcs12
        .to_der()
        .map_err(|e| FrontendError::CertStoreError(format!("serializing pkcs12: {e}")))
}

fn unbundle_pkcs12(der: &[u8], password: &str) -> Result<(String, String)> {
    let pkcs12 = Pkcs12::from_der(der).map_err(|e| FrontendError::CertStoreError(format!("parsing pkcs12: {e}")))?;
    let parsed = pkcs12
        .parse2(password)
        .map_err(|e| FrontendError::CertStoreError(format!("unlocking pkcs12: {e}")))?;
    let cert = parsed
        .cert
        .ok_or_else(|| FrontendError::CertStoreError("pkcs12 archive has no certificate".into()))?;
    let key = parsed
        .pkey
        .ok_or_else(|| FrontendError::CertStoreError("pkcs12 archive has no private key".into()))?;
    let cert_pem = String::from_utf8(
        cert.to_pem()
            .map_err(|e| FrontendError::CertStoreError(format!("re-encoding cert PEM: {e}")))?,
    )
    .map_err(|e| FrontendError::CertStoreError(format!("cert PEM is not UTF-8: {e}")))?;
    let key_pem = String::from_utf8(
        key.private_key_to_pem_pkcs8()
            .map_err(|e| FrontendError::CertStoreError(format!("re-encoding key PEM: {e}")))?,
    )
    .map_err(|e| FrontendError::CertStoreError(format!("key PEM is not UTF-8: {e}")))?;
    Ok((cert_pem, key_pem))
}

/// Durable per-server TLS material, backed by a `BlobRowStore`.
pub struct CertStore {
    store: Arc<dyn BlobRowStore>,
    signing_key: Option<Arc<SecretString>>,
    // `reconnect()` doesn't apply to the shipped in-process backend, but the
    // lock mirrors the real connection-lifetime guard the trait's
    // implementors may need.
    _guard: Mutex<()>,
}

impl CertStore {
    #[must_use]
    pub fn new(store: Arc<dyn BlobRowStore>, signing_key: Option<Arc<SecretString>>) -> Self {
        Self {
            store,
            signing_key,
            _guard: Mutex::new(()),
        }
    }

    /// Bundles `certPEM`/`keyPEM` into PKCS#12 and writes a single row.
    pub async fn put(&self, server_name: &str, cert_pem: &str, key_pem: &str) -> Result<()> {
        let password = derive_password(server_name, self.signing_key.as_deref());
        let bundle = bundle_pkcs12(server_name, cert_pem, key_pem, &password)?;
        self.store.put_row(TABLE, server_name, QUALIFIER, bundle).await
    }

    /// Retrieves and unpacks a server's cert/key. Returns `None` when absent.
    pub async fn get(&self, server_name: &str) -> Result<Option<(String, String)>> {
        let Some(bundle) = self.store.get_row(TABLE, server_name, QUALIFIER).await? else {
            return Ok(None);
        };
        let password = derive_password(server_name, self.signing_key.as_deref());
        unbundle_pkcs12(&bundle, &password).map(Some)
    }

    pub async fn exists(&self, server_name: &str) -> Result<bool> {
        self.store.row_exists(TABLE, server_name).await
    }

    pub async fn remove(&self, server_name: &str) -> Result<()> {
        self.store.delete_row(TABLE, server_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Default)]
    struct InMemoryRowStore {
        rows: TokioMutex<HashMap<(String, String, String), Vec<u8>>>,
    }

    #[async_trait]
    impl BlobRowStore for InMemoryRowStore {
        async fn put_row(&self, table: &str, key: &str, qualifier: &str, value: Vec<u8>) -> Result<()> {
            self.rows
                .lock()
                .await
                .insert((table.into(), key.into(), qualifier.into()), value);
            Ok(())
        }
        async fn get_row(&self, table: &str, key: &str, qualifier: &str) -> Result<Option<Vec<u8>>> {
            Ok(self
                .rows
                .lock()
                .await
                .get(&(table.into(), key.into(), qualifier.into()))
                .cloned())
        }
        async fn delete_row(&self, table: &str, key: &str) -> Result<()> {
            self.rows.lock().await.retain(|(t, k, _), _| !(t == table && k == key));
            Ok(())
        }
        async fn row_exists(&self, table: &str, key: &str) -> Result<bool> {
            Ok(self.rows.lock().await.keys().any(|(t, k, _)| t == table && k == key))
        }
    }

    fn self_signed_pem(cn: &str) -> (String, String) {
        let cert_key = rcgen::generate_simple_self_signed(vec![cn.to_string()]).unwrap();
        (cert_key.cert.pem(), cert_key.signing_key.serialize_pem())
    }

    #[tokio::test]
    async fn put_then_get_round_trips_without_signing_key() {
        let store = CertStore::new(Arc::new(InMemoryRowStore::default()), None);
        let (cert_pem, key_pem) = self_signed_pem("app.example.com");
        store.put("app.example.com", &cert_pem, &key_pem).await.unwrap();
        assert!(store.exists("app.example.com").await.unwrap());
        let (got_cert, _got_key) = store.get("app.example.com").await.unwrap().unwrap();
        assert!(got_cert.contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn put_then_get_round_trips_with_signing_key() {
        let key = Arc::new(SecretString::from("super-secret-signing-key".to_string()));
        let store = CertStore::new(Arc::new(InMemoryRowStore::default()), Some(key));
        let (cert_pem, key_pem) = self_signed_pem("signed.example.com");
        store.put("signed.example.com", &cert_pem, &key_pem).await.unwrap();
        let (got_cert, got_key) = store.get("signed.example.com").await.unwrap().unwrap();
        assert!(got_cert.contains("BEGIN CERTIFICATE"));
        assert!(got_key.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn get_on_absent_server_returns_none() {
        let store = CertStore::new(Arc::new(InMemoryRowStore::default()), None);
        assert!(store.get("nobody.example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_deletes_row() {
        let store = CertStore::new(Arc::new(InMemoryRowStore::default()), None);
        let (cert_pem, key_pem) = self_signed_pem("app.example.com");
        store.put("app.example.com", &cert_pem, &key_pem).await.unwrap();
        store.remove("app.example.com").await.unwrap();
        assert!(!store.exists("app.example.com").await.unwrap());
    }
}
