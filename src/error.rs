//! Crate-wide typed error surface.
//!
//! RPC-surfaced and component-internal failures are collected into a single
//! enum so the Control RPC Server (C10) can map them back to the error kinds
//! callers expect, while background tasks can match on the fatal-vs-transient
//! distinction the Reconfigure Loop (C8) needs.

use thiserror::Error;

/// Errors surfaced by the control plane's components.
#[derive(Debug, Error)]
pub enum FrontendError {
    /// A registration failed structural or semantic validation.
    #[error("registration invalid: {0}")]
    RegistrationInvalid(String),

    /// The target of a remove operation does not exist.
    #[error("registration not found: {0}")]
    RegistrationNotFound(String),

    /// The certificate store is unreachable or returned a transport error.
    #[error("cert store error: {0}")]
    CertStoreError(String),

    /// Static content failed validation or storage.
    #[error("static content error: {0}")]
    StaticContentError(String),

    /// An upstream hostname could not be resolved during a configure pass.
    #[error("upstream unresolvable: {0}")]
    UpstreamUnresolvable(String),

    /// Signaling the proxy worker to reload failed. Non-fatal: the config is
    /// already written, the next successful signal applies it.
    #[error("worker reload failed: {0}")]
    WorkerReloadFailed(String),

    /// The coordination service could not be reached in time.
    #[error("coordination timeout: {0}")]
    CoordinationTimeout(String),

    /// A request's arguments were structurally wrong (wrong type, missing field).
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl FrontendError {
    /// Whether this error should be treated as fatal inside the Reconfigure
    /// Loop (C8), i.e. it should flip the global `run` flag rather than just
    /// reset handles and retry on the next iteration.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::CertStoreError(_))
    }
}

pub type Result<T> = std::result::Result<T, FrontendError>;
