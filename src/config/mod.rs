//! Configuration management: typed values, loading, and hot-reload (A2).

mod loader;
mod types;
mod watcher;

pub use loader::load_config;
pub use types::{BlobStoreConfig, Config, DbConfig, PathsConfig, RpcConfig, ServerConfig, resolve_config_relative_paths};
pub use watcher::watch_config_file;
