//! Loading the control plane's TOML configuration file.

use std::path::Path;

use eyre::{Result, WrapErr as _};
use tokio::fs;

use super::types::Config;

/// Reads and parses the control-plane config from a TOML file.
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("reading config file at {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).wrap_err_with(|| format!("parsing config file at {}", path.display()))?;
    Ok(config)
}
