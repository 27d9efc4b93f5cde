//! Installs the control plane as a platform service (§6.2 `install`).
//!
//! Ported from this codebase's cross-platform service-install helpers,
//! narrowed to the two targets this control plane actually ships on:
//! systemd (the common case) and a serviceless fallback that prints the
//! equivalent manual invocation for anything else.

use std::env;
use std::fs;
use std::path::PathBuf;

use eyre::{Result, WrapErr as _, bail};

const SERVICE_NAME: &str = "ezfrontend";

#[cfg(target_os = "linux")]
fn is_superuser() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(target_os = "linux"))]
fn is_superuser() -> bool {
    false
}

fn systemd_unit(binary_path: &str, config_path: &str) -> String {
    format!(
        "[Unit]\n\
Description=ezfrontend control plane\n\
After=network.target\n\
\n\
[Service]\n\
ExecStart={binary_path} run --config {config_path}\n\
Restart=on-failure\n\
\n\
[Install]\n\
WantedBy=multi-user.target\n"
    )
}

/// Installs a systemd unit pointing at the current binary and the given
/// config path. Requires root.
#[cfg(target_os = "linux")]
fn install_systemd(config_path: &str) -> Result<()> {
    if !is_superuser() {
        bail!("installing the {SERVICE_NAME} service requires root or sudo");
    }
    let binary_path = env::current_exe().wrap_err("resolving the running binary's path")?;
    let unit_path = PathBuf::from(format!("/etc/systemd/system/{SERVICE_NAME}.service"));
    let unit = systemd_unit(&binary_path.display().to_string(), config_path);
    fs::write(&unit_path, unit).wrap_err_with(|| format!("writing {}", unit_path.display()))?;
    tracing::info!(unit = %unit_path.display(), "systemd unit installed; run `systemctl daemon-reload && systemctl enable --now {SERVICE_NAME}`");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn install_systemd(_config_path: &str) -> Result<()> {
    bail!("systemd install is only supported on linux")
}

/// Installs the process as a platform service, or prints the manual
/// invocation when no supported service manager is detected.
pub fn install(config_path: &str) -> Result<()> {
    if cfg!(target_os = "linux") {
        return install_systemd(config_path);
    }
    let binary_path = env::current_exe().wrap_err("resolving the running binary's path")?;
    println!(
        "No supported service manager detected for this platform.\nRun manually with:\n    {} run --config {config_path}",
        binary_path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn systemd_unit_references_run_subcommand_and_config_path() {
        let unit = systemd_unit("/usr/local/bin/ezfrontend", "/etc/ezfrontend/ezfrontend.toml");
        assert!(unit.contains("run --config /etc/ezfrontend/ezfrontend.toml"));
        assert!(unit.contains("ExecStart=/usr/local/bin/ezfrontend"));
    }
}
