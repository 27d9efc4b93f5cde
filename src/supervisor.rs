//! Proxy-Worker Supervisor (C7): prepares the worker's working directory
//! tree, launches it, and signals it to reload or shut down.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::config::Config;
use crate::error::{FrontendError, Result};

const PID_POLL_ATTEMPTS: u32 = 20;
const PID_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The process-management capability the Supervisor is built against.
/// Launching a real nginx binary is outside what this crate's own test
/// suite can verify, so the control plane depends on this trait rather
/// than on `std::process::Command` directly.
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    async fn spawn(&self, binary: &str, args: &[String], working_dir: &Path) -> Result<()>;
    fn signal(&self, pid: i32, sig: WorkerSignal) -> Result<()>;
    async fn wait_for_pid_file(&self, pid_path: &Path) -> Result<i32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Reload,
    GracefulQuit,
    Terminate,
}

fn to_nix_signal(sig: WorkerSignal) -> Signal {
    match sig {
        WorkerSignal::Reload => Signal::SIGHUP,
        WorkerSignal::GracefulQuit => Signal::SIGQUIT,
        WorkerSignal::Terminate => Signal::SIGTERM,
    }
}

/// Real process-backed implementation, following §4.7's algorithm.
pub struct StdWorkerProcess;

#[async_trait]
impl WorkerProcess for StdWorkerProcess {
    async fn spawn(&self, binary: &str, args: &[String], working_dir: &Path) -> Result<()> {
        let binary = binary.to_string();
        let args = args.to_vec();
        let working_dir = working_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::process::Command::new(&binary).args(&args).current_dir(&working_dir).spawn()
        })
        .await
        .map_err(|e| FrontendError::WorkerReloadFailed(format!("spawn join error: {e}")))?
        .map_err(|e| FrontendError::WorkerReloadFailed(format!("spawning {binary}: {e}")))?;
        Ok(())
    }

    fn signal(&self, pid: i32, sig: WorkerSignal) -> Result<()> {
        signal::kill(Pid::from_raw(pid), to_nix_signal(sig))
            .map_err(|e| FrontendError::WorkerReloadFailed(format!("signaling pid {pid}: {e}")))
    }

    async fn wait_for_pid_file(&self, pid_path: &Path) -> Result<i32> {
        for _ in 0..PID_POLL_ATTEMPTS {
            if let Ok(contents) = tokio::fs::read_to_string(pid_path).await {
                if let Ok(pid) = contents.trim().parse::<i32>() {
                    return Ok(pid);
                }
            }
            tokio::time::sleep(PID_POLL_INTERVAL).await;
        }
        Err(FrontendError::WorkerReloadFailed(format!(
            "pid file {} never became readable",
            pid_path.display()
        )))
    }
}

pub struct Supervisor<'a> {
    config: &'a Config,
    process: Box<dyn WorkerProcess>,
    working_dir: PathBuf,
    recorded_pid: Option<i32>,
}

const RXTMP_DIRS: &[&str] = &["client_body_temp", "fastcgi_temp", "proxy_temp", "scgi_temp", "uwsgi_temp"];

impl<'a> Supervisor<'a> {
    #[must_use]
    pub fn new(config: &'a Config, process: Box<dyn WorkerProcess>, working_dir: PathBuf) -> Self {
        Self { config, process, working_dir, recorded_pid: None }
    }

    fn pid_path(&self, pid: i32) -> PathBuf {
        self.working_dir.join(format!("nginx_{pid}.pid"))
    }

    /// Creates the working-directory tree and templates the main config.
    #[tracing::instrument(skip(self))]
    pub async fn prepare_working_dir(&self) -> Result<()> {
        let wd = &self.working_dir;
        tokio::fs::create_dir_all(wd.join("logs")).await?;
        tokio::fs::create_dir_all(wd.join("sslA")).await?;
        tokio::fs::create_dir_all(wd.join("sslB")).await?;
        tokio::fs::create_dir_all(wd.join("staticA")).await?;
        tokio::fs::create_dir_all(wd.join("staticB")).await?;
        tokio::fs::create_dir_all(wd.join("conf/conf.d")).await?;
        for rxtmp in RXTMP_DIRS {
            tokio::fs::create_dir_all(wd.join("rxtmp").join(rxtmp)).await?;
        }

        relink(&wd.join("sslCurrent"), &wd.join("sslA")).await?;
        relink(&wd.join("staticCurrent"), &wd.join("staticA")).await?;

        let ca_chain = self.concatenate_ca_files().await?;
        tokio::fs::write(wd.join("CAchain.pem"), ca_chain).await?;

        let main_conf = self.template_main_config();
        tokio::fs::write(wd.join("conf/nginx.conf"), main_conf).await?;

        Ok(())
    }

    async fn concatenate_ca_files(&self) -> Result<Vec<u8>> {
        let ca_dir = self.working_dir.join("ssl/user_ca_files");
        let mut out = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&ca_dir).await else {
            return Ok(out);
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.path());
        }
        names.sort();
        for path in names {
            out.extend(tokio::fs::read(&path).await?);
        }
        Ok(out)
    }

    fn template_main_config(&self) -> String {
        // nginx resolves relative paths in directives against its `-p`
        // prefix (this worker's working directory), not against the
        // directory containing this config file. conf.d sits a level
        // deeper than that prefix, so the include needs an absolute path
        // built from working_dir rather than a plain relative one.
        let conf_d = self.working_dir.join("conf/conf.d");
        format!(
            "worker_processes {};\nerror_log logs/error.log;\npid nginx.pid;\nevents {{ worker_connections 1024; }}\nhttp {{ include {}/*.conf; }}\n",
            self.config.server.ngx_workers,
            conf_d.display()
        )
    }

    /// Launches the worker binary, waits for its raw pid file, then records
    /// it under the canonical `nginx_<pid>.pid` name (§4.7).
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<()> {
        let args = vec![
            "-c".to_string(),
            self.working_dir.join("conf/nginx.conf").display().to_string(),
            "-p".to_string(),
            self.working_dir.display().to_string(),
        ];
        self.process.spawn("nginx", &args, &self.working_dir).await?;

        let raw_pid_path = self.working_dir.join("nginx.pid");
        let pid = self.process.wait_for_pid_file(&raw_pid_path).await?;
        tokio::fs::copy(&raw_pid_path, self.pid_path(pid)).await.ok();
        self.recorded_pid = Some(pid);
        Ok(())
    }

    /// Reads `<workingDir>/nginx_<pid>.pid`; if unreadable, discovers orphan
    /// masters via the process table and HUPs those instead (§4.7).
    #[tracing::instrument(skip(self))]
    pub async fn reload(&self) -> Result<()> {
        if let Some(pid) = self.recorded_pid {
            if tokio::fs::read_to_string(self.pid_path(pid)).await.is_ok() {
                return self.process.signal(pid, WorkerSignal::Reload);
            }
        }
        let mut last_err = None;
        for pid in discover_orphan_masters() {
            if let Err(e) = self.process.signal(pid, WorkerSignal::Reload) {
                last_err = Some(e);
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    /// Graceful quit on the recorded master, terminate on orphans, recursive
    /// working-directory cleanup (§4.7).
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<()> {
        if let Some(pid) = self.recorded_pid {
            self.process.signal(pid, WorkerSignal::GracefulQuit)?;
        }
        for pid in discover_orphan_masters() {
            self.process.signal(pid, WorkerSignal::Terminate).ok();
        }
        tokio::fs::remove_dir_all(&self.working_dir).await.ok();
        Ok(())
    }
}

async fn relink(link: &Path, target: &Path) -> Result<()> {
    if tokio::fs::symlink_metadata(link).await.is_ok() {
        tokio::fs::remove_file(link).await.ok();
    }
    #[cfg(unix)]
    tokio::fs::symlink(target, link).await?;
    Ok(())
}

/// Parses the OS process table for `nginx: master process` entries that
/// have no corresponding `nginx: worker process is shutting down` child,
/// per §4.7's reload fallback.
fn discover_orphan_masters() -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut masters = Vec::new();
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let Ok(cmdline) = std::fs::read_to_string(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = cmdline.replace('\0', " ");
        if cmdline.contains("nginx: master process") && !cmdline.contains("nginx: worker process is shutting down") {
            masters.push(pid);
        }
    }
    masters
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeWorkerProcess {
        signals: StdMutex<Vec<(i32, WorkerSignal)>>,
        next_pid: AtomicI32,
    }

    #[async_trait]
    impl WorkerProcess for FakeWorkerProcess {
        async fn spawn(&self, _binary: &str, _args: &[String], _working_dir: &Path) -> Result<()> {
            self.next_pid.store(4242, Ordering::SeqCst);
            Ok(())
        }
        fn signal(&self, pid: i32, sig: WorkerSignal) -> Result<()> {
            self.signals.lock().unwrap().push((pid, sig));
            Ok(())
        }
        async fn wait_for_pid_file(&self, _pid_path: &Path) -> Result<i32> {
            let pid = self.next_pid.load(Ordering::SeqCst);
            if pid == 0 {
                Err(FrontendError::WorkerReloadFailed("no pid yet".into()))
            } else {
                Ok(pid)
            }
        }
    }

    fn sample_config() -> Config {
        toml::from_str(
            r#"
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
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn prepare_working_dir_creates_expected_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sample_config();
        let supervisor = Supervisor::new(&config, Box::new(FakeWorkerProcess::default()), tmp.path().to_path_buf());
        supervisor.prepare_working_dir().await.unwrap();
        assert!(tmp.path().join("sslA").is_dir());
        assert!(tmp.path().join("rxtmp/proxy_temp").is_dir());
        assert!(tmp.path().join("conf/nginx.conf").is_file());
    }

    #[tokio::test]
    async fn start_records_pid_from_worker_process() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sample_config();
        let mut supervisor = Supervisor::new(&config, Box::new(FakeWorkerProcess::default()), tmp.path().to_path_buf());
        supervisor.prepare_working_dir().await.unwrap();
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.recorded_pid, Some(4242));
    }
}
