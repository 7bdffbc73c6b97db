//! Supervisor for the external local forwarding proxy.
//!
//! The proxy binary listens on `127.0.0.1:{port}`. "Port busy" is the
//! readiness signal: once a bind on the port fails, the proxy is serving.

use crate::config;
use crate::scheduler::backoff::sleep_or_cancel;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STARTUP_POLL: Duration = Duration::from_millis(500);
const PORT_FREE_WAIT: Duration = Duration::from_secs(5);
const TERM_GRACE: Duration = Duration::from_secs(1);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy binary not found: {0}")]
    BinaryMissing(PathBuf),
    #[error("invalid proxy port {0}")]
    InvalidPort(u32),
    #[error("port {0} is still in use after stopping its previous owner")]
    PortBusy(u16),
    #[error("proxy did not start listening on port {port} within {timeout:?}")]
    StartupTimeout { port: u16, timeout: Duration },
    #[error("proxy I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
struct Running {
    child: Option<Child>,
    pid: Option<u32>,
}

struct Monitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ProxySupervisor {
    binary: PathBuf,
    server_ip: String,
    port: u16,
    daemon_mode: bool,
    auto_restart: bool,
    health_interval: Duration,
    startup_timeout: Duration,
    pid_file: PathBuf,
    running: Mutex<Running>,
    monitor: StdMutex<Option<Monitor>>,
}

/// `true` when nothing is listening on the port.
pub async fn port_available(port: u16) -> bool {
    tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // signal 0 only checks for existence
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) {
    if let Ok(pid) = libc::pid_t::try_from(pid) {
        unsafe {
            libc::kill(pid, signal);
        }
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

/// Graceful then forced termination of an arbitrary process.
async fn kill_process(pid: u32) {
    if !process_alive(pid) {
        debug!(pid, "process already gone");
        return;
    }
    #[cfg(unix)]
    {
        send_signal(pid, libc::SIGTERM);
        tokio::time::sleep(TERM_GRACE).await;
        if process_alive(pid) {
            warn!(pid, "process ignored SIGTERM; killing");
            send_signal(pid, libc::SIGKILL);
            tokio::time::sleep(TERM_GRACE / 2).await;
        }
    }
    info!(pid, "process terminated");
}

/// First PID listening on the port according to `lsof`.
async fn find_pid_by_port(port: u16) -> Option<u32> {
    let output = Command::new("lsof")
        .arg("-ti")
        .arg(format!(":{port}"))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(LOOKUP_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(_)) => return None,
        Ok(Err(err)) => {
            debug!(?err, "lsof unavailable");
            return None;
        }
        Err(_) => return None,
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.trim().parse().ok())
}

async fn read_pid_file(path: &Path) -> Option<u32> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    raw.trim().parse().ok()
}

async fn remove_pid_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(?err, path = %path.display(), "failed to remove pid file"),
    }
}

impl ProxySupervisor {
    pub fn from_config(cfg: &config::Proxy) -> Result<Self, ProxyError> {
        let port = u16::try_from(cfg.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(ProxyError::InvalidPort(cfg.port))?;
        Ok(Self {
            binary: PathBuf::from(&cfg.binary),
            server_ip: cfg.server_ip.clone(),
            port,
            daemon_mode: cfg.daemon_mode,
            auto_restart: cfg.auto_restart,
            health_interval: Duration::from_secs(cfg.health_check_interval_seconds.max(1)),
            startup_timeout: Duration::from_secs(cfg.startup_timeout_seconds.max(1)),
            pid_file: PathBuf::from(&cfg.pid_file),
            running: Mutex::new(Running::default()),
            monitor: StdMutex::new(None),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn pid(&self) -> Option<u32> {
        self.running.lock().await.pid
    }

    /// Clears stale occupants of the port, launches the proxy, waits for it to
    /// listen and, with auto-restart enabled, starts the health monitor.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProxyError> {
        self.launch().await?;
        if self.auto_restart {
            self.spawn_monitor();
        }
        Ok(())
    }

    /// Process alive and port occupied.
    pub async fn is_alive(&self) -> bool {
        let pid = self.running.lock().await.pid;
        match pid {
            Some(pid) => process_alive(pid) && !port_available(self.port).await,
            None => false,
        }
    }

    pub async fn restart(self: &Arc<Self>) -> Result<(), ProxyError> {
        info!(port = self.port, "restarting proxy");
        self.stop().await;
        tokio::time::sleep(TERM_GRACE).await;
        self.start().await
    }

    /// Stops the monitor, terminates the proxy and removes the pid file.
    pub async fn stop(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(monitor) = monitor {
            monitor.token.cancel();
            if tokio::time::timeout(Duration::from_secs(2), monitor.handle).await.is_err() {
                warn!("proxy health monitor did not stop in time");
            }
        }
        self.stop_process().await;
        info!(port = self.port, "proxy stopped");
    }

    async fn stop_process(&self) {
        let mut running = self.running.lock().await;
        if let Some(pid) = running.pid.take() {
            kill_process(pid).await;
        }
        if let Some(mut child) = running.child.take() {
            let _ = child.start_kill();
            if tokio::time::timeout(Duration::from_secs(3), child.wait()).await.is_err() {
                warn!("proxy child did not exit after kill");
            }
        }
        remove_pid_file(&self.pid_file).await;
    }

    async fn clear_stale(&self) -> Result<(), ProxyError> {
        if let Some(pid) = read_pid_file(&self.pid_file).await {
            if process_alive(pid) {
                info!(pid, "stopping proxy recorded in pid file");
                kill_process(pid).await;
            }
        }
        remove_pid_file(&self.pid_file).await;

        if let Some(pid) = find_pid_by_port(self.port).await {
            info!(pid, port = self.port, "port occupied; stopping owner");
            kill_process(pid).await;
        }

        let deadline = Instant::now() + PORT_FREE_WAIT;
        loop {
            if port_available(self.port).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProxyError::PortBusy(self.port));
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
    }

    async fn wait_listening(&self) -> bool {
        let deadline = Instant::now() + self.startup_timeout;
        while Instant::now() < deadline {
            if !port_available(self.port).await {
                return true;
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
        false
    }

    async fn launch(&self) -> Result<(), ProxyError> {
        self.clear_stale().await?;
        if !tokio::fs::try_exists(&self.binary).await.unwrap_or(false) {
            return Err(ProxyError::BinaryMissing(self.binary.clone()));
        }

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-r")
            .arg(&self.server_ip)
            .arg("-p")
            .arg(self.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if self.daemon_mode {
            cmd.arg("-d");
        }
        let mut child = cmd.spawn()?;

        if !self.wait_listening().await {
            let _ = child.start_kill();
            return Err(ProxyError::StartupTimeout { port: self.port, timeout: self.startup_timeout });
        }

        // a daemonized proxy forks away from the child we spawned
        let pid = if self.daemon_mode {
            find_pid_by_port(self.port).await
        } else {
            child.id()
        };
        if let Some(pid) = pid {
            tokio::fs::write(&self.pid_file, pid.to_string()).await?;
        } else {
            warn!(port = self.port, "proxy is listening but its pid is unknown");
        }

        let mut running = self.running.lock().await;
        running.child = Some(child);
        running.pid = pid;
        info!(?pid, port = self.port, "proxy started");
        Ok(())
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.health_interval;
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            while sleep_or_cancel(interval, &loop_token).await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if this.is_alive().await {
                    continue;
                }
                warn!(port = this.port, "proxy died; relaunching");
                this.stop_process().await;
                if let Err(err) = this.launch().await {
                    error!(%err, "proxy relaunch failed; health monitor exiting");
                    break;
                }
            }
            debug!("proxy health monitor finished");
        });

        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(Monitor { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
    }
}
