//! Owns the dnsmasq child process: launch, log tailing, liveness, stop.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use px_common::{Error, Result};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::logtail::LogTail;
use crate::options::DnsmasqOptions;

/// How long a graceful stop may take before escalating.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of the supervised process. No transition leaves `Stopped`;
/// a new supervisor instance is required to run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// Supervises one dnsmasq process.
///
/// A private working directory and log file are created at `start` and
/// removed by `shutdown` regardless of how the process exited; the log file
/// handle is closed before the working directory is removed.
#[derive(Debug)]
pub struct Dnsmasq {
    binary: PathBuf,
    options: DnsmasqOptions,
    state: ProcessState,
    child: Option<Child>,
    workdir: Option<TempDir>,
    log: Option<LogTail>,
    exit_status: Option<ExitStatus>,
}

impl Dnsmasq {
    /// Resolves the dnsmasq executable from PATH once, up front.
    pub fn new(options: DnsmasqOptions) -> Result<Self> {
        Ok(Self::with_binary(locate_dnsmasq()?, options))
    }

    /// Uses the given executable instead of searching PATH.
    pub fn with_binary(binary: PathBuf, options: DnsmasqOptions) -> Self {
        Self {
            binary,
            options,
            state: ProcessState::NotStarted,
            child: None,
            workdir: None,
            log: None,
            exit_status: None,
        }
    }

    /// Launches the dnsmasq process.
    ///
    /// The `log_facility` option is overridden to point at a freshly created
    /// private log file so the supervisor can tail it.
    pub async fn start(&mut self) -> Result<()> {
        let workdir = tempfile::Builder::new()
            .prefix("pxeup-dnsmasq-")
            .tempdir()?;
        let log_path = workdir.path().join("dnsmasq.log");
        // Dnsmasq needs it to exist.
        std::fs::File::create(&log_path)?;
        self.options.log_facility = log_path.clone();

        let args = self.options.to_args();
        info!(
            "running {} -C /dev/null {}",
            self.binary.display(),
            args.join(" ")
        );
        let child = Command::new(&self.binary)
            .arg("-C")
            .arg("/dev/null")
            .args(&args)
            .spawn()
            .map_err(|e| Error::Launch {
                command: self.binary.display().to_string(),
                reason: e.to_string(),
            })?;
        info!("dnsmasq started with pid {}", child.id().unwrap_or_default());

        self.log = Some(LogTail::open(&log_path)?);
        self.child = Some(child);
        self.workdir = Some(workdir);
        self.state = ProcessState::Running;
        Ok(())
    }

    /// Polls the child and returns the current lifecycle state.
    pub fn state(&mut self) -> ProcessState {
        if matches!(self.state, ProcessState::Running | ProcessState::Stopping) {
            if let Some(child) = self.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        self.exit_status = Some(status);
                        self.state = ProcessState::Stopped;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("failed to poll dnsmasq: {e}");
                    }
                }
            }
        }
        self.state
    }

    /// Whether the dnsmasq process is still running.
    pub fn running(&mut self) -> bool {
        self.state() == ProcessState::Running
    }

    /// The child's exit status, once it has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Reads newly appended log lines, forwards each to the tracing layer,
    /// and returns them. Never blocks; a partial trailing line is held until
    /// the next call.
    pub fn drain_log(&mut self) -> Result<Vec<String>> {
        let Some(log) = self.log.as_mut() else {
            return Ok(Vec::new());
        };
        let lines = log.read_new_lines()?;
        for line in &lines {
            info!(target: "dnsmasq", "{line}");
        }
        Ok(lines)
    }

    /// Stops and waits for the dnsmasq process if it's running.
    ///
    /// Idempotent. Asks the child to terminate gracefully (SIGTERM) and
    /// waits up to `wait` for it to exit; a child that ignores the request
    /// is killed outright. Either way the process is reaped before this
    /// returns.
    pub async fn stop(&mut self, wait: Duration) -> Result<()> {
        if self.state() != ProcessState::Running {
            return Ok(());
        }
        let Some(child) = self.child.as_mut() else {
            self.state = ProcessState::Stopped;
            return Ok(());
        };
        self.state = ProcessState::Stopping;
        info!("stopping dnsmasq");

        if let Some(pid) = child.id() {
            let term = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .output()
                .await?;
            if !term.status.success() {
                debug!(
                    "kill -TERM {pid}: {}",
                    String::from_utf8_lossy(&term.stderr).trim()
                );
            }
        }

        let status = match timeout(wait, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!("dnsmasq did not exit within {wait:?}, killing it");
                child.kill().await?;
                child.wait().await?
            }
        };
        self.exit_status = Some(status);
        self.state = ProcessState::Stopped;
        Ok(())
    }

    /// Releases everything the supervisor acquired: stops the child if it is
    /// still running, closes the log file handle, then removes the working
    /// directory.
    pub async fn shutdown(&mut self) -> Result<()> {
        let stopped = self.stop(STOP_TIMEOUT).await;
        self.log = None;
        let removed = match self.workdir.take() {
            Some(workdir) => workdir.close().map_err(Error::from),
            None => Ok(()),
        };
        stopped.and(removed)
    }
}

fn locate_dnsmasq() -> Result<PathBuf> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path)
        .map(|dir| dir.join("dnsmasq"))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| Error::Launch {
            command: "dnsmasq".into(),
            reason: "not found in PATH".into(),
        })
}
