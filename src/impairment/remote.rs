//! Policy changes on a separate controller host.
//!
//! The controller runs `netlab controller ...` itself; this side only ships
//! the invocation over a [`RemoteExecutor`] and maps the exit status back onto
//! the error taxonomy.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ImpairmentMode, ShaperSettings};
use crate::error::{
    EXIT_INTERFACE, EXIT_PERMISSION, EXIT_POLICY_CONFLICT, ExperimentError, Result,
};
use crate::exec::{CommandOutput, Invocation, shell_quote};

/// Capability: run a command on host X and report how it exited.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Errors only when the command could not be delivered at all.
    async fn execute(&self, host: &str, invocation: &Invocation) -> Result<CommandOutput>;

    /// Tear down any session kept open to `host`.
    async fn release(&self, host: &str) -> Result<()>;
}

/// [`RemoteExecutor`] over OpenSSH, multiplexed on one control connection.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    pub user: String,
    pub connect_timeout_secs: u32,
    control_path: PathBuf,
}

/// ssh reserves this exit status for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Upper bound on one remote policy command, connection included.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

impl SshExecutor {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            connect_timeout_secs: 5,
            control_path: std::env::temp_dir().join("netlab-ssh-%C"),
        }
    }

    fn destination(&self, host: &str) -> String {
        format!("{}@{}", self.user, host)
    }

    fn base(&self) -> Invocation {
        Invocation::new("ssh").args([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ])
    }

    /// The local `ssh` invocation that runs `invocation` on `host`.
    ///
    /// The remote side hands the command to a shell, so each argument is
    /// quoted individually.
    pub fn wrap(&self, host: &str, invocation: &Invocation) -> Invocation {
        self.base()
            .args(["-o", "ControlMaster=auto", "-o", "ControlPersist=60"])
            .arg(self.destination(host))
            .arg("--")
            .args(invocation.argv().iter().map(|a| shell_quote(a)))
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, host: &str, invocation: &Invocation) -> Result<CommandOutput> {
        let ssh = self.wrap(host, invocation);
        debug!(host, command = %invocation, "remote exec");
        let mut cmd = ssh.command();
        // A dispatch abandoned on timeout must not leave ssh behind.
        cmd.kill_on_drop(true);
        let output = cmd.output().await.map_err(|source| ExperimentError::Spawn {
            program: "ssh".into(),
            source,
        })?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.code() == Some(SSH_TRANSPORT_FAILURE) {
            return Err(ExperimentError::RemoteDispatchFailure {
                host: host.to_string(),
                detail: format!("ssh transport failure: {stderr}"),
            });
        }
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }

    async fn release(&self, host: &str) -> Result<()> {
        let exit = self.base().args(["-O", "exit"]).arg(self.destination(host));
        let mut cmd = exit.command();
        cmd.kill_on_drop(true);
        let output = cmd.output().await.map_err(|source| ExperimentError::Spawn {
            program: "ssh".into(),
            source,
        })?;
        if !output.status.success() {
            // No master running is the normal case after a failed connect.
            debug!(
                host,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "no ssh control master to release"
            );
        }
        Ok(())
    }
}

/// Client side of a remote policy engine.
pub struct RemoteController {
    host: IpAddr,
    executor: Arc<dyn RemoteExecutor>,
    /// Path of the `netlab` binary on the controller.
    program: String,
    interface: Option<String>,
    shaper: ShaperSettings,
    tcp_retries: u32,
    preview: bool,
    timeout: Duration,
}

impl RemoteController {
    pub fn new(
        host: IpAddr,
        executor: Arc<dyn RemoteExecutor>,
        program: impl Into<String>,
    ) -> Self {
        Self {
            host,
            executor,
            program: program.into(),
            interface: None,
            shaper: ShaperSettings::default(),
            tcp_retries: super::DEFAULT_TCP_RETRIES,
            preview: false,
            timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }

    /// Bound on each dispatched command and on the session release.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_shaper(mut self, shaper: ShaperSettings, tcp_retries: u32) -> Self {
        self.shaper = shaper;
        self.tcp_retries = tcp_retries;
        self
    }

    pub fn with_preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// `netlab controller apply ...` as it will run on the controller.
    pub fn apply_invocation(&self, mode: &ImpairmentMode) -> Invocation {
        let mut inv = Invocation::new(&self.program)
            .args(["controller", "apply"])
            .args(mode.cli_args());
        if matches!(mode, ImpairmentMode::Bottleneck { .. }) {
            inv = inv.args([
                "--burst".to_string(),
                self.shaper.burst.to_string(),
                "--latency-ms".to_string(),
                self.shaper.latency.as_millis().to_string(),
            ]);
        }
        if mode.requires_controller() {
            inv = inv.args(["--retries".to_string(), self.tcp_retries.to_string()]);
        }
        self.finish(inv)
    }

    pub fn clear_invocation(&self) -> Invocation {
        self.finish(Invocation::new(&self.program).args(["controller", "clear"]))
    }

    fn finish(&self, inv: Invocation) -> Invocation {
        match &self.interface {
            Some(iface) => inv.args(["--interface", iface.as_str()]),
            None => inv,
        }
    }

    pub async fn apply(&self, mode: &ImpairmentMode) -> Result<()> {
        let inv = self.apply_invocation(mode);
        self.dispatch(&inv).await?;
        info!(
            host = %self.host,
            policy = %mode,
            preview = self.preview,
            "remote impairment applied"
        );
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let inv = self.clear_invocation();
        self.dispatch(&inv).await?;
        info!(host = %self.host, "remote impairment cleared");
        Ok(())
    }

    pub async fn release(&self) -> Result<()> {
        if self.preview {
            return Ok(());
        }
        let host = self.host.to_string();
        match tokio::time::timeout(self.timeout, self.executor.release(&host)).await {
            Ok(res) => res,
            Err(_) => Err(ExperimentError::RemoteDispatchFailure {
                host,
                detail: format!("session release timed out after {:?}", self.timeout),
            }),
        }
    }

    async fn dispatch(&self, inv: &Invocation) -> Result<()> {
        let host = self.host.to_string();
        if self.preview {
            info!(host, command = %inv, "preview: would dispatch");
            return Ok(());
        }
        let dispatched = tokio::time::timeout(self.timeout, self.executor.execute(&host, inv));
        let output = match dispatched.await {
            Ok(res) => res?,
            Err(_) => {
                warn!(host, command = %inv, "remote policy command timed out");
                return Err(ExperimentError::RemoteDispatchFailure {
                    host,
                    detail: format!("{inv} did not finish within {:?}", self.timeout),
                });
            }
        };
        if output.success() {
            return Ok(());
        }
        warn!(
            host,
            command = %inv,
            status = ?output.status,
            stderr = %output.stderr,
            "remote policy command failed"
        );
        Err(map_remote_failure(&host, self.interface.as_deref(), inv, &output))
    }
}

/// Recover the error class from the controller's exit code.
fn map_remote_failure(
    host: &str,
    interface: Option<&str>,
    inv: &Invocation,
    output: &CommandOutput,
) -> ExperimentError {
    let iface = interface.unwrap_or("default-route interface").to_string();
    match output.status.and_then(|c| u8::try_from(c).ok()) {
        Some(EXIT_PERMISSION) => ExperimentError::PermissionDenied {
            operation: format!("{inv} on {host}"),
            detail: output.stderr.clone(),
        },
        Some(EXIT_INTERFACE) => ExperimentError::InterfaceNotFound(iface),
        Some(EXIT_POLICY_CONFLICT) => ExperimentError::PolicyConflict {
            interface: iface,
            detail: format!("on {host}: {}", output.stderr),
        },
        _ => ExperimentError::RemoteDispatchFailure {
            host: host.to_string(),
            detail: format!("{inv} exited with {:?}: {}", output.status, output.stderr),
        },
    }
}
