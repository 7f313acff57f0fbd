//! Capture process supervision.
//!
//! [`CaptureSupervisor`] owns at most one running capture at a time. A
//! capture is started, confirmed alive after a short delay, and stopped with
//! SIGTERM followed by SIGKILL once the grace period runs out. The same
//! `stop` path serves normal completion, traffic errors and interruption.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::error::{ExperimentError, Result};
use crate::exec::Invocation;

pub const DEFAULT_CONFIRM_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// What to record and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureSession {
    pub target_file: PathBuf,
    pub interface: String,
    pub filter: String,
    pub state: CaptureState,
}

impl CaptureSession {
    pub fn new(
        target_file: impl Into<PathBuf>,
        interface: impl Into<String>,
        filter: impl Into<String>,
    ) -> Self {
        Self {
            target_file: target_file.into(),
            interface: interface.into(),
            filter: filter.into(),
            state: CaptureState::NotStarted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureSettings {
    /// Capture tool, `tcpdump` unless overridden.
    pub program: String,
    #[serde(with = "crate::impairment::duration_ms")]
    pub confirm_delay: Duration,
    #[serde(with = "crate::impairment::duration_ms")]
    pub grace_period: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            program: "tcpdump".to_string(),
            confirm_delay: DEFAULT_CONFIRM_DELAY,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl CaptureSettings {
    /// `tcpdump -i IF -n -U -w FILE <filter>`; `-U` flushes per packet so a
    /// graceful stop leaves a complete file.
    pub fn invocation(&self, session: &CaptureSession) -> Invocation {
        let mut inv = Invocation::new(&self.program)
            .args(["-i", session.interface.as_str(), "-n", "-U", "-w"])
            .arg(session.target_file.to_string_lossy());
        if !session.filter.is_empty() {
            inv = inv.arg(session.filter.as_str());
        }
        inv
    }
}

/// Launches long-running background processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, invocation: &Invocation) -> Result<Child>;
}

/// Spawns the real tool in its own process group, stderr piped for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSpawner;

impl ProcessSpawner for SystemSpawner {
    fn spawn(&self, invocation: &Invocation) -> Result<Child> {
        let mut cmd = invocation.command();
        cmd.stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn().map_err(|source| ExperimentError::Spawn {
            program: invocation.program.clone(),
            source,
        })
    }
}

/// A running capture. Obtainable only from [`CaptureSupervisor::start`].
#[derive(Debug)]
pub struct CaptureHandle {
    session: CaptureSession,
    child: Child,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
}

impl CaptureHandle {
    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if matches!(self.session.state, CaptureState::Running | CaptureState::Stopping) {
            warn!(
                file = %self.session.target_file.display(),
                "capture handle dropped without stop; killing"
            );
            if let Some(pid) = self.pid {
                signal_group(pid, Signal::Kill);
            }
            let _ = self.child.start_kill();
        }
    }
}

/// How a capture ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub exit_code: Option<i32>,
    /// SIGKILL was needed after the grace period.
    pub forced: bool,
    /// Whatever the tool printed on stderr, e.g. tcpdump's packet counters.
    pub diagnostics: String,
}

pub struct CaptureSupervisor {
    spawner: Arc<dyn ProcessSpawner>,
    settings: CaptureSettings,
    active: Option<PathBuf>,
}

impl CaptureSupervisor {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, settings: CaptureSettings) -> Self {
        Self {
            spawner,
            settings,
            active: None,
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Launch the capture and return at once; does not wait for output.
    pub fn start(&mut self, mut session: CaptureSession) -> Result<CaptureHandle> {
        if let Some(active) = &self.active {
            return Err(ExperimentError::SessionAlreadyActive(active.display().to_string()));
        }
        let invocation = self.settings.invocation(&session);
        let child = self.spawner.spawn(&invocation)?;
        let pid = child.id();
        session.state = CaptureState::Running;
        self.active = Some(session.target_file.clone());
        info!(
            command = %invocation,
            pid,
            "capture started"
        );
        Ok(CaptureHandle {
            session,
            child,
            pid,
            started_at: Utc::now(),
        })
    }

    /// True if the process is still running after `timeout`.
    pub async fn confirm_alive(&self, handle: &mut CaptureHandle, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, handle.child.wait()).await {
            Err(_elapsed) => true,
            Ok(Ok(status)) => {
                warn!(%status, "capture process exited during liveness check");
                false
            }
            Ok(Err(err)) => {
                warn!("liveness check failed: {err}");
                false
            }
        }
    }

    /// `start` plus the mandatory liveness check after the configured delay.
    pub async fn start_confirmed(&mut self, session: CaptureSession) -> Result<CaptureHandle> {
        let interface = session.interface.clone();
        let mut handle = self.start(session)?;
        if self.confirm_alive(&mut handle, self.settings.confirm_delay).await {
            return Ok(handle);
        }
        let grace = self.settings.grace_period;
        let report = self.stop(handle, grace).await;
        let detail = if report.diagnostics.is_empty() {
            format!("capture tool exited with {:?}", report.exit_code)
        } else {
            report.diagnostics
        };
        Err(ExperimentError::CaptureFailedToStart { interface, detail })
    }

    /// Graceful stop, forced after `grace`. Never fails: problems are logged
    /// and reflected in the report.
    pub async fn stop(&mut self, mut handle: CaptureHandle, grace: Duration) -> StopReport {
        handle.session.state = CaptureState::Stopping;
        let mut forced = false;

        let status = match handle.child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                if let Some(pid) = handle.pid {
                    signal_group(pid, Signal::Term);
                }
                match tokio::time::timeout(grace, handle.child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    Ok(Err(err)) => {
                        warn!("waiting for capture to exit failed: {err}");
                        None
                    }
                    Err(_elapsed) => {
                        forced = true;
                        let grace_ms = grace.as_millis() as u64;
                        warn!(grace_ms, "capture ignored SIGTERM; killing");
                        if let Some(pid) = handle.pid {
                            signal_group(pid, Signal::Kill);
                        }
                        let _ = handle.child.kill().await;
                        handle.child.wait().await.ok()
                    }
                }
            }
        };

        let diagnostics = read_stderr(&mut handle.child).await;
        handle.session.state = CaptureState::Stopped;
        self.active = None;

        let exit_code = status.and_then(|s| s.code());
        info!(
            file = %handle.session.target_file.display(),
            exit_code,
            forced,
            "capture stopped"
        );
        StopReport {
            exit_code,
            forced,
            diagnostics,
        }
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut buf = String::new();
    // Grandchildren may still hold the pipe open; don't wait on them.
    match tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => debug!("reading capture stderr failed: {err}"),
        Err(_) => debug!("capture stderr still open after exit"),
    }
    buf.trim().to_string()
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signal the process group led by `pid`, falling back to the process itself.
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) only reads its integer arguments.
    let rc = unsafe { libc::kill(-pid, sig) };
    if rc != 0 {
        // SAFETY: as above.
        unsafe { libc::kill(pid, sig) };
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::StandInSpawner;

    fn supervisor(spawner: StandInSpawner) -> CaptureSupervisor {
        CaptureSupervisor::new(
            Arc::new(spawner),
            CaptureSettings {
                program: "tcpdump".into(),
                confirm_delay: Duration::from_millis(200),
                grace_period: Duration::from_millis(500),
            },
        )
    }

    fn session() -> CaptureSession {
        CaptureSession::new("/tmp/exp1_baseline_tcp_x.pcap", "eth0", "host 10.0.0.2 and port 5201")
    }

    #[test]
    fn test_invocation_shape() {
        let inv = CaptureSettings::default().invocation(&session());
        assert_eq!(
            inv.to_string(),
            "tcpdump -i eth0 -n -U -w /tmp/exp1_baseline_tcp_x.pcap 'host 10.0.0.2 and port 5201'"
        );
    }

    #[tokio::test]
    async fn test_start_confirm_stop_graceful() {
        let mut sup = supervisor(StandInSpawner::long_running());
        let mut handle = sup.start_confirmed(session()).await.unwrap();
        assert_eq!(handle.session().state, CaptureState::Running);
        assert!(handle.is_alive());
        assert!(sup.is_active());

        let report = sup.stop(handle, Duration::from_secs(2)).await;
        assert!(!report.forced);
        assert!(!sup.is_active());
    }

    #[tokio::test]
    async fn test_second_session_rejected_while_active() {
        let mut sup = supervisor(StandInSpawner::long_running());
        let handle = sup.start(session()).unwrap();
        let err = sup.start(session()).unwrap_err();
        assert!(matches!(err, ExperimentError::SessionAlreadyActive(_)));
        sup.stop(handle, Duration::from_secs(2)).await;
        let handle = sup.start(session()).unwrap();
        sup.stop(handle, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_dead_capture_fails_to_start() {
        let mut sup = supervisor(StandInSpawner::exits_immediately());
        let err = sup.start_confirmed(session()).await.unwrap_err();
        match err {
            ExperimentError::CaptureFailedToStart { interface, detail } => {
                assert_eq!(interface, "eth0");
                assert!(detail.contains("no such device"), "detail: {detail}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!sup.is_active());
    }

    #[tokio::test]
    async fn test_stop_forces_kill_when_term_ignored() {
        let mut sup = supervisor(StandInSpawner::ignores_term());
        let handle = sup.start_confirmed(session()).await.unwrap();
        let report = sup.stop(handle, Duration::from_millis(300)).await;
        assert!(report.forced);
        assert_eq!(report.exit_code, None);
    }
}
