//! The `sink` role: an `iperf3` server plus an optional capture, both held
//! until interrupted.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use chrono::Local;
use tokio::process::Child;
use tracing::{info, warn};

use crate::capture::{
    CaptureSession, CaptureSettings, CaptureSupervisor, ProcessSpawner, StopReport,
};
use crate::error::{ExperimentError, Result};
use crate::exec::Invocation;
use crate::interrupt::Interrupt;
use crate::route::port_filter;
use crate::traffic::Iperf3;

/// Spawns with the terminal attached, for processes whose output the
/// operator should see.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForegroundSpawner;

impl ProcessSpawner for ForegroundSpawner {
    fn spawn(&self, invocation: &Invocation) -> Result<Child> {
        let mut cmd = invocation.command();
        cmd.stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd.spawn().map_err(|source| ExperimentError::Spawn {
            program: invocation.program.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub port: u16,
    pub server: Iperf3,
    /// Record `port P` traffic on this interface into `results_dir`.
    pub capture_interface: Option<String>,
    pub results_dir: PathBuf,
    pub capture: CaptureSettings,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct SinkReport {
    pub capture_file: Option<PathBuf>,
    pub capture: Option<StopReport>,
    pub server_exit: Option<i32>,
    pub interrupted: bool,
}

pub struct Sink {
    config: SinkConfig,
    server_spawner: Arc<dyn ProcessSpawner>,
    supervisor: CaptureSupervisor,
}

impl Sink {
    pub fn new(
        config: SinkConfig,
        server_spawner: Arc<dyn ProcessSpawner>,
        capture_spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        let supervisor = CaptureSupervisor::new(capture_spawner, config.capture.clone());
        Self {
            config,
            server_spawner,
            supervisor,
        }
    }

    fn capture_session(&self) -> Option<CaptureSession> {
        let iface = self.config.capture_interface.as_ref()?;
        let file = self.config.results_dir.join(format!(
            "sink_{}_{}.pcap",
            self.config.port,
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        Some(CaptureSession::new(file, iface.clone(), port_filter(self.config.port)))
    }

    /// Serve until the server exits or `interrupt` fires. The capture, if
    /// any, is stopped through the supervisor on either path.
    pub async fn run(&mut self, interrupt: &Interrupt) -> Result<SinkReport> {
        let server = self.config.server.server_invocation(self.config.port);
        let session = self.capture_session();

        if self.config.dry_run {
            if let Some(session) = &session {
                let capture = self.supervisor.settings().invocation(session);
                info!(command = %capture, "preview: would run");
            }
            info!(command = %server, "preview: would run");
            return Ok(SinkReport::default());
        }

        let mut report = SinkReport::default();
        let handle = match session {
            Some(session) => {
                std::fs::create_dir_all(&self.config.results_dir)?;
                report.capture_file = Some(session.target_file.clone());
                Some(self.supervisor.start_confirmed(session).await?)
            }
            None => None,
        };

        let spawned = self.server_spawner.spawn(&server);
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                if let Some(handle) = handle {
                    let grace = self.supervisor.settings().grace_period;
                    report.capture = Some(self.supervisor.stop(handle, grace).await);
                }
                return Err(err);
            }
        };
        info!(port = self.config.port, "sink listening; ctrl-c to stop");

        tokio::select! {
            _ = interrupt.triggered() => {
                report.interrupted = true;
                if let Err(err) = child.kill().await {
                    warn!("failed to stop server: {err}");
                }
            }
            status = child.wait() => {
                match status {
                    Ok(status) => {
                        report.server_exit = status.code();
                        warn!(%status, "server exited on its own");
                    }
                    Err(err) => warn!("waiting for server failed: {err}"),
                }
            }
        }

        if let Some(handle) = handle {
            let grace = self.supervisor.settings().grace_period;
            report.capture = Some(self.supervisor.stop(handle, grace).await);
        }

        match report.server_exit {
            Some(code) if code != 0 && !report.interrupted => Err(ExperimentError::Traffic(format!(
                "{server} exited with status {code}"
            ))),
            _ => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_helpers::StandInSpawner;

    fn config(dir: &std::path::Path, capture: bool) -> SinkConfig {
        SinkConfig {
            port: 5201,
            server: Iperf3::default(),
            capture_interface: capture.then(|| "lo".to_string()),
            results_dir: dir.to_path_buf(),
            capture: CaptureSettings {
                program: "tcpdump".into(),
                confirm_delay: Duration::from_millis(100),
                grace_period: Duration::from_millis(500),
            },
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn test_sink_stops_capture_on_interrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Sink::new(
            config(dir.path(), true),
            Arc::new(StandInSpawner::long_running()),
            Arc::new(StandInSpawner::long_running()),
        );
        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.trigger();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), sink.run(&interrupt))
            .await
            .unwrap()
            .unwrap();
        assert!(report.interrupted);
        let capture = report.capture.unwrap();
        assert!(!capture.forced);
        let file = report.capture_file.unwrap();
        assert!(file.file_name().unwrap().to_string_lossy().starts_with("sink_5201_"));
    }

    #[tokio::test]
    async fn test_sink_dry_run_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir.path().join("never"), true);
        cfg.dry_run = true;
        let mut sink = Sink::new(
            cfg,
            Arc::new(StandInSpawner::exits_immediately()),
            Arc::new(StandInSpawner::exits_immediately()),
        );
        let report = sink.run(&Interrupt::new()).await.unwrap();
        assert!(report.capture.is_none());
        assert!(!dir.path().join("never").exists());
    }

    #[tokio::test]
    async fn test_sink_reports_server_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Sink::new(
            config(dir.path(), false),
            Arc::new(StandInSpawner::exits_immediately()),
            Arc::new(StandInSpawner::long_running()),
        );
        let err = sink.run(&Interrupt::new()).await.unwrap_err();
        assert!(matches!(err, ExperimentError::Traffic(_)));
    }
}
