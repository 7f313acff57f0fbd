//! Drives a run: impairment, capture, traffic and settle for each phase,
//! then an unconditional reset of the controller.
//!
//! The sequencer is the only owner of the [`ImpairmentController`] and the
//! [`CaptureSupervisor`]. Every way out of a phase (traffic finished, traffic
//! failed, interrupt) goes through the same capture stop, and every way out of
//! a run goes through [`Sequencer::finalize`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::capture::{CaptureSession, CaptureSupervisor};
use crate::config::{ExperimentPhase, RunConfig};
use crate::error::Result;
use crate::exec::CommandRunner;
use crate::impairment::ImpairmentController;
use crate::interrupt::Interrupt;
use crate::report::{ExperimentRun, PhaseOutcome, PhaseResult, SkipReason};
use crate::route;
use crate::traffic::{TrafficGenerator, TrafficReport, TrafficRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerState {
    Idle,
    ConfiguringImpairment,
    Capturing,
    GeneratingTraffic,
    TearingDown,
    Complete,
    Interrupted,
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SequencerState::Idle => "idle",
            SequencerState::ConfiguringImpairment => "configuring impairment",
            SequencerState::Capturing => "capturing",
            SequencerState::GeneratingTraffic => "generating traffic",
            SequencerState::TearingDown => "tearing down",
            SequencerState::Complete => "complete",
            SequencerState::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

pub struct Sequencer {
    config: RunConfig,
    controller: Option<ImpairmentController>,
    supervisor: CaptureSupervisor,
    traffic: Arc<dyn TrafficGenerator>,
    probe_runner: Option<Arc<dyn CommandRunner>>,
    interrupt: Interrupt,
    state: SequencerState,
}

impl Sequencer {
    pub fn new(
        config: RunConfig,
        controller: Option<ImpairmentController>,
        supervisor: CaptureSupervisor,
        traffic: Arc<dyn TrafficGenerator>,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            config,
            controller,
            supervisor,
            traffic,
            probe_runner: None,
            interrupt,
            state: SequencerState::Idle,
        }
    }

    /// Runner for the optional ping probe; only used with `probe_reachability`.
    pub fn with_probe_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.probe_runner = Some(runner);
        self
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Execute every phase in order and return the finished ledger.
    ///
    /// Only a failure to create the results directory is returned as an
    /// error; it happens before anything is mutated. Everything else is
    /// recorded in the ledger.
    pub async fn run(&mut self) -> Result<ExperimentRun> {
        let run_dir = self.config.run_dir(Local::now());
        let snapshot = serde_json::to_value(&self.config).unwrap_or_default();
        let mut run = ExperimentRun::new(run_dir.clone(), self.config.dry_run, snapshot);

        if !self.config.dry_run {
            std::fs::create_dir_all(&run_dir)?;
        }
        info!(
            dir = %run_dir.display(),
            phases = self.config.phases.len(),
            dry_run = self.config.dry_run,
            "run starting"
        );

        let phases = self.config.phases.clone();
        let mut aborted = false;
        for (idx, phase) in phases.iter().enumerate() {
            if self.interrupt.is_triggered() {
                self.note_interrupt(&mut run);
            }
            if run.interrupted || aborted {
                let reason = if aborted {
                    SkipReason::RunAborted
                } else {
                    SkipReason::RunInterrupted
                };
                run.push(skipped(phase, reason));
                continue;
            }

            let result = self.run_phase(phase, &run_dir, &mut run).await;
            let executed = !matches!(result.outcome, PhaseOutcome::Skipped { .. });
            if result.error_code.is_some_and(is_fatal_code) {
                error!(phase = %phase.name, "fatal error; remaining phases will not run");
                aborted = true;
            }
            run.push(result);

            let last = idx + 1 == phases.len();
            if executed && !last && !aborted && !run.interrupted {
                self.settle(&mut run).await;
            }
        }

        if self.interrupt.is_triggered() {
            self.note_interrupt(&mut run);
        }
        self.finalize(&mut run).await;
        run.finish();

        if !self.config.dry_run
            && let Err(err) = run.write_summary(&run_dir)
        {
            error!("could not write summary: {err}");
            run.teardown.errors.push(format!("summary not written: {err}"));
        }
        Ok(run)
    }

    async fn run_phase(
        &mut self,
        phase: &ExperimentPhase,
        run_dir: &Path,
        run: &mut ExperimentRun,
    ) -> PhaseResult {
        let mut result = PhaseResult::new(
            phase.name.clone(),
            phase.transport,
            phase.impairment.as_ref().map(ToString::to_string),
        );
        info!(phase = %phase.name, transport = %phase.transport, "phase starting");

        // (a) impairment
        if phase.requires_controller() && self.controller.is_none() {
            warn!(phase = %phase.name, "no controller configured; skipping");
            run.record(format!("{}: skipped, requires controller", phase.name));
            result.outcome = PhaseOutcome::Skipped {
                reason: SkipReason::RequiresController,
            };
            return result;
        }
        // A phase without an impairment still runs on a clean path when a
        // controller exists; the previous phase's policy must not leak in.
        if let Some(controller) = self.controller.as_mut() {
            Self::transition(
                &mut self.state,
                run,
                &phase.name,
                SequencerState::ConfiguringImpairment,
            );
            let via = controller.to_string();
            let interrupt = self.interrupt.clone();
            let step = async {
                match &phase.impairment {
                    Some(mode) => controller.apply(mode).await,
                    None => controller.reset().await,
                }
            };
            let applied = tokio::select! {
                biased;
                _ = interrupt.triggered() => None,
                res = step => Some(res),
            };
            match applied {
                None => {
                    warn!(phase = %phase.name, "interrupted while configuring impairment");
                    self.note_interrupt(run);
                    result.outcome = PhaseOutcome::Interrupted;
                    return result;
                }
                Some(Err(err)) => {
                    error!(phase = %phase.name, "impairment failed: {err}");
                    result.fail(&err);
                    return result;
                }
                Some(Ok(())) => match &phase.impairment {
                    Some(mode) => {
                        run.record(format!("{}: impairment {mode} applied via {via}", phase.name))
                    }
                    None => run.record(format!("{}: path cleared via {via}", phase.name)),
                },
            }
        }

        // (b) route
        let via = phase
            .impairment
            .as_ref()
            .and(self.config.controller.route_address());
        let route = route::resolve(self.config.sink, via);
        result.route = Some(route);
        if self.config.probe_reachability
            && let Some(runner) = &self.probe_runner
        {
            route::spawn_reachability_probe(runner.clone(), route.effective_address);
        }

        let request = TrafficRequest {
            target: route.effective_address,
            port: self.config.port,
            transport: phase.transport,
            duration: phase.duration,
            bitrate: phase.bitrate.clone(),
        };
        let stem = phase.artifact_stem(Local::now());
        let capture_file = run_dir.join(format!("{stem}.pcap"));
        let session = CaptureSession::new(
            capture_file.clone(),
            self.config.capture_interface.clone(),
            route.capture_filter(self.config.port),
        );
        result.capture_file = Some(capture_file);

        if self.config.dry_run {
            let capture = self.supervisor.settings().invocation(&session);
            let client = self.traffic.client_invocation(&request);
            info!(command = %capture, "preview: would run");
            info!(command = %client, "preview: would run");
            run.record(format!("{}: previewed `{capture}` and `{client}`", phase.name));
            result.outcome = PhaseOutcome::Previewed;
            return result;
        }

        // (c) capture
        Self::transition(&mut self.state, run, &phase.name, SequencerState::Capturing);
        let handle = match self.supervisor.start_confirmed(session).await {
            Ok(handle) => handle,
            Err(err) => {
                error!(phase = %phase.name, "{err}");
                result.fail(&err);
                return result;
            }
        };
        result.timeline.capture_started = Some(handle.started_at());

        // (d) traffic, raced against the interrupt
        Self::transition(&mut self.state, run, &phase.name, SequencerState::GeneratingTraffic);
        result.timeline.traffic_started = Some(Utc::now());
        let interrupt = self.interrupt.clone();
        let traffic = self.traffic.clone();
        let outcome = tokio::select! {
            biased;
            _ = interrupt.triggered() => None,
            report = traffic.run(&request) => Some(report),
        };
        result.timeline.traffic_ended = Some(Utc::now());
        if outcome.is_none() {
            self.note_interrupt(run);
        }

        // (e) capture stop, on every path
        Self::transition(&mut self.state, run, &phase.name, SequencerState::TearingDown);
        let grace = self.supervisor.settings().grace_period;
        let stop = self.supervisor.stop(handle, grace).await;
        result.timeline.capture_stopped = Some(Utc::now());
        result.capture_forced = stop.forced;
        if !stop.diagnostics.is_empty() {
            result.diagnostics.push(format!("capture: {}", stop.diagnostics));
        }

        match outcome {
            None => {
                warn!(phase = %phase.name, "interrupted during traffic");
                run.record(format!("{}: interrupted", phase.name));
                result.outcome = PhaseOutcome::Interrupted;
            }
            Some(Ok(report)) => {
                if let Some(path) = save_report(run_dir, &stem, &report, &mut result.diagnostics) {
                    result.report_file = Some(path);
                }
                if report.succeeded() {
                    info!(
                        phase = %phase.name,
                        bytes = report.bytes_transferred,
                        mbps = report.bits_per_second / 1e6,
                        "phase succeeded"
                    );
                    result.outcome = PhaseOutcome::Success;
                } else {
                    let reason = report.failure_reason();
                    warn!(phase = %phase.name, reason, "traffic failed");
                    result.outcome = PhaseOutcome::Failed { reason };
                }
                result.traffic = Some(report);
            }
            Some(Err(err)) => {
                warn!(phase = %phase.name, "traffic failed: {err}");
                result.fail(&err);
            }
        }
        run.record(format!("{}: {}", phase.name, result.outcome.label()));
        result
    }

    async fn settle(&mut self, run: &mut ExperimentRun) {
        let settle = self.config.settle;
        if settle.is_zero() {
            return;
        }
        if self.config.dry_run {
            info!(secs = settle.as_secs_f64(), "preview: would settle");
            return;
        }
        run.record(format!("settling for {:.1}s", settle.as_secs_f64()));
        let interrupt = self.interrupt.clone();
        tokio::select! {
            _ = tokio::time::sleep(settle) => {}
            _ = interrupt.triggered() => {
                info!("settle cut short by interrupt");
            }
        }
    }

    /// Return the controller to clean and release any remote session.
    ///
    /// Runs exactly once per run. Both steps are attempted even if the first
    /// fails; failures are recorded, never raised. The run always ends in
    /// `Complete`; an interrupted run carries `interrupted` as its
    /// partial-result marker.
    pub async fn finalize(&mut self, run: &mut ExperimentRun) {
        if self.state != SequencerState::TearingDown {
            Self::transition(&mut self.state, run, "run", SequencerState::TearingDown);
        }
        if let Some(controller) = self.controller.as_mut() {
            run.teardown.attempted = true;
            match controller.reset().await {
                Ok(()) => {
                    run.teardown.cleared = true;
                    run.record(format!("teardown: {controller} returned to clean"));
                }
                Err(err) => {
                    let hint = controller.manual_clear_hint();
                    error!("failed to clear impairment on {controller}: {err}; run `{hint}`");
                    run.teardown.errors.push(format!("clear: {err}"));
                    run.teardown.manual_remedy = Some(hint);
                }
            }
            match controller.release().await {
                Ok(()) => run.teardown.released = true,
                Err(err) => {
                    warn!("failed to release {controller}: {err}");
                    run.teardown.errors.push(format!("release: {err}"));
                }
            }
        }
        Self::transition(&mut self.state, run, "run", SequencerState::Complete);
        if run.interrupted {
            run.record("run: partial results, interrupted");
        }
    }

    /// First sighting of the interrupt: mark the run and pass through
    /// `Interrupted` on the way to teardown.
    fn note_interrupt(&mut self, run: &mut ExperimentRun) {
        if run.interrupted {
            return;
        }
        run.interrupted = true;
        Self::transition(&mut self.state, run, "run", SequencerState::Interrupted);
    }

    fn transition(
        state: &mut SequencerState,
        run: &mut ExperimentRun,
        scope: &str,
        next: SequencerState,
    ) {
        info!(scope, from = %state, to = %next, "state");
        run.record(format!("{scope}: {state} -> {next}"));
        *state = next;
    }
}

fn skipped(phase: &ExperimentPhase, reason: SkipReason) -> PhaseResult {
    let mut result = PhaseResult::new(
        phase.name.clone(),
        phase.transport,
        phase.impairment.as_ref().map(ToString::to_string),
    );
    result.outcome = PhaseOutcome::Skipped { reason };
    result
}

fn is_fatal_code(code: u8) -> bool {
    matches!(
        code,
        crate::error::EXIT_PERMISSION
            | crate::error::EXIT_CONFIGURATION
            | crate::error::EXIT_TOOL_MISSING
    )
}

fn save_report(
    run_dir: &Path,
    stem: &str,
    report: &TrafficReport,
    diagnostics: &mut Vec<String>,
) -> Option<PathBuf> {
    if report.raw.is_empty() {
        return None;
    }
    let path = run_dir.join(format!("{stem}.iperf.json"));
    match std::fs::write(&path, &report.raw) {
        Ok(()) => Some(path),
        Err(err) => {
            warn!(path = %path.display(), "could not save traffic report: {err}");
            diagnostics.push(format!("traffic report not saved: {err}"));
            None
        }
    }
}
