//! Per-run results ledger and the summary written at the end of a run.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::{EXIT_FAILURE, EXIT_INTERRUPTED, ExperimentError, Result};
use crate::route::RouteTarget;
use crate::traffic::{TrafficReport, Transport};

pub const SUMMARY_JSON: &str = "summary.json";
pub const SUMMARY_TEXT: &str = "summary.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Loss or bottleneck phase with no controller configured.
    RequiresController,
    /// The run was interrupted before the phase started.
    RunInterrupted,
    /// An earlier phase hit an error that stops the whole run.
    RunAborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Success,
    Failed { reason: String },
    Skipped { reason: SkipReason },
    Interrupted,
    /// Dry run: commands were computed and printed, nothing was executed.
    Previewed,
}

impl PhaseOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PhaseOutcome::Success => "success",
            PhaseOutcome::Failed { .. } => "failed",
            PhaseOutcome::Skipped { .. } => "skipped",
            PhaseOutcome::Interrupted => "interrupted",
            PhaseOutcome::Previewed => "previewed",
        }
    }
}

/// Wall-clock stamps of the four ordering points of a phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTimeline {
    pub capture_started: Option<DateTime<Utc>>,
    pub traffic_started: Option<DateTime<Utc>>,
    pub traffic_ended: Option<DateTime<Utc>>,
    pub capture_stopped: Option<DateTime<Utc>>,
}

impl PhaseTimeline {
    /// Capture started before traffic, traffic ended before capture stopped.
    /// Missing stamps are ignored.
    pub fn is_ordered(&self) -> bool {
        let pairs = [
            (self.capture_started, self.traffic_started),
            (self.traffic_started, self.traffic_ended),
            (self.traffic_ended, self.capture_stopped),
            (self.capture_started, self.capture_stopped),
        ];
        pairs.iter().all(|pair| match pair {
            (Some(a), Some(b)) => a <= b,
            _ => true,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseResult {
    pub name: String,
    pub transport: Transport,
    pub impairment: Option<String>,
    pub outcome: PhaseOutcome,
    pub route: Option<RouteTarget>,
    pub capture_file: Option<PathBuf>,
    pub report_file: Option<PathBuf>,
    pub traffic: Option<TrafficReport>,
    pub timeline: PhaseTimeline,
    /// Capture had to be SIGKILLed.
    pub capture_forced: bool,
    /// Free-form diagnostics: tool stderr, errors and remedies.
    pub diagnostics: Vec<String>,
    /// Exit code class of the error that failed the phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u8>,
}

impl PhaseResult {
    pub fn new(name: impl Into<String>, transport: Transport, impairment: Option<String>) -> Self {
        Self {
            name: name.into(),
            transport,
            impairment,
            outcome: PhaseOutcome::Failed {
                reason: "phase did not complete".into(),
            },
            route: None,
            capture_file: None,
            report_file: None,
            traffic: None,
            timeline: PhaseTimeline::default(),
            capture_forced: false,
            diagnostics: Vec::new(),
            error_code: None,
        }
    }

    /// Mark failed by `err`, keeping its remedy as a diagnostic.
    pub fn fail(&mut self, err: &ExperimentError) {
        self.outcome = PhaseOutcome::Failed {
            reason: err.to_string(),
        };
        self.error_code = Some(err.exit_code());
        if let Some(remedy) = err.remedy() {
            self.diagnostics.push(format!("remedy: {remedy}"));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Result of the unconditional clean-policy finalizer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownResult {
    /// Whether a controller existed to reset.
    pub attempted: bool,
    pub cleared: bool,
    pub released: bool,
    pub errors: Vec<String>,
    /// Printed when clearing failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_remedy: Option<String>,
}

impl TeardownResult {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Ledger for one invocation of the sequencer.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results_dir: PathBuf,
    pub dry_run: bool,
    /// Config snapshot, serialized once at the start.
    pub config: serde_json::Value,
    pub phases: Vec<PhaseResult>,
    pub log: Vec<LogEntry>,
    pub interrupted: bool,
    pub teardown: TeardownResult,
}

impl ExperimentRun {
    pub fn new(results_dir: PathBuf, dry_run: bool, config: serde_json::Value) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            results_dir,
            dry_run,
            config,
            phases: Vec::new(),
            log: Vec::new(),
            interrupted: false,
            teardown: TeardownResult::default(),
        }
    }

    pub fn record(&mut self, message: impl Into<String>) {
        self.log.push(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    pub fn push(&mut self, result: PhaseResult) {
        self.phases.push(result);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn count(&self, label: &str) -> usize {
        self.phases.iter().filter(|p| p.outcome.label() == label).count()
    }

    /// Process exit status for the whole run.
    ///
    /// Interruption wins, then the first phase that failed on a capture or
    /// permission error, then a failed finalizer. Otherwise the run succeeds if
    /// at least one phase ran (or was previewed); skipped phases alone do not
    /// fail a run.
    pub fn exit_code(&self) -> u8 {
        if self.interrupted {
            return EXIT_INTERRUPTED;
        }
        let fatal = self.phases.iter().find_map(|p| {
            p.error_code.filter(|code| {
                matches!(*code, crate::error::EXIT_CAPTURE | crate::error::EXIT_PERMISSION)
            })
        });
        if let Some(code) = fatal {
            return code;
        }
        if !self.teardown.succeeded() {
            return EXIT_FAILURE;
        }
        let ran = self
            .phases
            .iter()
            .any(|p| matches!(p.outcome, PhaseOutcome::Success | PhaseOutcome::Previewed));
        let only_skipped = self
            .phases
            .iter()
            .all(|p| matches!(p.outcome, PhaseOutcome::Skipped { .. }));
        if ran || only_skipped { 0 } else { EXIT_FAILURE }
    }

    /// Write `summary.json` and `summary.txt` into the run directory.
    pub fn write_summary(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let json_path = dir.join(SUMMARY_JSON);
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| ExperimentError::Io(std::io::Error::other(err)))?;
        std::fs::write(&json_path, json)?;
        let text_path = dir.join(SUMMARY_TEXT);
        std::fs::write(&text_path, self.render_text())?;
        info!(dir = %dir.display(), "summary written");
        Ok((json_path, text_path))
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "netlab run started {}", self.started_at.to_rfc3339());
        if let Some(finished) = self.finished_at {
            let _ = writeln!(out, "finished {}", finished.to_rfc3339());
        }
        let _ = writeln!(out, "results: {}", self.results_dir.display());
        if self.dry_run {
            let _ = writeln!(out, "dry run: nothing was executed");
        }
        if self.interrupted {
            let _ = writeln!(out, "INTERRUPTED: partial results");
        }
        out.push('\n');

        for phase in &self.phases {
            let impairment = phase.impairment.as_deref().unwrap_or("none");
            let _ = write!(
                out,
                "{:<24} {:<4} {:<20} {}",
                phase.name,
                phase.transport,
                impairment,
                phase.outcome.label()
            );
            match &phase.outcome {
                PhaseOutcome::Failed { reason } => {
                    let _ = write!(out, ": {reason}");
                }
                PhaseOutcome::Skipped { reason } => {
                    let _ = write!(out, ": {reason:?}");
                }
                _ => {}
            }
            out.push('\n');
            if let Some(route) = &phase.route {
                let _ = writeln!(out, "    route: {} -> {}", route.mode, route.effective_address);
            }
            if let Some(file) = &phase.capture_file {
                let _ = writeln!(out, "    capture: {}", file.display());
            }
            if let Some(traffic) = &phase.traffic {
                let _ = write!(
                    out,
                    "    traffic: {} bytes, {:.2} Mbit/s",
                    traffic.bytes_transferred,
                    traffic.bits_per_second / 1e6
                );
                if let Some(lost) = traffic.lost_percent {
                    let _ = write!(out, ", {lost:.2}% lost");
                }
                if let Some(retr) = traffic.retransmits {
                    let _ = write!(out, ", {retr} retransmits");
                }
                out.push('\n');
            }
            if phase.capture_forced {
                let _ = writeln!(out, "    capture was killed after the grace period");
            }
            for line in &phase.diagnostics {
                let _ = writeln!(out, "    {line}");
            }
        }

        out.push('\n');
        let _ = writeln!(
            out,
            "{} succeeded, {} failed, {} skipped, {} interrupted, {} previewed",
            self.count("success"),
            self.count("failed"),
            self.count("skipped"),
            self.count("interrupted"),
            self.count("previewed"),
        );
        if self.teardown.attempted {
            if self.teardown.succeeded() {
                let _ = writeln!(out, "teardown: controller returned to clean");
            } else {
                let _ = writeln!(out, "teardown FAILED: {}", self.teardown.errors.join("; "));
                if let Some(remedy) = &self.teardown.manual_remedy {
                    let _ = writeln!(out, "    run manually: {remedy}");
                }
            }
        }
        out
    }
}
