//! Run configuration for the `source` role.
//!
//! A run is an ordered list of [`ExperimentPhase`]s, either expanded from the
//! built-in catalog for an [`ExperimentMode`] or read from a TOML plan file.
//! Everything is checked once by [`RunConfig::validate`] before the first
//! command that could change host state.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureSettings;
use crate::error::{ExperimentError, Result};
use crate::impairment::{EngineSettings, ImpairmentMode, LossPercent, Rate};
use crate::mode::ExperimentMode;
use crate::traffic::{DEFAULT_DURATION, DEFAULT_PORT, DEFAULT_UDP_BITRATE, Transport};

pub const DEFAULT_LOSS_PERCENT: f64 = 1.0;
pub const DEFAULT_BOTTLENECK_RATE: &str = "10mbit";
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(5);
pub const DEFAULT_RESULTS_DIR: &str = "results";
/// Capture on every interface unless told otherwise.
pub const DEFAULT_CAPTURE_INTERFACE: &str = "any";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One trial: a transport, an optional impairment and a duration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentPhase {
    pub name: String,
    /// Leading part of every artifact name, e.g. `exp1_baseline`.
    pub output_prefix: String,
    pub transport: Transport,
    /// `None` sends straight to the sink with no impairment step.
    pub impairment: Option<ImpairmentMode>,
    #[serde(with = "crate::impairment::duration_ms")]
    pub duration: Duration,
    /// Offered load, UDP only.
    pub bitrate: Option<String>,
}

impl ExperimentPhase {
    /// Loss and bottleneck phases cannot run without a controller.
    pub fn requires_controller(&self) -> bool {
        self.impairment
            .as_ref()
            .is_some_and(ImpairmentMode::requires_controller)
    }

    /// `<prefix>_<transport>_<YYYYMMDD_HHMMSS>`
    pub fn artifact_stem(&self, at: DateTime<Local>) -> String {
        format!(
            "{}_{}_{}",
            self.output_prefix,
            self.transport,
            at.format(TIMESTAMP_FORMAT)
        )
    }
}

/// Parameters used when expanding the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseDefaults {
    pub duration: Duration,
    pub udp_bitrate: String,
    pub loss: LossPercent,
    pub bottleneck_rate: Rate,
}

impl PhaseDefaults {
    pub fn new(
        duration: Duration,
        udp_bitrate: impl Into<String>,
        loss: LossPercent,
        bottleneck_rate: Rate,
    ) -> Self {
        Self {
            duration,
            udp_bitrate: udp_bitrate.into(),
            loss,
            bottleneck_rate,
        }
    }

    pub fn standard() -> Result<Self> {
        Ok(Self::new(
            DEFAULT_DURATION,
            DEFAULT_UDP_BITRATE,
            LossPercent::new(DEFAULT_LOSS_PERCENT)?,
            DEFAULT_BOTTLENECK_RATE.parse()?,
        ))
    }

    fn pair(&self, prefix: &str, impairment: Option<ImpairmentMode>) -> [ExperimentPhase; 2] {
        let phase = |transport: Transport| ExperimentPhase {
            name: format!("{prefix}_{transport}"),
            output_prefix: prefix.to_string(),
            transport,
            impairment: impairment.clone(),
            duration: self.duration,
            bitrate: (transport == Transport::Udp).then(|| self.udp_bitrate.clone()),
        };
        [phase(Transport::Tcp), phase(Transport::Udp)]
    }
}

/// The built-in phase list for `mode`: a TCP and a UDP trial per experiment.
pub fn catalog(mode: ExperimentMode, defaults: &PhaseDefaults) -> Vec<ExperimentPhase> {
    let baseline = || defaults.pair("exp1_baseline", None);
    let clean = || defaults.pair("exp2_clean", Some(ImpairmentMode::Clean));
    let loss = || {
        defaults.pair(
            "exp3_loss",
            Some(ImpairmentMode::Loss {
                percent: defaults.loss,
            }),
        )
    };
    let bottleneck = || {
        defaults.pair(
            "exp4_bottleneck",
            Some(ImpairmentMode::Bottleneck {
                rate: defaults.bottleneck_rate.clone(),
            }),
        )
    };

    match mode {
        ExperimentMode::Direct => baseline().to_vec(),
        ExperimentMode::Clean => clean().to_vec(),
        ExperimentMode::Loss => loss().to_vec(),
        ExperimentMode::Bottleneck => bottleneck().to_vec(),
        ExperimentMode::All => [baseline(), clean(), loss(), bottleneck()]
            .into_iter()
            .flatten()
            .collect(),
    }
}

/// A custom phase list read from TOML.
///
/// ```toml
/// settle_secs = 10
///
/// [[phase]]
/// name = "heavy_loss_tcp"
/// output_prefix = "loss5"
/// transport = "tcp"
/// duration_secs = 30
///
/// [phase.impairment]
/// mode = "loss"
/// percent = 5.0
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub settle_secs: Option<u64>,
    #[serde(rename = "phase", default)]
    pub phases: Vec<PlanPhase>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanPhase {
    pub name: String,
    pub output_prefix: Option<String>,
    pub transport: Transport,
    pub duration_secs: Option<u64>,
    pub bitrate: Option<String>,
    pub impairment: Option<ImpairmentMode>,
}

impl PlanFile {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|err| ExperimentError::config(format!("invalid plan file: {err}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            ExperimentError::config(format!("cannot read plan file {}: {err}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Fill omitted fields from `defaults`.
    pub fn into_phases(self, defaults: &PhaseDefaults) -> Vec<ExperimentPhase> {
        self.phases
            .into_iter()
            .map(|p| {
                let bitrate = match p.transport {
                    Transport::Udp => {
                        Some(p.bitrate.unwrap_or_else(|| defaults.udp_bitrate.clone()))
                    }
                    Transport::Tcp => None,
                };
                ExperimentPhase {
                    output_prefix: p.output_prefix.unwrap_or_else(|| p.name.clone()),
                    name: p.name,
                    transport: p.transport,
                    impairment: p.impairment,
                    duration: p.duration_secs.map_or(defaults.duration, Duration::from_secs),
                    bitrate,
                }
            })
            .collect()
    }
}

/// Where impairment policy is applied, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ControllerTarget {
    /// No controller: impaired phases are skipped.
    None,
    /// This host impairs its own egress interface.
    Local,
    /// A separate in-path host, reached over ssh.
    Remote {
        address: IpAddr,
        user: String,
        /// `netlab` binary on the controller.
        program: String,
    },
}

impl ControllerTarget {
    pub fn is_configured(&self) -> bool {
        !matches!(self, ControllerTarget::None)
    }

    /// Address traffic is sent to when the path goes through the controller.
    pub fn route_address(&self) -> Option<IpAddr> {
        match self {
            ControllerTarget::Remote { address, .. } => Some(*address),
            ControllerTarget::None | ControllerTarget::Local => None,
        }
    }
}

/// Everything the `source` role needs for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub sink: IpAddr,
    pub port: u16,
    pub controller: ControllerTarget,
    pub engine: EngineSettings,
    pub capture: CaptureSettings,
    pub capture_interface: String,
    pub results_dir: PathBuf,
    #[serde(with = "crate::impairment::duration_ms")]
    pub settle: Duration,
    pub dry_run: bool,
    pub probe_reachability: bool,
    pub phases: Vec<ExperimentPhase>,
}

impl RunConfig {
    pub fn new(sink: IpAddr, phases: Vec<ExperimentPhase>) -> Self {
        Self {
            sink,
            port: DEFAULT_PORT,
            controller: ControllerTarget::None,
            engine: EngineSettings::default(),
            capture: CaptureSettings::default(),
            capture_interface: DEFAULT_CAPTURE_INTERFACE.to_string(),
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            settle: DEFAULT_SETTLE,
            dry_run: false,
            probe_reachability: false,
            phases,
        }
    }

    /// Reject anything that would fail halfway through the run.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ExperimentError::config("port must be non-zero"));
        }
        if self.phases.is_empty() {
            return Err(ExperimentError::config("no phases to run"));
        }
        if self.capture_interface.trim().is_empty() {
            return Err(ExperimentError::config("capture interface must not be empty"));
        }
        if self.capture.confirm_delay.is_zero() {
            return Err(ExperimentError::config("capture confirm delay must be non-zero"));
        }
        if let Some(iface) = &self.engine.interface
            && iface.trim().is_empty()
        {
            return Err(ExperimentError::config("impairment interface must not be empty"));
        }
        if self.engine.tcp_retries == 0 {
            return Err(ExperimentError::config("tcp retries must be at least 1"));
        }
        if let ControllerTarget::Remote { address, user, program } = &self.controller {
            if user.trim().is_empty() || program.trim().is_empty() {
                return Err(ExperimentError::config(
                    "remote controller needs a user and a program path",
                ));
            }
            if *address == self.sink {
                return Err(ExperimentError::config(
                    "controller address must differ from the sink address",
                ));
            }
        }

        let mut names = HashSet::new();
        let mut stems = HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return Err(ExperimentError::config("phase name must not be empty"));
            }
            if !names.insert(phase.name.as_str()) {
                return Err(ExperimentError::config(format!(
                    "duplicate phase name '{}'",
                    phase.name
                )));
            }
            if !is_file_component(&phase.output_prefix) {
                return Err(ExperimentError::config(format!(
                    "phase '{}': output prefix '{}' must be a plain file name",
                    phase.name, phase.output_prefix
                )));
            }
            if !stems.insert((phase.output_prefix.as_str(), phase.transport)) {
                return Err(ExperimentError::config(format!(
                    "phase '{}': output prefix '{}' is already used for {}",
                    phase.name, phase.output_prefix, phase.transport
                )));
            }
            if phase.duration.is_zero() {
                return Err(ExperimentError::config(format!(
                    "phase '{}': duration must be non-zero",
                    phase.name
                )));
            }
            match (phase.transport, &phase.bitrate) {
                (Transport::Udp, None) => {
                    return Err(ExperimentError::config(format!(
                        "phase '{}': UDP needs a bitrate",
                        phase.name
                    )));
                }
                (Transport::Udp, Some(b)) if b.trim().is_empty() => {
                    return Err(ExperimentError::config(format!(
                        "phase '{}': empty bitrate",
                        phase.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Name of the per-run directory, `run_<YYYYMMDD_HHMMSS>`.
    pub fn run_dir(&self, at: DateTime<Local>) -> PathBuf {
        self.results_dir
            .join(format!("run_{}", at.format(TIMESTAMP_FORMAT)))
    }
}

fn is_file_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
