//! Impairment policies and the engine that applies them with `tc`.
//!
//! A policy is one of clean, random loss (`netem loss`) or a rate cap
//! (`tbf`). Applying any policy first removes the interface's root qdisc, so
//! exactly one impairment discipline, or none, is installed at any time.
//!
//! # Modules
//!
//! - [`engine`]: the local [`PolicyEngine`] (apply / clear / verify)
//! - [`observe`]: parsing `tc qdisc show` into an [`ObservedState`]
//! - [`remote`]: dispatching policy changes to a controller host
//! - [`controller`]: the local-or-remote handle owned by the sequencer

pub mod controller;
pub mod engine;
pub mod observe;
pub mod remote;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use controller::ImpairmentController;
pub use engine::{AppliedState, EngineSettings, PolicyEngine, resolve_default_interface};
pub use observe::{DisciplineClass, ObservedState, QdiscEntry};
pub use remote::{RemoteController, RemoteExecutor, SshExecutor};

use crate::error::{ExperimentError, Result};
use crate::exec::Invocation;

pub const DEFAULT_BURST: &str = "32kbit";
pub const DEFAULT_LATENCY_MS: u64 = 400;
/// `net.ipv4.tcp_retries2` on the controller while an impairment is active.
pub const DEFAULT_TCP_RETRIES: u32 = 15;
pub const TCP_RETRIES_KEY: &str = "net.ipv4.tcp_retries2";

/// Random drop probability in percent, within (0, 100].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct LossPercent(f64);

impl LossPercent {
    pub fn new(percent: f64) -> Result<Self> {
        if percent.is_finite() && percent > 0.0 && percent <= 100.0 {
            Ok(Self(percent))
        } else {
            Err(ExperimentError::config(format!(
                "loss percentage must be in (0, 100], got {percent}"
            )))
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for LossPercent {
    type Error = ExperimentError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<LossPercent> for f64 {
    fn from(value: LossPercent) -> Self {
        value.0
    }
}

impl FromStr for LossPercent {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_end_matches('%');
        let value = trimmed
            .parse::<f64>()
            .map_err(|_| ExperimentError::config(format!("invalid loss percentage '{s}'")))?;
        Self::new(value)
    }
}

impl fmt::Display for LossPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

const RATE_UNITS: &[(&str, f64)] = &[
    ("bit", 1.0),
    ("kbit", 1e3),
    ("mbit", 1e6),
    ("gbit", 1e9),
    ("tbit", 1e12),
    ("bps", 8.0),
    ("kbps", 8e3),
    ("mbps", 8e6),
    ("gbps", 8e9),
    ("tbps", 8e12),
];

const SIZE_UNITS: &[&str] = &["b", "k", "kb", "kbit", "m", "mb", "mbit", "g", "gb", "gbit"];

/// Split "10mbit" into (10.0, "mbit"). The unit is lowercased.
fn split_quantity(s: &str) -> Option<(f64, String)> {
    let s = s.trim();
    let idx = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(idx);
    let value = num.parse::<f64>().ok()?;
    Some((value, unit.to_ascii_lowercase()))
}

/// A link rate in `tc` notation, e.g. `10mbit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rate {
    text: String,
    bits_per_sec: f64,
}

impl Rate {
    pub fn bits_per_sec(&self) -> f64 {
        self.bits_per_sec
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl FromStr for Rate {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            ExperimentError::config(format!(
                "invalid rate '{s}': expected a positive number with a unit \
                 such as 10mbit or 500kbit"
            ))
        };
        let (value, unit) = split_quantity(s).ok_or_else(invalid)?;
        let (_, scale) = RATE_UNITS
            .iter()
            .find(|(u, _)| *u == unit)
            .ok_or_else(invalid)?;
        if value <= 0.0 {
            return Err(invalid());
        }
        Ok(Self {
            text: format!("{value}{unit}"),
            bits_per_sec: value * scale,
        })
    }
}

impl TryFrom<String> for Rate {
    type Error = ExperimentError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Rate> for String {
    fn from(value: Rate) -> Self {
        value.text
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Token bucket size in `tc` notation, e.g. `32kbit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BurstSize(String);

impl FromStr for BurstSize {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            ExperimentError::config(format!(
                "invalid burst size '{s}': expected e.g. 32kbit or 4kb"
            ))
        };
        let (value, unit) = split_quantity(s).ok_or_else(invalid)?;
        if value <= 0.0 || !(unit.is_empty() || SIZE_UNITS.contains(&unit.as_str())) {
            return Err(invalid());
        }
        Ok(Self(format!("{value}{unit}")))
    }
}

impl TryFrom<String> for BurstSize {
    type Error = ExperimentError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BurstSize> for String {
    fn from(value: BurstSize) -> Self {
        value.0
    }
}

impl fmt::Display for BurstSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token bucket parameters for the bottleneck discipline.
///
/// The burst defaults to a fixed size independent of the configured rate;
/// it must stay well below one round-trip's worth of data for the limiter to
/// act as a link-rate cap rather than a deep queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShaperSettings {
    pub burst: BurstSize,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

impl Default for ShaperSettings {
    fn default() -> Self {
        Self {
            burst: BurstSize(DEFAULT_BURST.to_string()),
            latency: Duration::from_millis(DEFAULT_LATENCY_MS),
        }
    }
}

/// The three policy classes, as selected on the `controller` command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PolicyKind {
    Clean,
    Loss,
    Bottleneck,
}

/// Declarative impairment intent for one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ImpairmentMode {
    Clean,
    Loss { percent: LossPercent },
    Bottleneck { rate: Rate },
}

impl ImpairmentMode {
    /// Assemble a mode from `controller apply` arguments.
    pub fn from_parts(
        kind: PolicyKind,
        loss: Option<LossPercent>,
        rate: Option<Rate>,
    ) -> Result<Self> {
        match kind {
            PolicyKind::Clean => Ok(Self::Clean),
            PolicyKind::Loss => loss
                .map(|percent| Self::Loss { percent })
                .ok_or_else(|| ExperimentError::config("--mode loss requires --loss <percent>")),
            PolicyKind::Bottleneck => rate
                .map(|rate| Self::Bottleneck { rate })
                .ok_or_else(|| ExperimentError::config("--mode bottleneck requires --rate <rate>")),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::Clean => PolicyKind::Clean,
            Self::Loss { .. } => PolicyKind::Loss,
            Self::Bottleneck { .. } => PolicyKind::Bottleneck,
        }
    }

    /// The discipline class `verify` should observe once this mode is applied.
    pub fn expected_class(&self) -> DisciplineClass {
        match self {
            Self::Clean => DisciplineClass::None,
            Self::Loss { .. } => DisciplineClass::Loss,
            Self::Bottleneck { .. } => DisciplineClass::Shaping,
        }
    }

    /// Loss and bottleneck need a host that is allowed to mutate the path.
    pub fn requires_controller(&self) -> bool {
        !matches!(self, Self::Clean)
    }

    /// Arguments reproducing this mode on `netlab controller apply`.
    pub fn cli_args(&self) -> Vec<String> {
        match self {
            Self::Clean => vec!["--mode".into(), "clean".into()],
            Self::Loss { percent } => vec![
                "--mode".into(),
                "loss".into(),
                "--loss".into(),
                percent.get().to_string(),
            ],
            Self::Bottleneck { rate } => vec![
                "--mode".into(),
                "bottleneck".into(),
                "--rate".into(),
                rate.to_string(),
            ],
        }
    }
}

impl fmt::Display for ImpairmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => f.write_str("clean"),
            Self::Loss { percent } => write!(f, "loss {percent}"),
            Self::Bottleneck { rate } => write!(f, "bottleneck {rate}"),
        }
    }
}

/// A mode bound to the interface it governs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpairmentPolicy {
    pub mode: ImpairmentMode,
    pub interface: String,
}

impl ImpairmentPolicy {
    pub fn new(mode: ImpairmentMode, interface: impl Into<String>) -> Self {
        Self {
            mode,
            interface: interface.into(),
        }
    }

    pub fn clean(interface: impl Into<String>) -> Self {
        Self::new(ImpairmentMode::Clean, interface)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Remove whatever root qdisc is installed. "Nothing to delete" is fine.
    ClearRoot,
    /// Raise the transport retry budget on the controller.
    RetryTolerance,
    /// Install the single impairment discipline.
    Install,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    pub kind: StepKind,
    pub invocation: Invocation,
}

/// Every command needed to move `policy.interface` to `policy.mode`, in order.
///
/// Pure: preview mode reports exactly this list without executing it.
pub fn plan(policy: &ImpairmentPolicy, shaper: &ShaperSettings, tcp_retries: u32) -> Vec<PlanStep> {
    let iface = policy.interface.as_str();
    let mut steps = vec![PlanStep {
        kind: StepKind::ClearRoot,
        invocation: Invocation::new("tc").args(["qdisc", "del", "dev", iface, "root"]),
    }];

    let install_args: Vec<String> = match &policy.mode {
        ImpairmentMode::Clean => return steps,
        ImpairmentMode::Loss { percent } => {
            vec!["netem".into(), "loss".into(), percent.to_string()]
        }
        ImpairmentMode::Bottleneck { rate } => vec![
            "tbf".into(),
            "rate".into(),
            rate.to_string(),
            "burst".into(),
            shaper.burst.to_string(),
            "latency".into(),
            format!("{}ms", shaper.latency.as_millis()),
        ],
    };

    steps.push(PlanStep {
        kind: StepKind::RetryTolerance,
        invocation: Invocation::new("sysctl")
            .args(["-w".to_string(), format!("{TCP_RETRIES_KEY}={tcp_retries}")]),
    });
    steps.push(PlanStep {
        kind: StepKind::Install,
        invocation: Invocation::new("tc")
            .args(["qdisc", "add", "dev", iface, "root"])
            .args(install_args),
    });
    steps
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
