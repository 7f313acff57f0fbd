//! Experiment mode selection for the `source` role.

use std::fmt;

/// Which slice of the experiment catalog to run.
///
/// Each mode expands into an ordered list of phases (see
/// [`crate::config::catalog`]), one per transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExperimentMode {
    /// Baseline straight to the sink, no impairment step at all.
    Direct,

    /// Through the controller with its path explicitly reset to clean.
    Clean,

    /// Through the controller with random per-packet loss.
    Loss,

    /// Through the controller with a token-bucket rate cap.
    Bottleneck,

    /// Every phase above, in catalog order.
    #[default]
    All,
}

impl ExperimentMode {
    pub const ALL: [ExperimentMode; 5] = [
        ExperimentMode::Direct,
        ExperimentMode::Clean,
        ExperimentMode::Loss,
        ExperimentMode::Bottleneck,
        ExperimentMode::All,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ExperimentMode::Direct => "direct",
            ExperimentMode::Clean => "clean",
            ExperimentMode::Loss => "loss",
            ExperimentMode::Bottleneck => "bottleneck",
            ExperimentMode::All => "all",
        }
    }

    /// True if every phase of this mode needs an impairment controller.
    pub const fn requires_controller(self) -> bool {
        matches!(self, ExperimentMode::Loss | ExperimentMode::Bottleneck)
    }
}

impl fmt::Display for ExperimentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExperimentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExperimentMode::Direct),
            "clean" => Ok(ExperimentMode::Clean),
            "loss" => Ok(ExperimentMode::Loss),
            "bottleneck" => Ok(ExperimentMode::Bottleneck),
            "all" => Ok(ExperimentMode::All),
            _ => Err(format!(
                "invalid mode '{}': use direct, clean, loss, bottleneck, or all",
                s
            )),
        }
    }
}

impl clap::ValueEnum for ExperimentMode {
    fn value_variants<'a>() -> &'a [Self] {
        &Self::ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        let value = clap::builder::PossibleValue::new(self.as_str());
        Some(match self {
            ExperimentMode::Direct => value.help("baseline straight to the sink"),
            ExperimentMode::Clean => value.help("via controller, impairment cleared"),
            ExperimentMode::Loss => value.help("via controller, random packet loss"),
            ExperimentMode::Bottleneck => value.help("via controller, rate-limited"),
            ExperimentMode::All => value.help("every experiment in sequence"),
        })
    }
}
