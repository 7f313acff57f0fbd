use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::observe::ObservedState;
use super::{
    DEFAULT_TCP_RETRIES, ImpairmentMode, ImpairmentPolicy, PlanStep, ShaperSettings, StepKind, plan,
};
use crate::error::{ExperimentError, Result};
use crate::exec::{CommandOutput, CommandRunner, Invocation};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSettings {
    /// Interface to impair. `None` selects the default-route interface.
    pub interface: Option<String>,
    pub shaper: ShaperSettings,
    pub tcp_retries: u32,
    /// Compute and report every command without running the mutating ones.
    pub preview: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            interface: None,
            shaper: ShaperSettings::default(),
            tcp_retries: DEFAULT_TCP_RETRIES,
            preview: false,
        }
    }
}

/// Result of a successful `apply`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedState {
    pub policy: ImpairmentPolicy,
    /// Every command of the plan, in order, whether executed or previewed.
    pub commands: Vec<Invocation>,
    pub preview: bool,
}

/// Sole owner of the impairment state of one host's interfaces.
///
/// Mutating methods take `&mut self`: whoever holds the engine is the only
/// party allowed to change path state.
pub struct PolicyEngine {
    runner: Arc<dyn CommandRunner>,
    settings: EngineSettings,
    interface: String,
    requested: HashMap<String, ImpairmentMode>,
}

impl PolicyEngine {
    /// Build an engine, resolving the target interface up front.
    ///
    /// A missing default route is a configuration error, never a silent
    /// fallback to some other interface.
    pub async fn new(runner: Arc<dyn CommandRunner>, settings: EngineSettings) -> Result<Self> {
        let interface = match settings.interface.as_deref() {
            Some(iface) if !iface.trim().is_empty() => iface.trim().to_string(),
            Some(_) => return Err(ExperimentError::config("interface name must not be empty")),
            None => resolve_default_interface(runner.as_ref()).await?,
        };
        debug!(interface, preview = settings.preview, "policy engine ready");
        Ok(Self {
            runner,
            settings,
            interface,
            requested: HashMap::new(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Bind `mode` to this engine's interface.
    pub fn policy(&self, mode: ImpairmentMode) -> ImpairmentPolicy {
        ImpairmentPolicy::new(mode, self.interface.clone())
    }

    /// Clear the interface, then install `policy`. Idempotent.
    pub async fn apply(&mut self, policy: &ImpairmentPolicy) -> Result<AppliedState> {
        let iface = policy.interface.trim();
        if iface.is_empty() {
            return Err(ExperimentError::PolicyConflict {
                interface: String::new(),
                detail: "policy has no resolved interface".into(),
            });
        }
        self.ensure_interface(iface).await?;

        let steps = plan(policy, &self.settings.shaper, self.settings.tcp_retries);
        for step in &steps {
            self.execute(iface, step).await?;
        }

        info!(
            interface = iface,
            policy = %policy.mode,
            preview = self.settings.preview,
            "impairment policy applied"
        );
        self.requested.insert(iface.to_string(), policy.mode.clone());

        Ok(AppliedState {
            policy: policy.clone(),
            commands: steps.into_iter().map(|s| s.invocation).collect(),
            preview: self.settings.preview,
        })
    }

    /// Remove any impairment from `interface`.
    pub async fn clear(&mut self, interface: &str) -> Result<()> {
        self.apply(&ImpairmentPolicy::clean(interface)).await.map(|_| ())
    }

    /// Report what is actually installed on `interface`. Never corrects.
    pub async fn verify(&self, interface: &str) -> Result<ObservedState> {
        let show = Invocation::new("tc").args(["qdisc", "show", "dev", interface]);
        let output = self.runner.run(&show).await?;
        if !output.success() {
            return Err(classify_failure(interface, &show, &output));
        }
        let requested = self.requested.get(interface).map(ImpairmentMode::expected_class);
        let observed = ObservedState::from_tc_output(interface, &output.stdout, requested);
        if observed.matches() == Some(false) && !self.settings.preview {
            warn!(
                interface,
                observed = observed.class().as_str(),
                requested = requested.map(|c| c.as_str()),
                "installed discipline does not match the requested policy"
            );
        }
        Ok(observed)
    }

    /// Read-only existence probe, also run in preview mode.
    async fn ensure_interface(&self, iface: &str) -> Result<()> {
        let probe = Invocation::new("ip").args(["link", "show", "dev", iface]);
        let output = self.runner.run(&probe).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_failure(iface, &probe, &output))
        }
    }

    async fn execute(&self, iface: &str, step: &PlanStep) -> Result<()> {
        if self.settings.preview {
            info!(command = %step.invocation, "preview: would run");
            return Ok(());
        }

        let output = self.runner.run(&step.invocation).await?;
        if output.success() {
            return Ok(());
        }
        if step.kind == StepKind::ClearRoot && nothing_to_delete(&output.stderr) {
            debug!(interface = iface, "no root qdisc to remove");
            return Ok(());
        }
        Err(classify_failure(iface, &step.invocation, &output))
    }
}

/// `tc qdisc del` on an interface that only has the kernel default.
fn nothing_to_delete(stderr: &str) -> bool {
    stderr.contains("No such file or directory")
        || stderr.contains("Cannot delete qdisc with handle of zero")
        || stderr.contains("Invalid handle")
}

fn classify_failure(
    iface: &str,
    invocation: &Invocation,
    output: &CommandOutput,
) -> ExperimentError {
    let stderr = output.stderr.trim();
    if stderr.contains("Operation not permitted")
        || stderr.to_lowercase().contains("permission denied")
    {
        ExperimentError::PermissionDenied {
            operation: invocation.to_string(),
            detail: stderr.to_string(),
        }
    } else if stderr.contains("Cannot find device") || stderr.contains("does not exist") {
        ExperimentError::InterfaceNotFound(iface.to_string())
    } else {
        ExperimentError::PolicyConflict {
            interface: iface.to_string(),
            detail: format!("{invocation} exited with {:?}: {stderr}", output.status),
        }
    }
}

/// Interface carrying the default route, from `ip route show default`.
pub async fn resolve_default_interface(runner: &dyn CommandRunner) -> Result<String> {
    let probe = Invocation::new("ip").args(["route", "show", "default"]);
    let output = runner.run(&probe).await?;
    if !output.success() {
        return Err(ExperimentError::config(format!(
            "cannot read the default route ({probe}): {}",
            output.stderr
        )));
    }
    parse_default_route(&output.stdout).ok_or_else(|| {
        ExperimentError::config("no default route found; pass --interface explicitly")
    })
}

/// Extract `eth0` from `default via 10.0.0.1 dev eth0 proto dhcp metric 100`.
pub fn parse_default_route(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "default" {
            return None;
        }
        tokens
            .skip_while(|t| *t != "dev")
            .nth(1)
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_route() {
        assert_eq!(
            parse_default_route("default via 10.0.0.1 dev eth0 proto dhcp metric 100\n").as_deref(),
            Some("eth0")
        );
        assert_eq!(
            parse_default_route("default dev wg0 scope link\n").as_deref(),
            Some("wg0")
        );
        assert_eq!(parse_default_route(""), None);
        assert_eq!(parse_default_route("10.0.0.0/24 dev eth1 proto kernel\n"), None);
    }

    #[test]
    fn test_classify_failure() {
        let inv = Invocation::new("tc").args(["qdisc", "add", "dev", "eth0", "root", "netem"]);
        let perm = CommandOutput::failed(2, "RTNETLINK answers: Operation not permitted");
        assert!(matches!(
            classify_failure("eth0", &inv, &perm),
            ExperimentError::PermissionDenied { .. }
        ));

        let missing = CommandOutput::failed(1, "Cannot find device \"eth9\"");
        assert!(matches!(
            classify_failure("eth9", &inv, &missing),
            ExperimentError::InterfaceNotFound(i) if i == "eth9"
        ));

        let busy = CommandOutput::failed(2, "Error: Exclusivity flag on, cannot modify.");
        assert!(matches!(
            classify_failure("eth0", &inv, &busy),
            ExperimentError::PolicyConflict { .. }
        ));
    }

    #[test]
    fn test_nothing_to_delete_variants() {
        assert!(nothing_to_delete("Error: Cannot delete qdisc with handle of zero."));
        assert!(nothing_to_delete("RTNETLINK answers: No such file or directory"));
        assert!(!nothing_to_delete("RTNETLINK answers: Operation not permitted"));
    }
}
