//! Error taxonomy shared by every experiment component.

use std::process::ExitCode;

use thiserror::Error;

pub type Result<T, E = ExperimentError> = std::result::Result<T, E>;

/// Process exit codes. Kept stable so a remote `netlab controller`
/// invocation can be mapped back onto the same error class.
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIGURATION: u8 = 2;
pub const EXIT_TOOL_MISSING: u8 = 3;
pub const EXIT_PERMISSION: u8 = 4;
pub const EXIT_CAPTURE: u8 = 5;
pub const EXIT_INTERFACE: u8 = 6;
pub const EXIT_POLICY_CONFLICT: u8 = 7;
pub const EXIT_REMOTE: u8 = 8;
pub const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Error)]
pub enum ExperimentError {
    /// Bad or missing parameter. Raised before any state is mutated.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("permission denied: {operation}: {detail}")]
    PermissionDenied { operation: String, detail: String },

    #[error("interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("policy conflict on '{interface}': {detail}")]
    PolicyConflict { interface: String, detail: String },

    #[error("capture failed to start on '{interface}': {detail}")]
    CaptureFailedToStart { interface: String, detail: String },

    #[error("a capture session is already active ({0})")]
    SessionAlreadyActive(String),

    #[error("required tool '{0}' not found in PATH")]
    ToolMissing(String),

    #[error("remote dispatch to {host} failed: {detail}")]
    RemoteDispatchFailure { host: String, detail: String },

    #[error("traffic generation failed: {0}")]
    Traffic(String),

    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExperimentError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) => EXIT_CONFIGURATION,
            Self::ToolMissing(_) => EXIT_TOOL_MISSING,
            Self::PermissionDenied { .. } => EXIT_PERMISSION,
            Self::CaptureFailedToStart { .. } | Self::SessionAlreadyActive(_) => EXIT_CAPTURE,
            Self::InterfaceNotFound(_) => EXIT_INTERFACE,
            Self::PolicyConflict { .. } => EXIT_POLICY_CONFLICT,
            Self::RemoteDispatchFailure { .. } => EXIT_REMOTE,
            Self::Traffic(_) | Self::Spawn { .. } | Self::Io(_) => EXIT_FAILURE,
        }
    }

    /// The exact command an operator can run to recover, when one exists.
    pub fn remedy(&self) -> Option<String> {
        match self {
            Self::PolicyConflict { interface, .. } => {
                Some(format!("tc qdisc del dev {interface} root"))
            }
            Self::InterfaceNotFound(_) => Some("ip -br link show".to_string()),
            Self::PermissionDenied { .. } => {
                Some("re-run as root (sudo netlab ...) or use --dry-run".to_string())
            }
            Self::ToolMissing(tool) => {
                Some(format!("install '{tool}' and make sure it is on PATH"))
            }
            Self::CaptureFailedToStart { interface, .. } => {
                Some(format!("tcpdump -i {interface} -c 1 -n"))
            }
            _ => None,
        }
    }

    /// True for conditions that must abort the whole run rather than a single phase.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::PermissionDenied { .. } | Self::ToolMissing(_)
        )
    }
}

impl From<&ExperimentError> for ExitCode {
    fn from(err: &ExperimentError) -> Self {
        ExitCode::from(err.exit_code())
    }
}
