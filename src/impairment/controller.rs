use std::fmt;

use tracing::warn;

use super::{ImpairmentMode, PolicyEngine, RemoteController};
use crate::error::Result;

/// The single handle through which a run mutates path impairment.
///
/// Either an engine acting on this host's interface or a client dispatching
/// to the controller host. The sequencer owns exactly one of these.
pub enum ImpairmentController {
    Local(PolicyEngine),
    Remote(RemoteController),
}

impl ImpairmentController {
    pub async fn apply(&mut self, mode: &ImpairmentMode) -> Result<()> {
        match self {
            Self::Local(engine) => {
                let policy = engine.policy(mode.clone());
                engine.apply(&policy).await?;
                // Mismatches are logged by verify; they never fail the apply.
                if let Err(err) = engine.verify(engine.interface()).await {
                    warn!("verification after apply failed: {err}");
                }
                Ok(())
            }
            Self::Remote(remote) => remote.apply(mode).await,
        }
    }

    /// Return the path to the clean policy.
    pub async fn reset(&mut self) -> Result<()> {
        match self {
            Self::Local(engine) => {
                let iface = engine.interface().to_string();
                engine.clear(&iface).await
            }
            Self::Remote(remote) => remote.clear().await,
        }
    }

    /// Drop any remote session. No-op for a local engine.
    pub async fn release(&mut self) -> Result<()> {
        match self {
            Self::Local(_) => Ok(()),
            Self::Remote(remote) => remote.release().await,
        }
    }

    /// Shell command an operator can run to clear the policy by hand.
    pub fn manual_clear_hint(&self) -> String {
        match self {
            Self::Local(engine) => format!("tc qdisc del dev {} root", engine.interface()),
            Self::Remote(remote) => format!(
                "on {}: netlab controller clear (or tc qdisc del dev <interface> root)",
                remote.host()
            ),
        }
    }
}

impl fmt::Display for ImpairmentController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(engine) => write!(f, "local:{}", engine.interface()),
            Self::Remote(remote) => write!(f, "remote:{}", remote.host()),
        }
    }
}
