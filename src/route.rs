//! Where a phase sends its traffic and what the capture should match.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::exec::{CommandRunner, Invocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    Direct,
    ViaController,
}

impl fmt::Display for RouteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMode::Direct => f.write_str("direct"),
            RouteMode::ViaController => f.write_str("via-controller"),
        }
    }
}

/// Derived once per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteTarget {
    pub sink_address: IpAddr,
    pub effective_address: IpAddr,
    pub mode: RouteMode,
}

impl RouteTarget {
    /// `host H and port P` on the effective address.
    pub fn capture_filter(&self, port: u16) -> String {
        format!("host {} and port {}", self.effective_address, port)
    }
}

/// Pure: the controller, when present, becomes the effective target.
pub fn resolve(sink: IpAddr, controller: Option<IpAddr>) -> RouteTarget {
    match controller {
        Some(controller) => RouteTarget {
            sink_address: sink,
            effective_address: controller,
            mode: RouteMode::ViaController,
        },
        None => RouteTarget {
            sink_address: sink,
            effective_address: sink,
            mode: RouteMode::Direct,
        },
    }
}

/// Filter for the sink side, which does not know the peer address.
pub fn port_filter(port: u16) -> String {
    format!("port {port}")
}

pub fn ping_invocation(target: IpAddr) -> Invocation {
    Invocation::new("ping").args(["-c", "1", "-W", "1"]).arg(target.to_string())
}

/// Fire one ping at `target` in the background; a failure is only logged.
pub fn spawn_reachability_probe(runner: Arc<dyn CommandRunner>, target: IpAddr) {
    tokio::spawn(async move {
        let probe = ping_invocation(target);
        let outcome = tokio::time::timeout(Duration::from_secs(3), runner.run(&probe)).await;
        match outcome {
            Ok(Ok(out)) if out.success() => debug!(%target, "reachability probe ok"),
            Ok(Ok(out)) => warn!(%target, status = ?out.status, "target did not answer ping"),
            Ok(Err(err)) => warn!(%target, "reachability probe failed: {err}"),
            Err(_) => warn!(%target, "reachability probe timed out"),
        }
    });
}
