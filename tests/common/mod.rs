//! Shared utilities for privileged integration tests.
#![allow(dead_code)]

use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use netlab::exec::{CommandOutput, CommandRunner, Invocation, SystemRunner};
use netlab::impairment::{EngineSettings, PolicyEngine};
use network_sim::{Namespace, Testbed, check_privileges, has_tool};

/// Returns `true` if tests should be skipped (prints the reason to stderr).
/// Use at the top of every test.
pub fn skip_without_privileges() -> bool {
    if !check_privileges() {
        eprintln!("Skipping: needs ip, tc and passwordless sudo");
        return true;
    }
    false
}

/// Like `skip_without_privileges` but also requires the netem/tbf modules
/// and `ping`.
pub fn skip_without_impairment_deps() -> bool {
    if skip_without_privileges() {
        return true;
    }
    if !has_tool("ping") {
        eprintln!("Skipping: ping not installed");
        return true;
    }
    let probe = match Namespace::new(&network_sim::unique_ns_name("nlprobe")) {
        Ok(ns) => ns,
        Err(err) => {
            eprintln!("Skipping: cannot create a namespace: {err:#}");
            return true;
        }
    };
    let netem = probe
        .exec("tc", &["qdisc", "add", "dev", "lo", "root", "netem", "loss", "1%"])
        .is_ok_and(|o| o.status.success());
    if !netem {
        eprintln!("Skipping: sch_netem not available");
    }
    !netem
}

/// Runs every invocation inside a namespace through `sudo ip netns exec`.
pub struct NetnsRunner {
    prefix: Vec<String>,
}

impl NetnsRunner {
    pub fn new(ns: &Namespace) -> Arc<Self> {
        Arc::new(Self {
            prefix: ns.exec_prefix(),
        })
    }

    fn wrap(&self, invocation: &Invocation) -> Invocation {
        Invocation::new(&self.prefix[0])
            .args(self.prefix[1..].iter().cloned())
            .args(invocation.argv())
    }
}

#[async_trait]
impl CommandRunner for NetnsRunner {
    async fn run(&self, invocation: &Invocation) -> netlab::Result<CommandOutput> {
        SystemRunner.run(&self.wrap(invocation)).await
    }
}

/// A real engine bound to the controller's sink-facing interface.
pub async fn controller_engine(bed: &Testbed) -> PolicyEngine {
    let settings = EngineSettings {
        interface: Some(bed.controller_egress.clone()),
        ..EngineSettings::default()
    };
    PolicyEngine::new(NetnsRunner::new(&bed.controller), settings)
        .await
        .expect("engine on controller")
}

/// Run the netlab binary inside `ns`.
pub fn netlab_in(ns: &Namespace, args: &[&str]) -> Output {
    ns.exec(env!("CARGO_BIN_EXE_netlab"), args)
        .expect("run netlab in namespace")
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn dump_output(output: &Output) {
    eprintln!("--- netlab stdout ---");
    eprintln!("{}", String::from_utf8_lossy(&output.stdout));
    eprintln!("--- netlab stderr ---");
    eprintln!("{}", String::from_utf8_lossy(&output.stderr));
}
