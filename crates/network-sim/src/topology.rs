use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::test_util::unique_ns_name;

/// A Linux network namespace with RAII cleanup.
///
/// Creates the namespace on construction, brings up loopback, and deletes
/// it on drop. All commands inside the namespace run via `sudo ip netns exec`.
pub struct Namespace {
    pub name: String,
}

impl Namespace {
    pub fn new(name: &str) -> Result<Self> {
        // Clean up stale namespace with same name (idempotent)
        let _ = sudo(&["ip", "netns", "del", name]);

        sudo_checked(&["ip", "netns", "add", name])
            .with_context(|| format!("create netns '{name}'"))?;
        debug!(ns = name, "created network namespace");

        let _ = sudo(&["ip", "netns", "exec", name, "ip", "link", "set", "lo", "up"]);

        Ok(Self {
            name: name.to_string(),
        })
    }

    /// The argv prefix that runs a program inside this namespace.
    pub fn exec_prefix(&self) -> Vec<String> {
        ["sudo", "-n", "ip", "netns", "exec", &self.name]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Run a command inside this namespace, returning raw output.
    pub fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let mut full_args = vec!["ip", "netns", "exec", &self.name, cmd];
        full_args.extend_from_slice(args);
        sudo(&full_args).with_context(|| format!("exec '{cmd}' in ns '{}'", self.name))
    }

    /// Run a command inside this namespace, failing if it exits non-zero.
    pub fn exec_checked(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let mut full_args = vec!["ip", "netns", "exec", &self.name, cmd];
        full_args.extend_from_slice(args);
        sudo_checked(&full_args).with_context(|| format!("exec '{cmd}' in ns '{}'", self.name))
    }

    /// Create a veth pair connecting this namespace to `peer`.
    ///
    /// Each end gets an address (CIDR notation) and is brought up.
    /// Interface names must be <= 15 chars (Linux limit).
    pub fn add_veth_link(
        &self,
        peer: &Namespace,
        local_iface: &str,
        peer_iface: &str,
        local_ip: &str,
        peer_ip: &str,
    ) -> Result<()> {
        let _ = sudo(&["ip", "link", "del", local_iface]);

        sudo_checked(&[
            "ip", "link", "add", local_iface, "type", "veth", "peer", "name", peer_iface,
        ])
        .context("create veth pair")?;
        debug!(local = local_iface, peer = peer_iface, "created veth pair");

        sudo_checked(&["ip", "link", "set", local_iface, "netns", &self.name])
            .context("move local veth")?;
        sudo_checked(&["ip", "link", "set", peer_iface, "netns", &peer.name])
            .context("move peer veth")?;

        self.exec_checked("ip", &["addr", "add", local_ip, "dev", local_iface])
            .context("set local IP")?;
        self.exec_checked("ip", &["link", "set", local_iface, "up"])
            .context("bring local link up")?;
        peer.exec_checked("ip", &["addr", "add", peer_ip, "dev", peer_iface])
            .context("set peer IP")?;
        peer.exec_checked("ip", &["link", "set", peer_iface, "up"])
            .context("bring peer link up")?;

        debug!(
            ns_local = self.name,
            ns_peer = peer.name,
            local_ip,
            peer_ip,
            "veth link configured"
        );
        Ok(())
    }

    /// Stdout of `tc qdisc show dev <iface>` inside this namespace.
    pub fn qdisc(&self, iface: &str) -> Result<String> {
        let out = self.exec_checked("tc", &["qdisc", "show", "dev", iface])?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Send `count` pings to `target`; `true` if any reply came back.
    pub fn ping(&self, target: &str, count: u32) -> Result<bool> {
        let count = count.to_string();
        let out = self.exec("ping", &["-c", &count, "-i", "0.2", "-W", "1", target])?;
        Ok(out.status.success())
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        debug!(ns = self.name, "deleting network namespace");
        let _ = sudo(&["ip", "netns", "del", &self.name]);
    }
}

pub const SOURCE_ADDR: &str = "10.201.1.1";
pub const CONTROLLER_ADDR: &str = "10.201.1.2";
pub const CONTROLLER_SINK_SIDE_ADDR: &str = "10.201.2.1";
pub const SINK_ADDR: &str = "10.201.2.2";

/// Source, controller and sink namespaces, with the controller routing
/// between the other two.
///
/// ```text
/// source [src_if] 10.201.1.0/24 [ctl_in] controller [ctl_out] 10.201.2.0/24 [sink_if] sink
/// ```
///
/// Impairments installed on `controller_egress` affect source-to-sink traffic.
pub struct Testbed {
    pub source: Namespace,
    pub controller: Namespace,
    pub sink: Namespace,
    pub source_iface: String,
    pub controller_ingress: String,
    pub controller_egress: String,
    pub sink_iface: String,
}

impl Testbed {
    pub fn build(tag: &str) -> Result<Self> {
        let source = Namespace::new(&unique_ns_name(&format!("{tag}_s")))?;
        let controller = Namespace::new(&unique_ns_name(&format!("{tag}_c")))?;
        let sink = Namespace::new(&unique_ns_name(&format!("{tag}_k")))?;

        // Names only need to be unique on the host while the pair is created.
        let source_iface = unique_ns_name("nls");
        let controller_ingress = unique_ns_name("nli");
        let controller_egress = unique_ns_name("nle");
        let sink_iface = unique_ns_name("nlk");

        source.add_veth_link(
            &controller,
            &source_iface,
            &controller_ingress,
            &format!("{SOURCE_ADDR}/24"),
            &format!("{CONTROLLER_ADDR}/24"),
        )?;
        controller.add_veth_link(
            &sink,
            &controller_egress,
            &sink_iface,
            &format!("{CONTROLLER_SINK_SIDE_ADDR}/24"),
            &format!("{SINK_ADDR}/24"),
        )?;

        controller
            .exec_checked("sysctl", &["-w", "net.ipv4.ip_forward=1"])
            .context("enable forwarding on controller")?;
        source
            .exec_checked("ip", &["route", "add", "10.201.2.0/24", "via", CONTROLLER_ADDR])
            .context("route source to sink")?;
        sink.exec_checked(
            "ip",
            &["route", "add", "10.201.1.0/24", "via", CONTROLLER_SINK_SIDE_ADDR],
        )
        .context("route sink to source")?;

        debug!(
            source = source.name,
            controller = controller.name,
            sink = sink.name,
            "testbed ready"
        );
        Ok(Self {
            source,
            controller,
            sink,
            source_iface,
            controller_ingress,
            controller_egress,
            sink_iface,
        })
    }

    /// Root qdisc listing of the controller's sink-facing interface.
    pub fn egress_qdisc(&self) -> Result<String> {
        self.controller.qdisc(&self.controller_egress)
    }
}

// -- helpers --

/// Run `sudo <args>`, returning raw output.
fn sudo(args: &[&str]) -> Result<Output> {
    Command::new("sudo")
        .arg("-n")
        .args(args)
        .output()
        .with_context(|| format!("sudo {}", args.join(" ")))
}

/// Run `sudo <args>`, returning output on success or bailing with stderr.
fn sudo_checked(args: &[&str]) -> Result<Output> {
    let output = sudo(args)?;
    if !output.status.success() {
        bail!(
            "command failed: sudo {}\n{}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::check_privileges;

    #[test]
    fn test_namespace_has_loopback() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let ns = Namespace::new(&unique_ns_name("nst_a")).expect("create ns");
        let out = ns.exec("ip", &["link"]).expect("ip link");
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(stdout.contains("lo"), "loopback missing: {stdout}");
    }

    #[test]
    fn test_sink_reachable_through_controller() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let bed = Testbed::build("tb").expect("build testbed");
        assert!(bed.source.ping(SINK_ADDR, 2).expect("ping"), "sink unreachable");
        assert!(bed.egress_qdisc().expect("qdisc").contains("qdisc"));
    }
}
