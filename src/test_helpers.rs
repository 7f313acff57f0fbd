#![cfg(any(test, feature = "test-internals"))]
#![allow(dead_code)] // Not every helper is used by every test module

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};

use crate::capture::{CaptureSettings, CaptureSupervisor, ProcessSpawner};
use crate::config::{PhaseDefaults, RunConfig};
use crate::error::{ExperimentError, Result};
use crate::exec::{CommandOutput, CommandRunner, Invocation};
use crate::impairment::{EngineSettings, PolicyEngine, RemoteExecutor};
use crate::interrupt::Interrupt;
use crate::traffic::{TrafficGenerator, TrafficReport, TrafficRequest, parse_report};

#[derive(Debug, Default)]
struct KernelState {
    interfaces: HashSet<String>,
    default_route: Option<String>,
    /// Root discipline per interface as installed: `["netem", "loss", "1%"]`.
    root: HashMap<String, Vec<String>>,
    /// Extra lines `tc qdisc show` reports, e.g. a leftover child qdisc.
    extra: HashMap<String, Vec<String>>,
    sysctl: HashMap<String, String>,
    /// Every mutating command that reached the kernel.
    mutations: Vec<String>,
    /// Every command, mutating or not.
    calls: Vec<String>,
    deny_mutations: bool,
    /// Interfaces whose root discipline survives `tc qdisc del`.
    pinned: HashSet<String>,
    next_handle: u32,
}

/// In-memory model of the parts of `ip`, `tc` and `sysctl` the engine uses.
///
/// Mirrors the real tools' failure modes: deleting a default root fails
/// with "handle of zero", adding over an installed root fails with
/// "Exclusivity flag on", and unknown devices fail with "Cannot find device".
#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<KernelState>,
}

impl FakeKernel {
    pub fn new(interfaces: &[&str]) -> Arc<Self> {
        let kernel = Self::default();
        {
            let mut state = kernel.state.lock().unwrap();
            state.interfaces = interfaces.iter().map(|s| s.to_string()).collect();
            state.default_route = interfaces.first().map(|s| s.to_string());
            state.next_handle = 0x8001;
        }
        Arc::new(kernel)
    }

    pub fn without_default_route(self: Arc<Self>) -> Arc<Self> {
        self.state.lock().unwrap().default_route = None;
        self
    }

    /// Every mutating command fails with "Operation not permitted".
    pub fn deny_mutations(self: Arc<Self>) -> Arc<Self> {
        self.state.lock().unwrap().deny_mutations = true;
        self
    }

    /// `tc qdisc del` reports success on `iface` but leaves the root in place.
    pub fn pin_root(&self, iface: &str) {
        self.state.lock().unwrap().pinned.insert(iface.to_string());
    }

    pub fn inject_extra(&self, iface: &str, line: &str) {
        self.state
            .lock()
            .unwrap()
            .extra
            .entry(iface.to_string())
            .or_default()
            .push(line.to_string());
    }

    /// Install a root discipline behind the engine's back.
    pub fn force_root(&self, iface: &str, spec: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .root
            .insert(iface.to_string(), spec.iter().map(|s| s.to_string()).collect());
    }

    /// The installed root discipline, e.g. `Some("netem loss 1%")`.
    pub fn installed(&self, iface: &str) -> Option<String> {
        self.state.lock().unwrap().root.get(iface).map(|spec| spec.join(" "))
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().sysctl.get(key).cloned()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn handle(&self, inv: &Invocation) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        state.calls.push(inv.to_string());
        let args: Vec<&str> = inv.args.iter().map(String::as_str).collect();

        match (inv.program.as_str(), args.as_slice()) {
            ("ip", ["link", "show", "dev", iface]) => {
                if state.interfaces.contains(*iface) {
                    CommandOutput::ok(format!(
                        "2: {iface}: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n"
                    ))
                } else {
                    CommandOutput::failed(1, format!("Device \"{iface}\" does not exist."))
                }
            }
            ("ip", ["route", "show", "default"]) => match &state.default_route {
                Some(iface) => CommandOutput::ok(format!(
                    "default via 10.0.0.1 dev {iface} proto static\n"
                )),
                None => CommandOutput::ok(""),
            },
            ("tc", ["qdisc", "show", "dev", iface]) => {
                if !state.interfaces.contains(*iface) {
                    return CommandOutput::failed(1, format!("Cannot find device \"{iface}\""));
                }
                let mut out = match state.root.get(*iface) {
                    Some(spec) => format!(
                        "qdisc {} {:x}: root refcnt 2 {}\n",
                        spec[0],
                        state.next_handle,
                        spec[1..].join(" ")
                    ),
                    None => "qdisc noqueue 0: root refcnt 2\n".to_string(),
                };
                for line in state.extra.get(*iface).into_iter().flatten() {
                    out.push_str(line);
                    out.push('\n');
                }
                CommandOutput::ok(out)
            }
            ("tc", ["qdisc", "del", "dev", iface, "root"]) => {
                if let Some(denied) = Self::gate(&mut state, inv, iface) {
                    return denied;
                }
                if state.pinned.contains(*iface) {
                    return CommandOutput::ok("");
                }
                if state.root.remove(*iface).is_none() {
                    return CommandOutput::failed(
                        2,
                        "Error: Cannot delete qdisc with handle of zero.",
                    );
                }
                state.extra.remove(*iface);
                CommandOutput::ok("")
            }
            ("tc", ["qdisc", "add", "dev", iface, "root", spec @ ..]) => {
                if let Some(denied) = Self::gate(&mut state, inv, iface) {
                    return denied;
                }
                if state.root.contains_key(*iface) {
                    return CommandOutput::failed(2, "Error: Exclusivity flag on, cannot modify.");
                }
                let spec: Vec<String> = spec.iter().map(|s| s.to_string()).collect();
                state.root.insert(iface.to_string(), spec);
                state.next_handle += 1;
                CommandOutput::ok("")
            }
            ("sysctl", ["-w", assignment]) => {
                if state.deny_mutations {
                    return CommandOutput::failed(255, "sysctl: permission denied on key");
                }
                let Some((key, value)) = assignment.split_once('=') else {
                    return CommandOutput::failed(255, "sysctl: malformed setting");
                };
                state.sysctl.insert(key.to_string(), value.to_string());
                state.mutations.push(inv.to_string());
                CommandOutput::ok(format!("{key} = {value}\n"))
            }
            ("ping", _) => CommandOutput::ok("1 packets transmitted, 1 received\n"),
            _ => CommandOutput::failed(127, format!("fake kernel: unsupported command {inv}")),
        }
    }

    /// Common checks for mutating `tc` commands; records the mutation.
    fn gate(state: &mut KernelState, inv: &Invocation, iface: &str) -> Option<CommandOutput> {
        if state.deny_mutations {
            return Some(CommandOutput::failed(2, "RTNETLINK answers: Operation not permitted"));
        }
        if !state.interfaces.contains(iface) {
            return Some(CommandOutput::failed(1, format!("Cannot find device \"{iface}\"")));
        }
        state.mutations.push(inv.to_string());
        None
    }
}

#[async_trait]
impl CommandRunner for FakeKernel {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        Ok(self.handle(invocation))
    }
}

/// Engine over `kernel`, bound to `iface`.
pub async fn engine_on(kernel: &Arc<FakeKernel>, iface: &str, preview: bool) -> PolicyEngine {
    let settings = EngineSettings {
        interface: Some(iface.to_string()),
        preview,
        ..EngineSettings::default()
    };
    PolicyEngine::new(kernel.clone(), settings).await.unwrap()
}

#[derive(Debug, Clone)]
pub struct RemoteCall {
    pub host: String,
    pub command: String,
    pub at: DateTime<Utc>,
}

/// [`RemoteExecutor`] that records every command and answers from a script.
#[derive(Debug, Default)]
pub struct RecordingRemote {
    calls: Mutex<Vec<RemoteCall>>,
    /// (substring of the command, exit code, stderr)
    failures: Mutex<Vec<(String, i32, String)>>,
    unreachable: Mutex<bool>,
    /// Commands containing this never finish.
    hang_on: Mutex<Option<String>>,
    releases: AtomicUsize,
}

impl RecordingRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commands containing `needle` exit with `code`.
    pub fn fail_when(&self, needle: &str, code: i32, stderr: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((needle.to_string(), code, stderr.to_string()));
    }

    /// Every dispatch fails at the transport level.
    pub fn set_unreachable(&self) {
        *self.unreachable.lock().unwrap() = true;
    }

    /// Commands containing `needle` are delivered but never finish.
    pub fn hang_when(&self, needle: &str) {
        *self.hang_on.lock().unwrap() = Some(needle.to_string());
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExecutor for RecordingRemote {
    async fn execute(&self, host: &str, invocation: &Invocation) -> Result<CommandOutput> {
        let command = invocation.to_string();
        self.calls.lock().unwrap().push(RemoteCall {
            host: host.to_string(),
            command: command.clone(),
            at: Utc::now(),
        });
        if *self.unreachable.lock().unwrap() {
            return Err(ExperimentError::RemoteDispatchFailure {
                host: host.to_string(),
                detail: "ssh transport failure: connection timed out".into(),
            });
        }
        let hangs = self
            .hang_on
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|needle| command.contains(needle.as_str()));
        if hangs {
            return std::future::pending().await;
        }
        let failures = self.failures.lock().unwrap();
        let failure = failures
            .iter()
            .find(|(needle, _, _)| command.contains(needle.as_str()));
        if let Some((_, code, stderr)) = failure {
            return Ok(CommandOutput::failed(*code, stderr.clone()));
        }
        Ok(CommandOutput::ok(""))
    }

    async fn release(&self, _host: &str) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What a [`ScriptedTraffic`] generator does when run.
#[derive(Debug, Clone)]
pub enum TrafficScript {
    /// Report `bytes` transferred after `after`.
    Succeed { bytes: u64, after: Duration },
    /// The tool ran and reported an error.
    ReportError(String),
    /// The tool could not be run at all.
    Fail(String),
    /// Raise `interrupt` and then never finish.
    Interrupt(Interrupt),
}

#[derive(Debug, Clone)]
pub struct TrafficCall {
    pub request: TrafficRequest,
    pub at: DateTime<Utc>,
    /// Root discipline on the watched interface when the run began.
    pub installed: Option<String>,
}

/// [`TrafficGenerator`] that follows a script instead of running iperf3.
#[derive(Debug)]
pub struct ScriptedTraffic {
    script: Mutex<Vec<TrafficScript>>,
    fallback: TrafficScript,
    calls: Mutex<Vec<TrafficCall>>,
    watch: Option<(Arc<FakeKernel>, String)>,
}

impl ScriptedTraffic {
    /// Every run follows `script`.
    pub fn always(script: TrafficScript) -> Arc<Self> {
        Self::sequence(Vec::new(), script)
    }

    /// Runs follow `steps` in order, then `fallback`.
    pub fn sequence(steps: Vec<TrafficScript>, fallback: TrafficScript) -> Arc<Self> {
        let mut script = steps;
        script.reverse();
        Arc::new(Self {
            script: Mutex::new(script),
            fallback,
            calls: Mutex::new(Vec::new()),
            watch: None,
        })
    }

    /// Succeeds like [`ScriptedTraffic::succeeding`], recording what `kernel`
    /// has installed on `iface` at the start of every run.
    pub fn watching(kernel: &Arc<FakeKernel>, iface: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Vec::new()),
            fallback: TrafficScript::Succeed {
                bytes: 1_048_576,
                after: Duration::from_millis(50),
            },
            calls: Mutex::new(Vec::new()),
            watch: Some((kernel.clone(), iface.to_string())),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::always(TrafficScript::Succeed {
            bytes: 1_048_576,
            after: Duration::from_millis(50),
        })
    }

    pub fn calls(&self) -> Vec<TrafficCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrafficGenerator for ScriptedTraffic {
    fn client_invocation(&self, request: &TrafficRequest) -> Invocation {
        crate::traffic::Iperf3::default().client_invocation(request)
    }

    async fn run(&self, request: &TrafficRequest) -> Result<TrafficReport> {
        let installed = self
            .watch
            .as_ref()
            .and_then(|(kernel, iface)| kernel.installed(iface));
        self.calls.lock().unwrap().push(TrafficCall {
            request: request.clone(),
            at: Utc::now(),
            installed,
        });
        let step = self.script.lock().unwrap().pop().unwrap_or_else(|| self.fallback.clone());
        match step {
            TrafficScript::Succeed { bytes, after } => {
                tokio::time::sleep(after).await;
                let sent = format!(
                    r#"{{"bytes": {bytes}, "bits_per_second": 8000000.0, "retransmits": 0}}"#
                );
                let received = format!(r#"{{"bytes": {bytes}, "bits_per_second": 8000000.0}}"#);
                let json = format!(
                    r#"{{"end": {{"sum_sent": {sent}, "sum_received": {received}}}}}"#
                );
                parse_report(Some(0), &json)
            }
            TrafficScript::ReportError(msg) => {
                parse_report(Some(1), &format!(r#"{{"end": {{}}, "error": "{msg}"}}"#))
            }
            TrafficScript::Fail(msg) => Err(ExperimentError::Traffic(msg)),
            TrafficScript::Interrupt(interrupt) => {
                interrupt.trigger();
                std::future::pending::<Result<TrafficReport>>().await
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StandIn {
    LongRunning,
    ExitsImmediately,
    IgnoresTerm,
}

/// Spawns a harmless shell process in place of the real capture tool.
#[derive(Debug)]
pub struct StandInSpawner {
    kind: StandIn,
    spawned: Mutex<Vec<Invocation>>,
}

impl StandInSpawner {
    fn of(kind: StandIn) -> Self {
        Self {
            kind,
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Runs until signalled.
    pub fn long_running() -> Self {
        Self::of(StandIn::LongRunning)
    }

    /// Prints a tcpdump-like error and exits 1.
    pub fn exits_immediately() -> Self {
        Self::of(StandIn::ExitsImmediately)
    }

    /// Ignores SIGTERM; only SIGKILL stops it.
    pub fn ignores_term() -> Self {
        Self::of(StandIn::IgnoresTerm)
    }

    pub fn spawned(&self) -> Vec<Invocation> {
        self.spawned.lock().unwrap().clone()
    }
}

impl ProcessSpawner for StandInSpawner {
    fn spawn(&self, invocation: &Invocation) -> Result<Child> {
        self.spawned.lock().unwrap().push(invocation.clone());
        let script = match self.kind {
            StandIn::LongRunning => "exec sleep 30",
            StandIn::ExitsImmediately => "echo 'tcpdump: eth0: no such device exists' >&2; exit 1",
            StandIn::IgnoresTerm => "trap '' TERM; sleep 30",
        };
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn().map_err(|source| ExperimentError::Spawn {
            program: "sh".into(),
            source,
        })
    }
}

/// Capture settings with short delays so tests run quickly.
pub fn fast_capture_settings() -> CaptureSettings {
    CaptureSettings {
        program: "tcpdump".into(),
        confirm_delay: Duration::from_millis(100),
        grace_period: Duration::from_millis(500),
    }
}

pub fn supervisor(spawner: StandInSpawner) -> CaptureSupervisor {
    CaptureSupervisor::new(Arc::new(spawner), fast_capture_settings())
}

/// A validated-shape config for `phases` with zero settle and short phases.
pub fn run_config(
    results_dir: &std::path::Path,
    phases: Vec<crate::config::ExperimentPhase>,
) -> RunConfig {
    let mut config = RunConfig::new("10.0.0.2".parse().unwrap(), phases);
    config.results_dir = results_dir.to_path_buf();
    config.capture = fast_capture_settings();
    config.settle = Duration::ZERO;
    config
}

pub fn short_defaults() -> PhaseDefaults {
    let mut defaults = PhaseDefaults::standard().unwrap();
    defaults.duration = Duration::from_secs(1);
    defaults
}
