use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netlab::capture::{CaptureSettings, CaptureSupervisor, SystemSpawner};
use netlab::config::{
    ControllerTarget, DEFAULT_BOTTLENECK_RATE, DEFAULT_CAPTURE_INTERFACE, DEFAULT_RESULTS_DIR,
    PhaseDefaults, PlanFile, RunConfig, catalog,
};
use netlab::error::{EXIT_POLICY_CONFLICT, ExperimentError};
use netlab::exec::{CommandRunner, SystemRunner, is_root, require_tools};
use netlab::impairment::{
    BurstSize, DEFAULT_BURST, DEFAULT_LATENCY_MS, DEFAULT_TCP_RETRIES, DisciplineClass,
    EngineSettings, ImpairmentController, ImpairmentMode, LossPercent, PolicyEngine, PolicyKind,
    Rate, RemoteController, ShaperSettings, SshExecutor,
};
use netlab::interrupt::Interrupt;
use netlab::mode::ExperimentMode;
use netlab::sequencer::Sequencer;
use netlab::sink::{ForegroundSpawner, Sink, SinkConfig};
use netlab::traffic::{DEFAULT_PORT, DEFAULT_UDP_BITRATE, Iperf3};

// Use mimalloc as the global allocator for the binary (non-Windows only)
#[cfg(not(windows))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "netlab",
    author,
    version,
    about = "Controlled transport experiments across an impairable path"
)]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Generate traffic towards the sink, phase by phase
    Source(SourceArgs),
    /// Serve iperf3 and optionally capture until interrupted
    Sink(SinkArgs),
    /// Apply, clear or inspect impairment on this host
    #[command(subcommand)]
    Controller(ControllerCommand),
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Address of the host running `netlab sink`
    #[arg(long)]
    sink: IpAddr,

    /// Which experiments to run
    #[arg(long, value_enum, default_value = "all")]
    mode: ExperimentMode,

    /// Custom phase list (TOML); replaces the built-in catalog
    #[arg(long, value_name = "FILE")]
    plan: Option<PathBuf>,

    /// In-path controller reached over ssh
    #[arg(long, conflicts_with = "impair_locally")]
    controller: Option<IpAddr>,

    /// ssh user on the controller
    #[arg(long, default_value = "root")]
    controller_user: String,

    /// netlab binary on the controller
    #[arg(long, default_value = "netlab")]
    controller_program: String,

    /// Impair this host's own egress instead of a remote controller
    #[arg(long)]
    impair_locally: bool,

    /// Interface to impair (default: the default-route interface)
    #[arg(long)]
    interface: Option<String>,

    /// Interface to capture on
    #[arg(long, default_value = DEFAULT_CAPTURE_INTERFACE)]
    capture_interface: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Length of each traffic phase in seconds
    #[arg(long, default_value = "20")]
    duration_secs: u64,

    /// Offered load for UDP phases (iperf3 notation)
    #[arg(long, default_value = DEFAULT_UDP_BITRATE)]
    udp_bitrate: String,

    /// Loss percentage for loss phases
    #[arg(long, default_value = "1")]
    loss: LossPercent,

    #[command(flatten)]
    shaper: ShaperArgs,

    /// Pause between phases in seconds (default 5, or the plan's value)
    #[arg(long)]
    settle_secs: Option<u64>,

    #[arg(long, default_value = DEFAULT_RESULTS_DIR)]
    results_dir: PathBuf,

    /// Ping the target once per phase and warn if it does not answer
    #[arg(long)]
    probe: bool,

    /// Print every command instead of running it
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug, Clone)]
struct ShaperArgs {
    /// Rate for bottleneck phases (tc notation)
    #[arg(long, default_value = DEFAULT_BOTTLENECK_RATE)]
    rate: Rate,

    /// Token bucket size for bottleneck phases
    #[arg(long, default_value = DEFAULT_BURST)]
    burst: BurstSize,

    /// Queueing latency ceiling for bottleneck phases
    #[arg(long, default_value_t = DEFAULT_LATENCY_MS)]
    latency_ms: u64,

    /// net.ipv4.tcp_retries2 while an impairment is active
    #[arg(long, default_value_t = DEFAULT_TCP_RETRIES)]
    retries: u32,
}

impl ShaperArgs {
    fn settings(&self) -> ShaperSettings {
        ShaperSettings {
            burst: self.burst.clone(),
            latency: Duration::from_millis(self.latency_ms),
        }
    }
}

#[derive(Args, Debug)]
struct SinkArgs {
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Capture `port P` traffic on this interface
    #[arg(long)]
    capture_interface: Option<String>,

    #[arg(long, default_value = DEFAULT_RESULTS_DIR)]
    results_dir: PathBuf,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum ControllerCommand {
    /// Replace whatever is installed with the given policy
    Apply(ApplyArgs),
    /// Remove any impairment
    Clear(TargetArgs),
    /// Report the installed discipline
    Verify(VerifyArgs),
}

#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Interface to act on (default: the default-route interface)
    #[arg(long)]
    interface: Option<String>,

    /// Print the commands without running them
    #[arg(long)]
    preview: bool,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    #[arg(long, value_enum)]
    mode: PolicyKind,

    /// Loss percentage, required with --mode loss
    #[arg(long)]
    loss: Option<LossPercent>,

    /// Rate, required with --mode bottleneck
    #[arg(long)]
    rate: Option<Rate>,

    #[arg(long, default_value = DEFAULT_BURST)]
    burst: BurstSize,

    #[arg(long, default_value_t = DEFAULT_LATENCY_MS)]
    latency_ms: u64,

    #[arg(long, default_value_t = DEFAULT_TCP_RETRIES)]
    retries: u32,

    #[command(flatten)]
    target: TargetArgs,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    #[arg(long)]
    interface: Option<String>,

    /// Exit non-zero unless the installed class is this one
    #[arg(long, value_enum)]
    expect: Option<DisciplineClass>,

    /// Print the observed state as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            let experiment = err.chain().find_map(|e| e.downcast_ref::<ExperimentError>());
            eprintln!("error: {err:#}");
            if let Some(remedy) = experiment.and_then(ExperimentError::remedy) {
                eprintln!("  to fix: {remedy}");
            }
            experiment.map_or(ExitCode::FAILURE, ExitCode::from)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<u8> {
    match cli.role {
        Role::Source(args) => run_source(args).await,
        Role::Sink(args) => run_sink(args).await,
        Role::Controller(cmd) => run_controller(cmd).await,
    }
}

/// Missing tools abort a real run but only warn in preview.
fn check_tools(tools: &[&str], dry_run: bool) -> Result<()> {
    match require_tools(tools.iter().copied()) {
        Ok(()) => Ok(()),
        Err(err) if dry_run => {
            warn!("{err} (ignored for dry run)");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn check_root(operation: &str, dry_run: bool) -> Result<()> {
    if dry_run || is_root() {
        return Ok(());
    }
    Err(ExperimentError::PermissionDenied {
        operation: operation.to_string(),
        detail: "effective uid is not 0".into(),
    }
    .into())
}

async fn run_source(args: SourceArgs) -> Result<u8> {
    let defaults = PhaseDefaults::new(
        Duration::from_secs(args.duration_secs),
        args.udp_bitrate.clone(),
        args.loss,
        args.shaper.rate.clone(),
    );
    let (phases, plan_settle) = match &args.plan {
        Some(path) => {
            let plan = PlanFile::load(path)?;
            let settle = plan.settle_secs;
            (plan.into_phases(&defaults), settle)
        }
        None => (catalog(args.mode, &defaults), None),
    };

    let mut config = RunConfig::new(args.sink, phases);
    config.port = args.port;
    config.capture_interface = args.capture_interface.clone();
    config.results_dir = args.results_dir.clone();
    if let Some(secs) = args.settle_secs.or(plan_settle) {
        config.settle = Duration::from_secs(secs);
    }
    config.dry_run = args.dry_run;
    config.probe_reachability = args.probe;
    config.engine = EngineSettings {
        interface: args.interface.clone(),
        shaper: args.shaper.settings(),
        tcp_retries: args.shaper.retries,
        preview: args.dry_run,
    };
    config.controller = if let Some(address) = args.controller {
        ControllerTarget::Remote {
            address,
            user: args.controller_user.clone(),
            program: args.controller_program.clone(),
        }
    } else if args.impair_locally {
        ControllerTarget::Local
    } else {
        ControllerTarget::None
    };
    if config.controller == ControllerTarget::None
        && args.plan.is_none()
        && args.mode.requires_controller()
    {
        warn!(
            mode = %args.mode,
            "every phase of this mode needs --controller or --impair-locally; all will be skipped"
        );
    }
    config.validate()?;

    let mut tools = vec!["iperf3", config.capture.program.as_str()];
    match config.controller {
        ControllerTarget::Remote { .. } => tools.push("ssh"),
        ControllerTarget::Local => tools.extend(["tc", "ip", "sysctl"]),
        ControllerTarget::None => {}
    }
    check_tools(&tools, config.dry_run)?;
    if config.probe_reachability {
        check_tools(&["ping"], true)?;
    }
    check_root("packet capture", config.dry_run)?;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let controller = match &config.controller {
        ControllerTarget::None => {
            info!("no controller configured; impaired phases will be skipped");
            None
        }
        ControllerTarget::Local => {
            let engine = PolicyEngine::new(runner.clone(), config.engine.clone())
                .await
                .context("local impairment engine")?;
            Some(ImpairmentController::Local(engine))
        }
        ControllerTarget::Remote { address, user, program } => {
            let executor = Arc::new(SshExecutor::new(user.clone()));
            let remote = RemoteController::new(*address, executor, program.clone())
                .with_interface(config.engine.interface.clone())
                .with_shaper(config.engine.shaper.clone(), config.engine.tcp_retries)
                .with_preview(config.dry_run);
            Some(ImpairmentController::Remote(remote))
        }
    };

    let interrupt = Interrupt::new();
    interrupt.listen_for_signals();

    let supervisor = CaptureSupervisor::new(Arc::new(SystemSpawner), config.capture.clone());
    let traffic = Arc::new(Iperf3::default());
    let mut sequencer = Sequencer::new(config, controller, supervisor, traffic, interrupt)
        .with_probe_runner(runner);
    let run = sequencer.run().await.context("experiment run")?;

    print!("{}", run.render_text());
    if !run.dry_run {
        println!("\nresults in {}", run.results_dir.display());
    }
    if !run.teardown.succeeded() {
        error!("teardown incomplete; see summary for the manual remedy");
    }
    Ok(run.exit_code())
}

async fn run_sink(args: SinkArgs) -> Result<u8> {
    let capture = CaptureSettings::default();
    let mut tools = vec!["iperf3"];
    if args.capture_interface.is_some() {
        tools.push(capture.program.as_str());
        check_root("packet capture", args.dry_run)?;
    }
    check_tools(&tools, args.dry_run)?;

    let config = SinkConfig {
        port: args.port,
        server: Iperf3::default(),
        capture_interface: args.capture_interface,
        results_dir: args.results_dir,
        capture: capture.clone(),
        dry_run: args.dry_run,
    };
    let interrupt = Interrupt::new();
    interrupt.listen_for_signals();

    let mut sink = Sink::new(config, Arc::new(ForegroundSpawner), Arc::new(SystemSpawner));
    let report = sink.run(&interrupt).await.context("sink")?;
    if let Some(file) = &report.capture_file {
        println!("capture: {}", file.display());
    }
    Ok(0)
}

async fn engine_for(
    interface: Option<String>,
    shaper: ShaperSettings,
    tcp_retries: u32,
    preview: bool,
) -> Result<PolicyEngine> {
    let settings = EngineSettings {
        interface,
        shaper,
        tcp_retries,
        preview,
    };
    Ok(PolicyEngine::new(Arc::new(SystemRunner), settings).await?)
}

async fn run_controller(cmd: ControllerCommand) -> Result<u8> {
    match cmd {
        ControllerCommand::Apply(args) => {
            let mode = ImpairmentMode::from_parts(args.mode, args.loss, args.rate)?;
            let preview = args.target.preview;
            let mut tools = vec!["tc", "ip"];
            if mode.requires_controller() {
                tools.push("sysctl");
            }
            check_tools(&tools, preview)?;
            check_root("tc qdisc", preview)?;

            let shaper = ShaperSettings {
                burst: args.burst,
                latency: Duration::from_millis(args.latency_ms),
            };
            let mut engine =
                engine_for(args.target.interface, shaper, args.retries, preview).await?;
            let policy = engine.policy(mode);
            let applied = engine.apply(&policy).await?;
            if preview {
                for command in &applied.commands {
                    println!("{command}");
                }
            } else {
                let observed = engine.verify(engine.interface()).await?;
                println!("{}", observed.summary());
            }
            Ok(0)
        }
        ControllerCommand::Clear(args) => {
            check_tools(&["tc", "ip"], args.preview)?;
            check_root("tc qdisc", args.preview)?;
            let shaper = ShaperSettings::default();
            let mut engine =
                engine_for(args.interface, shaper, DEFAULT_TCP_RETRIES, args.preview).await?;
            let iface = engine.interface().to_string();
            engine.clear(&iface).await?;
            println!("{iface}: clean");
            Ok(0)
        }
        ControllerCommand::Verify(args) => {
            check_tools(&["tc", "ip"], false)?;
            let shaper = ShaperSettings::default();
            let engine = engine_for(args.interface, shaper, DEFAULT_TCP_RETRIES, true).await?;
            let observed = engine.verify(engine.interface()).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&observed)?);
            } else {
                println!("{}", observed.summary());
            }
            match args.expect {
                Some(expected) if observed.class() != expected || observed.is_stacked() => {
                    eprintln!(
                        "expected {}, found {}",
                        expected.as_str(),
                        observed.class().as_str()
                    );
                    Ok(EXIT_POLICY_CONFLICT)
                }
                _ => Ok(0),
            }
        }
    }
}
