#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::capture::CaptureSupervisor;
    use crate::config::{ControllerTarget, ExperimentPhase, RunConfig, catalog};
    use crate::error::{
        EXIT_CAPTURE, EXIT_FAILURE, EXIT_INTERRUPTED, EXIT_PERMISSION, EXIT_POLICY_CONFLICT,
    };
    use crate::impairment::{ImpairmentController, RemoteController, ShaperSettings};
    use crate::interrupt::Interrupt;
    use crate::mode::ExperimentMode;
    use crate::report::{PhaseOutcome, SkipReason};
    use crate::route::RouteMode;
    use crate::sequencer::{Sequencer, SequencerState};
    use crate::test_helpers::{
        FakeKernel, RecordingRemote, ScriptedTraffic, StandInSpawner, TrafficScript, engine_on,
        run_config, short_defaults, supervisor,
    };
    use crate::traffic::Transport;

    const CONTROLLER: &str = "10.0.0.3";

    fn phases(mode: ExperimentMode) -> Vec<ExperimentPhase> {
        catalog(mode, &short_defaults())
    }

    fn tcp_only(mode: ExperimentMode) -> Vec<ExperimentPhase> {
        phases(mode)
            .into_iter()
            .filter(|p| p.transport == Transport::Tcp)
            .collect()
    }

    fn remote_config(dir: &std::path::Path, phases: Vec<ExperimentPhase>) -> RunConfig {
        let mut config = run_config(dir, phases);
        config.controller = ControllerTarget::Remote {
            address: CONTROLLER.parse().unwrap(),
            user: "root".into(),
            program: "netlab".into(),
        };
        config
    }

    fn remote_controller(executor: &Arc<RecordingRemote>) -> ImpairmentController {
        ImpairmentController::Remote(
            RemoteController::new(CONTROLLER.parse().unwrap(), executor.clone(), "netlab")
                .with_shaper(ShaperSettings::default(), 15),
        )
    }

    fn sequencer(
        config: RunConfig,
        controller: Option<ImpairmentController>,
        capture: CaptureSupervisor,
        traffic: &Arc<ScriptedTraffic>,
        interrupt: Interrupt,
    ) -> Sequencer {
        config.validate().unwrap();
        Sequencer::new(config, controller, capture, traffic.clone(), interrupt)
    }

    #[tokio::test]
    async fn test_baseline_direct_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let traffic = ScriptedTraffic::succeeding();
        let mut seq = sequencer(
            run_config(dir.path(), tcp_only(ExperimentMode::Direct)),
            None,
            supervisor(StandInSpawner::long_running()),
            &traffic,
            Interrupt::new(),
        );

        let run = seq.run().await.unwrap();
        assert_eq!(seq.state(), SequencerState::Complete);
        assert_eq!(run.exit_code(), 0);

        let phase = &run.phases[0];
        assert_eq!(phase.outcome, PhaseOutcome::Success);
        let capture = phase.capture_file.as_ref().unwrap();
        let name = capture.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("exp1_baseline_tcp_"), "{name}");
        assert!(name.ends_with(".pcap"), "{name}");
        // exp1_baseline_tcp_YYYYMMDD_HHMMSS.pcap
        assert_eq!(name.len(), "exp1_baseline_tcp_".len() + 15 + ".pcap".len());
        assert!(phase.traffic.as_ref().unwrap().bytes_transferred > 0);
        assert!(phase.timeline.is_ordered());
        assert!(phase.timeline.capture_stopped.is_some());

        let route = phase.route.unwrap();
        assert_eq!(route.mode, RouteMode::Direct);
        assert_eq!(traffic.calls()[0].request.target, route.sink_address);

        assert!(phase.report_file.as_ref().unwrap().exists());
        assert!(run.results_dir.join("summary.json").exists());
        assert!(run.results_dir.join("summary.txt").exists());
        assert!(!run.teardown.attempted);
    }

    #[tokio::test]
    async fn test_loss_without_controller_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let traffic = ScriptedTraffic::succeeding();
        let spawner = Arc::new(StandInSpawner::long_running());
        let mut seq = sequencer(
            run_config(dir.path(), phases(ExperimentMode::Loss)),
            None,
            CaptureSupervisor::new(spawner.clone(), crate::test_helpers::fast_capture_settings()),
            &traffic,
            Interrupt::new(),
        );

        let run = seq.run().await.unwrap();
        assert_eq!(run.phases.len(), 2);
        for phase in &run.phases {
            assert_eq!(
                phase.outcome,
                PhaseOutcome::Skipped {
                    reason: SkipReason::RequiresController
                }
            );
        }
        assert_eq!(run.exit_code(), 0);
        assert!(traffic.calls().is_empty());
        assert!(spawner.spawned().is_empty());
    }

    #[tokio::test]
    async fn test_clean_phase_runs_without_controller() {
        let dir = tempfile::tempdir().unwrap();
        let traffic = ScriptedTraffic::succeeding();
        let mut seq = sequencer(
            run_config(dir.path(), tcp_only(ExperimentMode::Clean)),
            None,
            supervisor(StandInSpawner::long_running()),
            &traffic,
            Interrupt::new(),
        );
        let run = seq.run().await.unwrap();
        assert_eq!(run.phases[0].outcome, PhaseOutcome::Success);
        assert_eq!(run.phases[0].route.unwrap().mode, RouteMode::Direct);
    }

    #[tokio::test]
    async fn test_bottleneck_with_local_controller() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new(&["eth1"]);
        let controller = ImpairmentController::Local(engine_on(&kernel, "eth1", false).await);
        let mut config = run_config(dir.path(), phases(ExperimentMode::Bottleneck));
        config.controller = ControllerTarget::Local;
        let traffic = ScriptedTraffic::succeeding();
        let mut seq = sequencer(
            config,
            Some(controller),
            supervisor(StandInSpawner::long_running()),
            &traffic,
            Interrupt::new(),
        );

        let run = seq.run().await.unwrap();
        assert_eq!(run.exit_code(), 0);
        assert!(run.phases.iter().all(|p| p.outcome == PhaseOutcome::Success));

        let calls = kernel.calls();
        let install = calls
            .iter()
            .position(|c| c.ends_with("root tbf rate 10mbit burst 32kbit latency 400ms"))
            .unwrap();
        // Applied state was verified right after installing.
        assert_eq!(calls[install + 1], "tc qdisc show dev eth1");

        assert!(run.teardown.cleared);
        assert_eq!(kernel.installed("eth1"), None);
    }

    #[tokio::test]
    async fn test_interrupted_phase_stops_capture_before_clearing() {
        let dir = tempfile::tempdir().unwrap();
        let interrupt = Interrupt::new();
        let traffic = ScriptedTraffic::always(TrafficScript::Interrupt(interrupt.clone()));
        let executor = RecordingRemote::new();
        let mut seq = sequencer(
            remote_config(dir.path(), phases(ExperimentMode::Loss)),
            Some(remote_controller(&executor)),
            supervisor(StandInSpawner::long_running()),
            &traffic,
            interrupt,
        );

        let run = tokio::time::timeout(Duration::from_secs(10), seq.run())
            .await
            .unwrap()
            .unwrap();

        assert!(run.interrupted);
        assert_eq!(run.exit_code(), EXIT_INTERRUPTED);
        assert_eq!(seq.state(), SequencerState::Complete);
        assert_eq!(run.phases[0].outcome, PhaseOutcome::Interrupted);

        // generating traffic -> interrupted -> tearing down -> complete
        let transitions: Vec<&str> = run
            .log
            .iter()
            .map(|e| e.message.as_str())
            .filter(|m| m.contains(" -> "))
            .collect();
        let interrupted = transitions
            .iter()
            .position(|m| *m == "run: generating traffic -> interrupted")
            .unwrap();
        assert!(transitions[interrupted + 1].ends_with("interrupted -> tearing down"));
        assert_eq!(*transitions.last().unwrap(), "run: tearing down -> complete");
        assert!(!transitions.iter().any(|m| m.ends_with("tearing down -> tearing down")));
        assert_eq!(
            run.phases[1].outcome,
            PhaseOutcome::Skipped {
                reason: SkipReason::RunInterrupted
            }
        );

        let stopped = run.phases[0].timeline.capture_stopped.unwrap();
        let calls = executor.calls();
        let clear = calls.last().unwrap();
        assert!(clear.command.contains("controller clear"));
        assert!(stopped <= clear.at);
        assert_eq!(executor.releases(), 1);
        assert!(run.teardown.cleared);
    }

    #[tokio::test]
    async fn test_teardown_runs_after_failed_phases() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecordingRemote::new();
        executor.fail_when("apply", i32::from(EXIT_POLICY_CONFLICT), "Exclusivity flag on");
        let traffic = ScriptedTraffic::succeeding();
        let mut seq = sequencer(
            remote_config(dir.path(), phases(ExperimentMode::Loss)),
            Some(remote_controller(&executor)),
            supervisor(StandInSpawner::long_running()),
            &traffic,
            Interrupt::new(),
        );

        let run = seq.run().await.unwrap();
        assert!(run.phases.iter().all(|p| matches!(p.outcome, PhaseOutcome::Failed { .. })));
        // Impairment failures fail the phase only; the run carried on.
        assert_eq!(executor.commands().iter().filter(|c| c.contains("apply")).count(), 2);
        assert!(traffic.calls().is_empty());

        assert!(run.teardown.cleared);
        assert!(executor.commands().last().unwrap().contains("controller clear"));
        assert_eq!(run.exit_code(), EXIT_FAILURE);
    }

    #[tokio::test]
    async fn test_teardown_failure_is_reported_with_remedy() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecordingRemote::new();
        executor.fail_when("clear", 1, "tc failed");
        let traffic = ScriptedTraffic::succeeding();
        let mut seq = sequencer(
            remote_config(dir.path(), tcp_only(ExperimentMode::Loss)),
            Some(remote_controller(&executor)),
            supervisor(StandInSpawner::long_running()),
            &traffic,
            Interrupt::new(),
        );

        let run = seq.run().await.unwrap();
        assert_eq!(run.phases[0].outcome, PhaseOutcome::Success);
        assert!(!run.teardown.succeeded());
        assert!(!run.teardown.cleared);
        assert!(run.teardown.manual_remedy.as_ref().unwrap().contains(CONTROLLER));
        // Release still happened after the failed clear.
        assert_eq!(executor.releases(), 1);
        assert_eq!(run.exit_code(), EXIT_FAILURE);
    }

    #[tokio::test]
    async fn test_via_controller_route() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecordingRemote::new();
        let traffic = ScriptedTraffic::succeeding();
        let mut all = tcp_only(ExperimentMode::Direct);
        all.extend(tcp_only(ExperimentMode::Loss));
        let mut seq = sequencer(
            remote_config(dir.path(), all),
            Some(remote_controller(&executor)),
            supervisor(StandInSpawner::long_running()),
            &traffic,
            Interrupt::new(),
        );

        let run = seq.run().await.unwrap();
        let targets: Vec<String> = traffic
            .calls()
            .iter()
            .map(|c| c.request.target.to_string())
            .collect();
        assert_eq!(targets, vec!["10.0.0.2", CONTROLLER]);
        assert_eq!(run.phases[1].route.unwrap().mode, RouteMode::ViaController);
        // The baseline phase only clears; it never impairs.
        assert_eq!(
            executor.commands(),
            vec![
                "netlab controller clear",
                "netlab controller apply --mode loss --loss 1 --retries 15",
                "netlab controller clear",
            ]
        );
    }

    #[tokio::test]
    async fn test_capture_failure_skips_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let traffic = ScriptedTraffic::succeeding();
        let mut seq = sequencer(
            run_config(dir.path(), tcp_only(ExperimentMode::Direct)),
            None,
            supervisor(StandInSpawner::exits_immediately()),
            &traffic,
            Interrupt::new(),
        );

        let run = seq.run().await.unwrap();
        assert!(matches!(run.phases[0].outcome, PhaseOutcome::Failed { .. }));
        assert_eq!(run.phases[0].error_code, Some(EXIT_CAPTURE));
        assert!(traffic.calls().is_empty());
        assert_eq!(run.exit_code(), EXIT_CAPTURE);
    }

    #[tokio::test]
    async fn test_traffic_failure_still_stops_capture() {
        let dir = tempfile::tempdir().unwrap();
        let traffic = ScriptedTraffic::sequence(
            vec![TrafficScript::ReportError("unable to connect to server".into())],
            TrafficScript::Fail("iperf3 crashed".into()),
        );
        let mut seq = sequencer(
            run_config(dir.path(), phases(ExperimentMode::Direct)),
            None,
            supervisor(StandInSpawner::long_running()),
            &traffic,
            Interrupt::new(),
        );

        let run = seq.run().await.unwrap();
        for phase in &run.phases {
            assert!(matches!(phase.outcome, PhaseOutcome::Failed { .. }));
            assert!(phase.timeline.capture_stopped.is_some());
            assert!(phase.timeline.is_ordered());
        }
        assert_eq!(
            run.phases[0].outcome,
            PhaseOutcome::Failed {
                reason: "unable to connect to server".into()
            }
        );
        assert_eq!(run.exit_code(), EXIT_FAILURE);
    }

    #[tokio::test]
    async fn test_dry_run_mutates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("results");
        let kernel = FakeKernel::new(&["eth1"]);
        let controller = ImpairmentController::Local(engine_on(&kernel, "eth1", true).await);
        let mut config = run_config(&results, phases(ExperimentMode::All));
        config.controller = ControllerTarget::Local;
        config.dry_run = true;
        config.settle = Duration::from_secs(30);
        let traffic = ScriptedTraffic::succeeding();
        let spawner = Arc::new(StandInSpawner::long_running());
        let mut seq = sequencer(
            config,
            Some(controller),
            CaptureSupervisor::new(spawner.clone(), crate::test_helpers::fast_capture_settings()),
            &traffic,
            Interrupt::new(),
        );

        let run = tokio::time::timeout(Duration::from_secs(5), seq.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.phases.len(), 8);
        assert!(run.phases.iter().all(|p| p.outcome == PhaseOutcome::Previewed));
        assert_eq!(run.exit_code(), 0);

        assert!(kernel.mutations().is_empty());
        assert!(traffic.calls().is_empty());
        assert!(spawner.spawned().is_empty());
        assert!(!results.exists());
    }

    #[tokio::test]
    async fn test_permission_denied_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new(&["eth1"]).deny_mutations();
        let controller = ImpairmentController::Local(engine_on(&kernel, "eth1", false).await);
        let mut config = run_config(dir.path(), phases(ExperimentMode::All));
        config.controller = ControllerTarget::Local;
        let traffic = ScriptedTraffic::succeeding();
        let mut seq = sequencer(
            config,
            Some(controller),
            supervisor(StandInSpawner::long_running()),
            &traffic,
            Interrupt::new(),
        );

        let run = seq.run().await.unwrap();
        // The baseline already needs the path cleared, which is refused.
        let outcomes: Vec<&str> = run.phases.iter().map(|p| p.outcome.label()).collect();
        assert_eq!(outcomes[0], "failed");
        assert!(outcomes[1..].iter().all(|o| *o == "skipped"));
        assert!(traffic.calls().is_empty());
        assert_eq!(
            run.phases[1].outcome,
            PhaseOutcome::Skipped {
                reason: SkipReason::RunAborted
            }
        );
        // The finalizer still tried to clear and reported the failure.
        assert!(run.teardown.attempted);
        assert!(!run.teardown.succeeded());
        assert_eq!(run.exit_code(), EXIT_PERMISSION);
    }

    #[tokio::test]
    async fn test_settle_between_phases() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(dir.path(), phases(ExperimentMode::Direct));
        config.settle = Duration::from_millis(300);
        let traffic = ScriptedTraffic::succeeding();
        let mut seq = sequencer(
            config,
            None,
            supervisor(StandInSpawner::long_running()),
            &traffic,
            Interrupt::new(),
        );

        let run = seq.run().await.unwrap();
        let first_stop = run.phases[0].timeline.capture_stopped.unwrap();
        let second_start = run.phases[1].timeline.capture_started.unwrap();
        assert!(second_start - first_stop >= chrono::Duration::milliseconds(300));
        assert!(run.log.iter().any(|e| e.message.starts_with("settling")));
    }

    #[tokio::test]
    async fn test_baseline_after_loss_runs_on_clean_path() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new(&["eth1"]);
        let controller = ImpairmentController::Local(engine_on(&kernel, "eth1", false).await);
        let mut order = tcp_only(ExperimentMode::Loss);
        order.extend(tcp_only(ExperimentMode::Direct));
        let mut config = run_config(dir.path(), order);
        config.controller = ControllerTarget::Local;
        let traffic = ScriptedTraffic::watching(&kernel, "eth1");
        let mut seq = sequencer(
            config,
            Some(controller),
            supervisor(StandInSpawner::long_running()),
            &traffic,
            Interrupt::new(),
        );

        let run = seq.run().await.unwrap();
        assert!(run.phases.iter().all(|p| p.outcome == PhaseOutcome::Success));
        let seen: Vec<Option<String>> = traffic.calls().into_iter().map(|c| c.installed).collect();
        assert_eq!(seen, vec![Some("netem loss 1%".to_string()), None]);
        let cleared = "exp1_baseline_tcp: path cleared via local:eth1";
        assert!(run.log.iter().any(|e| e.message == cleared));
    }

    #[tokio::test]
    async fn test_interrupt_while_applying_impairment() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecordingRemote::new();
        executor.hang_when("apply");
        let interrupt = Interrupt::new();
        let traffic = ScriptedTraffic::succeeding();
        let spawner = Arc::new(StandInSpawner::long_running());
        let mut seq = sequencer(
            remote_config(dir.path(), phases(ExperimentMode::Loss)),
            Some(remote_controller(&executor)),
            CaptureSupervisor::new(spawner.clone(), crate::test_helpers::fast_capture_settings()),
            &traffic,
            interrupt.clone(),
        );

        let raiser = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            raiser.trigger();
        });
        let run = tokio::time::timeout(Duration::from_secs(5), seq.run())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(run.phases[0].outcome, PhaseOutcome::Interrupted);
        assert_eq!(
            run.phases[1].outcome,
            PhaseOutcome::Skipped {
                reason: SkipReason::RunInterrupted
            }
        );
        assert!(spawner.spawned().is_empty());
        assert!(traffic.calls().is_empty());
        // Teardown still reached the controller.
        assert_eq!(executor.commands().last().unwrap(), "netlab controller clear");
        assert!(run.teardown.cleared);
        assert_eq!(seq.state(), SequencerState::Complete);
        assert_eq!(run.exit_code(), EXIT_INTERRUPTED);
    }
}
