#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::error::{EXIT_INTERFACE, ExperimentError};
    use crate::impairment::{
        ImpairmentController, ImpairmentMode, LossPercent, RemoteController, ShaperSettings,
    };
    use crate::test_helpers::{FakeKernel, RecordingRemote, engine_on};

    fn remote(executor: &Arc<RecordingRemote>) -> ImpairmentController {
        ImpairmentController::Remote(
            RemoteController::new("10.0.0.3".parse().unwrap(), executor.clone(), "netlab")
                .with_interface(Some("eth1".into()))
                .with_shaper(ShaperSettings::default(), 15),
        )
    }

    fn loss() -> ImpairmentMode {
        ImpairmentMode::Loss {
            percent: LossPercent::new(1.0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_remote_apply_reset_release() {
        let executor = RecordingRemote::new();
        let mut controller = remote(&executor);

        controller.apply(&loss()).await.unwrap();
        controller.reset().await.unwrap();
        controller.release().await.unwrap();

        assert_eq!(
            executor.commands(),
            vec![
                "netlab controller apply --mode loss --loss 1 --retries 15 --interface eth1",
                "netlab controller clear --interface eth1",
            ]
        );
        assert!(executor.calls().iter().all(|c| c.host == "10.0.0.3"));
        assert_eq!(executor.releases(), 1);
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_error_class() {
        let executor = RecordingRemote::new();
        executor.fail_when("apply", i32::from(EXIT_INTERFACE), "interface 'eth1' not found");
        let mut controller = remote(&executor);

        let err = controller.apply(&loss()).await.unwrap_err();
        assert!(matches!(err, ExperimentError::InterfaceNotFound(i) if i == "eth1"));
        // Clearing is a different command and still goes through.
        controller.reset().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_unreachable() {
        let executor = RecordingRemote::new();
        executor.set_unreachable();
        let mut controller = remote(&executor);
        let err = controller.apply(&ImpairmentMode::Clean).await.unwrap_err();
        assert!(matches!(err, ExperimentError::RemoteDispatchFailure { .. }));
        assert!(!err.is_fatal_for_run());
    }

    #[tokio::test]
    async fn test_remote_dispatch_is_bounded() {
        let executor = RecordingRemote::new();
        executor.hang_when("apply");
        let mut controller = ImpairmentController::Remote(
            RemoteController::new("10.0.0.3".parse().unwrap(), executor.clone(), "netlab")
                .with_timeout(Duration::from_millis(100)),
        );

        let err = tokio::time::timeout(Duration::from_secs(5), controller.apply(&loss()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            &err,
            ExperimentError::RemoteDispatchFailure { host, .. } if host == "10.0.0.3"
        ));
        // A stuck apply does not wedge the session for the clear.
        controller.reset().await.unwrap();
        assert_eq!(executor.commands().last().unwrap(), "netlab controller clear");
    }

    #[tokio::test]
    async fn test_local_controller_reset_returns_to_clean() {
        let kernel = FakeKernel::new(&["eth0"]);
        let mut controller = ImpairmentController::Local(engine_on(&kernel, "eth0", false).await);

        controller
            .apply(&ImpairmentMode::Bottleneck {
                rate: "1mbit".parse().unwrap(),
            })
            .await
            .unwrap();
        assert!(kernel.installed("eth0").is_some());

        controller.reset().await.unwrap();
        controller.release().await.unwrap();
        assert_eq!(kernel.installed("eth0"), None);
        assert_eq!(controller.to_string(), "local:eth0");
        assert_eq!(controller.manual_clear_hint(), "tc qdisc del dev eth0 root");
    }
}
