//! Run-wide interruption flag.
//!
//! SIGINT and SIGTERM only raise the flag; whoever is waiting on a bounded
//! suspension point (impairment, traffic, settle, sink) observes it and routes
//! into the ordinary teardown path. A second signal skips teardown and exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::EXIT_INTERRUPTED;

/// What the listener does with a received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: raise the flag and let teardown run.
    Teardown,
    /// Any later signal: the operator gave up on teardown.
    ForceExit,
}

#[derive(Debug, Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    signals: Arc<AtomicUsize>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            signals: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is raised. Never resolves otherwise.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|raised| *raised).await.is_err() {
            // Sender lives in `self`, so this is unreachable; park anyway.
            std::future::pending::<()>().await;
        }
    }

    /// Count one delivered signal and decide what it means.
    pub fn on_signal(&self) -> SignalAction {
        if self.signals.fetch_add(1, Ordering::SeqCst) == 0 {
            self.trigger();
            SignalAction::Teardown
        } else {
            SignalAction::ForceExit
        }
    }

    /// Raise the flag on the first SIGINT or SIGTERM; exit on the next one.
    pub fn listen_for_signals(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            let mut term = {
                use tokio::signal::unix::{SignalKind, signal};
                match signal(SignalKind::terminate()) {
                    Ok(s) => Some(s),
                    Err(err) => {
                        warn!("cannot install SIGTERM handler: {err}");
                        None
                    }
                }
            };

            loop {
                #[cfg(unix)]
                let term_recv = async {
                    match term.as_mut() {
                        Some(s) => {
                            s.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                #[cfg(not(unix))]
                let term_recv = std::future::pending::<()>();

                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(err) = res {
                            warn!("cannot listen for ctrl-c: {err}");
                            return;
                        }
                    }
                    _ = term_recv => {}
                }

                match this.on_signal() {
                    SignalAction::Teardown => {
                        info!("interrupt received; tearing down (repeat to exit immediately)");
                    }
                    SignalAction::ForceExit => {
                        error!(
                            "second interrupt; exiting without teardown. \
                             Clear the controller by hand: netlab controller clear"
                        );
                        std::process::exit(i32::from(EXIT_INTERRUPTED));
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let interrupt = Interrupt::new();
        assert!(!interrupt.is_triggered());

        let waiter = interrupt.clone();
        let task = tokio::spawn(async move { waiter.triggered().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        interrupt.trigger();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(interrupt.is_triggered());
    }

    #[test]
    fn test_second_signal_forces_exit() {
        let interrupt = Interrupt::new();
        let other = interrupt.clone();
        assert_eq!(interrupt.on_signal(), SignalAction::Teardown);
        assert!(other.is_triggered());
        assert_eq!(other.on_signal(), SignalAction::ForceExit);
        assert_eq!(interrupt.on_signal(), SignalAction::ForceExit);
    }

    #[tokio::test]
    async fn test_already_triggered_resolves_immediately() {
        let interrupt = Interrupt::new();
        interrupt.trigger();
        tokio::time::timeout(Duration::from_millis(100), interrupt.triggered())
            .await
            .unwrap();
    }
}
