//! Process-wide cooperative shutdown signal.
//!
//! Every long-running task holds a clone of [`Shutdown`]. Loops poll
//! [`Shutdown::is_shutting_down`] at their tops and race
//! [`Shutdown::wait`] against their sleeps and reads in `tokio::select!`.

use std::future::Future;
use tokio::sync::watch;
use tracing::{info, warn};

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: Option<watch::Receiver<bool>>,
}

/// Sending side of the shutdown signal. Dropping it also trips the signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create a signal and its trigger.
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Shutdown { rx: Some(rx) })
    }

    /// A signal that never trips, for one-shot operations.
    pub fn never() -> Shutdown {
        Shutdown { rx: None }
    }

    /// Create a signal tripped by SIGINT or SIGTERM.
    ///
    /// The returned future must be spawned; it completes once the signal
    /// has tripped.
    pub fn new_signals() -> (Shutdown, impl Future<Output = ()> + Send + 'static) {
        let (trigger, shutdown) = Shutdown::new();
        let worker = async move {
            wait_for_signal().await;
            trigger.trigger();
        };
        (shutdown, worker)
    }

    /// True once shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        match &self.rx {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => false,
        }
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        match &self.rx {
            Some(rx) => {
                let mut rx = rx.clone();
                // A closed channel means the trigger is gone; treat as shutdown.
                let _ = rx.wait_for(|stop| *stop).await;
            }
            None => std::future::pending().await,
        }
    }
}

impl ShutdownTrigger {
    /// Request shutdown.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl-C, shutting down");
    }
}
