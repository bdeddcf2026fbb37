//! Structures to keep the process alive until some event occurs

use std::fmt;
use tokio::signal::ctrl_c;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tracing::{debug, error, warn};

/// Reason why the heart stopped beating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathReason {
    /// Internal kill signal has been sent
    Killed(String),
    /// SIGINT, SIGTERM or other process-external cause
    Terminated,
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeathReason::Killed(reason) => write!(f, "Killed ({})", reason),
            DeathReason::Terminated => write!(f, "Terminated due to external signal"),
        }
    }
}

/// Lifecycle management struct that can be used to keep the application alive
pub struct Heart {
    rx: Receiver<String>,
    // Keeps the channel open when the stone has been discarded
    _stone: Option<HeartStone>,
}

impl Heart {
    /// Creates a new heart and linked stone
    pub fn new() -> (Self, HeartStone) {
        let (tx, rx) = channel(2);
        let stone = HeartStone { remote: tx };

        (Self { rx, _stone: None }, stone)
    }

    /// Creates a new heart which only dies due to external signals
    pub fn without_heart_stone() -> Self {
        let (mut heart, stone) = Heart::new();
        heart._stone = Some(stone);
        heart
    }

    /// Future that waits until the heart dies for the returned reason
    pub async fn death(&mut self) -> DeathReason {
        debug!("Heart starts beating");

        tokio::select! {
            reason = self.rx.recv() => match reason {
                Some(reason) => DeathReason::Killed(reason),
                None => {
                    warn!("All heart stones have been dropped");
                    termination_signal().await;
                    DeathReason::Terminated
                }
            },
            _ = termination_signal() => DeathReason::Terminated,
        }
    }
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {},
                _ = ctrl_c() => {},
            }
        }
        Err(e) => {
            error!("Unable to listen for SIGTERM: {}", e);
            ctrl_c_signal().await;
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    ctrl_c_signal().await;
}

async fn ctrl_c_signal() {
    if let Err(e) = ctrl_c().await {
        error!("Unable to listen for Ctrl-C: {}", e);
        futures::future::pending::<()>().await;
    }
}

/// Remote controller for the heart
#[derive(Clone)]
pub struct HeartStone {
    remote: Sender<String>,
}

impl HeartStone {
    /// Kill the associated heart
    pub async fn kill(&self, reason: impl Into<String>) {
        if let Err(e) = self.remote.send(reason.into()).await {
            error!("Failed to interact with Heart: {}", e);
        }
    }
}
