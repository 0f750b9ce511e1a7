//! Pause/halt gate checked between motion steps.

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{RobotError, RobotResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Halted,
}

/// Shared run state. Commands call [`wait`](Self::wait) before each motion
/// step; a pause holds them there, a halt releases them with an error.
#[derive(Debug)]
pub struct PauseGate {
    tx: watch::Sender<RunState>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunState::Running);
        Self { tx }
    }

    pub fn state(&self) -> RunState {
        *self.tx.borrow()
    }

    pub fn pause(&self) {
        self.tx.send_modify(|state| {
            if *state == RunState::Running {
                info!("Pausing");
                *state = RunState::Paused;
            }
        });
    }

    pub fn resume(&self) {
        self.tx.send_modify(|state| {
            if *state == RunState::Paused {
                info!("Resuming");
                *state = RunState::Running;
            }
        });
    }

    /// Release every waiter with [`RobotError::Halted`] until cleared.
    pub fn halt(&self) {
        warn!("Halt requested");
        self.tx.send_replace(RunState::Halted);
    }

    pub fn clear(&self) {
        self.tx.send_replace(RunState::Running);
    }

    /// Return once running; fail if halted.
    pub async fn wait(&self) -> RobotResult<()> {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                RunState::Running => return Ok(()),
                RunState::Halted => return Err(RobotError::Halted),
                RunState::Paused => {}
            }
            if rx.changed().await.is_err() {
                return Err(RobotError::Halted);
            }
        }
    }

    /// Resolve once the gate is halted.
    pub async fn halted(&self) {
        let mut rx = self.tx.subscribe();
        // Errors only once the sender is gone, and `self` owns it.
        let _ = rx.wait_for(|state| *state == RunState::Halted).await;
    }
}
