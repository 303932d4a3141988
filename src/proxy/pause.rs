use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    Running,
    Paused { until: Instant },
    Stopped,
}

impl PauseState {
    fn name(&self) -> &'static str {
        match self {
            PauseState::Running => "running",
            PauseState::Paused { .. } => "paused",
            PauseState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitAction {
    Proceed,
    TimedOut,
    Unavailable,
}

/// Traffic barrier for a service: {Running, Paused, Stopped} with a bounded
/// wait. All state changes are broadcast, so a single resume releases every
/// waiter at once; paused waiters share the pause deadline.
#[derive(Debug)]
pub struct PauseControl {
    state: watch::Sender<PauseState>,
}

impl PauseControl {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PauseState::Running);
        Self { state }
    }

    pub fn state(&self) -> PauseState {
        *self.state.borrow()
    }

    /// Running -> Paused with a deadline shared by all waiters. Pausing an
    /// already paused or stopped control is an operator error.
    pub fn pause(&self, timeout: Duration) -> Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| match *state {
            PauseState::Running => {
                *state = PauseState::Paused {
                    until: Instant::now() + timeout,
                };
                true
            }
            other => {
                result = Err(ProxyError::PauseBadState {
                    action: "pause",
                    state: other.name(),
                });
                false
            }
        });
        result
    }

    /// Paused -> Running, releasing every waiter. Resuming a running control
    /// is a no-op; a stopped control cannot be resumed.
    pub fn resume(&self) -> Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| match *state {
            PauseState::Paused { .. } => {
                *state = PauseState::Running;
                true
            }
            PauseState::Running => false,
            PauseState::Stopped => {
                result = Err(ProxyError::PauseBadState {
                    action: "resume",
                    state: "stopped",
                });
                false
            }
        });
        result
    }

    /// Terminal. Stopping twice is a no-op.
    pub fn stop(&self) -> Result<()> {
        self.state.send_if_modified(|state| match *state {
            PauseState::Stopped => false,
            _ => {
                *state = PauseState::Stopped;
                true
            }
        });
        Ok(())
    }

    /// Block until the control is Running (Proceed), Stopped (Unavailable),
    /// or the pause deadline passes (TimedOut).
    pub async fn wait(&self) -> WaitAction {
        let mut rx = self.state.subscribe();
        loop {
            let until = match *rx.borrow_and_update() {
                PauseState::Running => return WaitAction::Proceed,
                PauseState::Stopped => return WaitAction::Unavailable,
                PauseState::Paused { until } => until,
            };

            match timeout_at(until, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return WaitAction::Unavailable,
                Err(_) => return WaitAction::TimedOut,
            }
        }
    }
}

impl Default for PauseControl {
    fn default() -> Self {
        Self::new()
    }
}
