use std::{ops::ControlFlow, str::FromStr};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    readiness::{ReadinessWatcher, is_running, terminated_state},
    scope::ContainerName,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitCondition {
    #[default]
    NotRunning,
    NextExit,
    Removed,
}

impl FromStr for WaitCondition {
    type Err = WaitError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "" | "not-running" => Ok(Self::NotRunning),
            "next-exit" => Ok(Self::NextExit),
            "removed" => Ok(Self::Removed),
            other => Err(WaitError::InvalidCondition(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("invalid wait condition {0:?}")]
    InvalidCondition(String),
    #[error("wait condition {0:?} is not supported for ephemeral containers")]
    Unsupported(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerPhase {
    Pending,
    Running,
    Terminated {
        exit_code: i64,
        finished_at: Option<DateTime<Utc>>,
    },
    /// Observation stopped before a terminal state was seen.
    Failed(String),
}

impl ContainerPhase {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated { .. } | Self::Failed(_))
    }
}

/// Starts one background observer per wait request.
#[derive(Clone)]
pub struct WaitStateMachine {
    readiness: ReadinessWatcher,
}

impl WaitStateMachine {
    #[must_use]
    pub fn new(readiness: ReadinessWatcher) -> Self {
        Self { readiness }
    }

    /// Returns immediately; the observer runs until it sees termination or
    /// every subscriber has gone away.
    pub fn start(
        &self,
        name: &ContainerName,
        condition: WaitCondition,
    ) -> Result<WaitSubscription, WaitError> {
        if condition == WaitCondition::Removed {
            return Err(WaitError::Unsupported("removed"));
        }

        let (tx, rx) = watch::channel(ContainerPhase::Pending);
        let readiness = self.readiness.clone();
        let name = name.clone();
        tokio::spawn(async move {
            let observed = tokio::select! {
                result = readiness.observe(
                    &name.namespace,
                    &name.pod,
                    &name.container,
                    None,
                    |status| {
                        if let Some(state) = terminated_state(status) {
                            return ControlFlow::Break(ContainerPhase::Terminated {
                                exit_code: i64::from(state.exit_code),
                                finished_at: state.finished_at.as_ref().map(|time| time.0),
                            });
                        }
                        if is_running(status) {
                            tx.send_if_modified(|phase| {
                                if *phase == ContainerPhase::Pending {
                                    *phase = ContainerPhase::Running;
                                    true
                                } else {
                                    false
                                }
                            });
                        }
                        ControlFlow::Continue(())
                    },
                ) => result,
                () = tx.closed() => {
                    debug!(container = %name, "wait abandoned by all subscribers");
                    return;
                }
            };
            let phase = match observed {
                Ok(phase) => phase,
                Err(error) => {
                    warn!(container = %name, error = %error, "wait observation failed");
                    ContainerPhase::Failed(error.to_string())
                }
            };
            tx.send_replace(phase);
        });

        Ok(WaitSubscription { rx })
    }
}

pub struct WaitSubscription {
    rx: watch::Receiver<ContainerPhase>,
}

impl WaitSubscription {
    #[must_use]
    pub fn phase(&self) -> ContainerPhase {
        self.rx.borrow().clone()
    }

    /// Resolves once the container is seen running or has already ended.
    pub async fn running(&mut self) -> ContainerPhase {
        self.resolve(|phase| *phase != ContainerPhase::Pending)
            .await
    }

    pub async fn terminal(&mut self) -> ContainerPhase {
        self.resolve(ContainerPhase::is_terminal).await
    }

    async fn resolve(&mut self, accept: impl FnMut(&ContainerPhase) -> bool) -> ContainerPhase {
        match self.rx.wait_for(accept).await {
            Ok(phase) => phase.clone(),
            Err(_) => ContainerPhase::Failed("wait observer stopped".to_string()),
        }
    }
}
