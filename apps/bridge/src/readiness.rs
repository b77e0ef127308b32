//! Observation of ephemeral-container status.
//!
//! The watch strategy is primary: it subscribes to the single pod with a
//! bounded server-side lifetime and re-subscribes when the server closes the
//! stream. Polling is kept for API servers without watch support.

use std::{ops::ControlFlow, sync::Arc, time::Duration};

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ContainerStateTerminated, ContainerStatus};
use tracing::debug;

use crate::{
    cluster::{ClusterClient, ClusterError, PodEvent, ephemeral_container_status},
    config::ReadinessStrategy,
};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("container {container} did not become observable within {waited:?}")]
    Timeout { container: String, waited: Duration },
    #[error("pod {pod} was deleted before container {container} became observable")]
    PodDeleted { pod: String, container: String },
    #[error("watch protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

#[must_use]
pub fn is_running(status: &ContainerStatus) -> bool {
    status
        .state
        .as_ref()
        .is_some_and(|state| state.running.is_some())
}

#[must_use]
pub fn terminated_state(status: &ContainerStatus) -> Option<&ContainerStateTerminated> {
    status.state.as_ref()?.terminated.as_ref()
}

#[derive(Clone)]
pub struct ReadinessWatcher {
    cluster: Arc<dyn ClusterClient>,
    strategy: ReadinessStrategy,
    poll_interval: Duration,
    watch_timeout_seconds: u32,
}

impl ReadinessWatcher {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        strategy: ReadinessStrategy,
        poll_interval: Duration,
        watch_timeout_seconds: u32,
    ) -> Self {
        Self {
            cluster,
            strategy,
            poll_interval,
            watch_timeout_seconds,
        }
    }

    /// Resolves with the first status showing the container running or
    /// terminated.
    pub async fn wait_until_observable(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        timeout: Duration,
    ) -> Result<ContainerStatus, ReadinessError> {
        self.observe(namespace, pod, container, Some(timeout), |status| {
            if is_running(status) || terminated_state(status).is_some() {
                ControlFlow::Break(status.clone())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await
    }

    /// Feeds every status snapshot of `container` to `visit`, in order,
    /// until it breaks or `deadline` passes.
    pub async fn observe<T, F>(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        deadline: Option<Duration>,
        mut visit: F,
    ) -> Result<T, ReadinessError>
    where
        F: FnMut(&ContainerStatus) -> ControlFlow<T> + Send,
        T: Send,
    {
        let observation = async {
            match self.strategy {
                ReadinessStrategy::Watch => {
                    self.observe_watch(namespace, pod, container, &mut visit)
                        .await
                }
                ReadinessStrategy::Poll => {
                    self.observe_poll(namespace, pod, container, &mut visit)
                        .await
                }
            }
        };
        match deadline {
            Some(limit) => tokio::time::timeout(limit, observation)
                .await
                .map_err(|_| ReadinessError::Timeout {
                    container: container.to_string(),
                    waited: limit,
                })?,
            None => observation.await,
        }
    }

    async fn observe_watch<T, F>(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        visit: &mut F,
    ) -> Result<T, ReadinessError>
    where
        F: FnMut(&ContainerStatus) -> ControlFlow<T> + Send,
        T: Send,
    {
        loop {
            let mut events = self
                .cluster
                .watch_pod(namespace, pod, self.watch_timeout_seconds)
                .await?;
            while let Some(event) = events.next().await {
                match event? {
                    PodEvent::Added(record) | PodEvent::Modified(record) => {
                        if let Some(status) = ephemeral_container_status(&record, container) {
                            if let ControlFlow::Break(value) = visit(status) {
                                return Ok(value);
                            }
                        }
                    }
                    PodEvent::Bookmark => {}
                    PodEvent::Deleted => {
                        return Err(ReadinessError::PodDeleted {
                            pod: pod.to_string(),
                            container: container.to_string(),
                        });
                    }
                    PodEvent::Error(message) => return Err(ReadinessError::Protocol(message)),
                }
            }
            debug!(namespace, pod, container, "pod watch closed, resubscribing");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn observe_poll<T, F>(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        visit: &mut F,
    ) -> Result<T, ReadinessError>
    where
        F: FnMut(&ContainerStatus) -> ControlFlow<T> + Send,
        T: Send,
    {
        loop {
            let record = match self.cluster.get_pod(namespace, pod).await {
                Ok(record) => record,
                Err(ClusterError::NotFound(_)) => {
                    return Err(ReadinessError::PodDeleted {
                        pod: pod.to_string(),
                        container: container.to_string(),
                    });
                }
                Err(error) => return Err(error.into()),
            };
            if let Some(status) = ephemeral_container_status(&record, container) {
                if let ControlFlow::Break(value) = visit(status) {
                    return Ok(value);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
