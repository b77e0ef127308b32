use std::{
    collections::{HashMap, VecDeque},
    io::Cursor,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt, stream};
use k8s_openapi::{
    api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
        ContainerStatus, Pod, PodSpec, PodStatus,
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
};

use super::{
    ClusterClient, ClusterError, ExecRequest, ExitCode, LogReader, PodEvent, PodEvents,
    RemoteProcess,
};

/// What the next `exec` call produces.
pub(crate) enum ExecOutcome {
    Fail(ClusterError),
    Complete {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit: ExitCode,
    },
}

#[derive(Default)]
struct MemoryState {
    pods: HashMap<(String, String), Pod>,
    submitted: Vec<Pod>,
    update_failures: VecDeque<ClusterError>,
    watch_scripts: VecDeque<Vec<PodEvent>>,
    logs: HashMap<String, Vec<u8>>,
    exec_outcomes: VecDeque<ExecOutcome>,
    exec_requests: Vec<(String, ExecRequest)>,
    watch_timeouts: Vec<u32>,
    calls: usize,
}

/// Scriptable cluster used by unit and router tests.
#[derive(Default)]
pub(crate) struct InMemoryCluster {
    state: Mutex<MemoryState>,
}

impl InMemoryCluster {
    pub(crate) fn with_pod(namespace: &str, pod: &str) -> Self {
        let cluster = Self::default();
        cluster.insert_pod(namespace, pod);
        cluster
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert_pod(&self, namespace: &str, pod: &str) {
        let record = Pod {
            metadata: ObjectMeta {
                name: Some(pod.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some("1".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec::default()),
            status: Some(PodStatus::default()),
        };
        self.state()
            .pods
            .insert((namespace.to_string(), pod.to_string()), record);
    }

    pub(crate) fn remove_pod(&self, namespace: &str, pod: &str) {
        self.state()
            .pods
            .remove(&(namespace.to_string(), pod.to_string()));
    }

    pub(crate) fn pod(&self, namespace: &str, pod: &str) -> Option<Pod> {
        self.state()
            .pods
            .get(&(namespace.to_string(), pod.to_string()))
            .cloned()
    }

    /// Every pod accepted by `update_ephemeral_containers`, in order.
    pub(crate) fn submitted(&self) -> Vec<Pod> {
        self.state().submitted.clone()
    }

    /// Number of trait calls made so far.
    pub(crate) fn calls(&self) -> usize {
        self.state().calls
    }

    /// Server-side timeout requested by each watch subscription, in order.
    pub(crate) fn watch_timeouts(&self) -> Vec<u32> {
        self.state().watch_timeouts.clone()
    }

    pub(crate) fn fail_next_update(&self, error: ClusterError) {
        self.state().update_failures.push_back(error);
    }

    /// Events appended after the initial snapshot of the next watch.
    pub(crate) fn script_watch(&self, events: Vec<PodEvent>) {
        self.state().watch_scripts.push_back(events);
    }

    pub(crate) fn set_logs(&self, container: &str, bytes: &[u8]) {
        self.state()
            .logs
            .insert(container.to_string(), bytes.to_vec());
    }

    pub(crate) fn push_exec(&self, outcome: ExecOutcome) {
        self.state().exec_outcomes.push_back(outcome);
    }

    pub(crate) fn exec_requests(&self) -> Vec<(String, ExecRequest)> {
        self.state().exec_requests.clone()
    }

    pub(crate) fn set_waiting(&self, namespace: &str, pod: &str, container: &str) {
        self.set_state(
            namespace,
            pod,
            container,
            ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("ContainerCreating".to_string()),
                    message: None,
                }),
                ..ContainerState::default()
            },
        );
    }

    pub(crate) fn set_running(&self, namespace: &str, pod: &str, container: &str) {
        self.set_state(
            namespace,
            pod,
            container,
            ContainerState {
                running: Some(ContainerStateRunning {
                    started_at: Some(Time(chrono::Utc::now())),
                }),
                ..ContainerState::default()
            },
        );
    }

    pub(crate) fn set_terminated(&self, namespace: &str, pod: &str, container: &str, code: i32) {
        self.set_state(
            namespace,
            pod,
            container,
            ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: code,
                    finished_at: Some(Time(chrono::Utc::now())),
                    reason: Some(if code == 0 { "Completed" } else { "Error" }.to_string()),
                    ..ContainerStateTerminated::default()
                }),
                ..ContainerState::default()
            },
        );
    }

    fn set_state(&self, namespace: &str, pod: &str, container: &str, state: ContainerState) {
        let mut guard = self.state();
        let Some(record) = guard
            .pods
            .get_mut(&(namespace.to_string(), pod.to_string()))
        else {
            return;
        };
        let status = record.status.get_or_insert_with(PodStatus::default);
        let statuses = status
            .ephemeral_container_statuses
            .get_or_insert_with(Vec::new);
        let image = record
            .spec
            .as_ref()
            .and_then(|spec| spec.ephemeral_containers.as_ref())
            .and_then(|containers| containers.iter().find(|entry| entry.name == container))
            .and_then(|entry| entry.image.clone())
            .unwrap_or_default();
        match statuses.iter_mut().find(|entry| entry.name == container) {
            Some(entry) => entry.state = Some(state),
            None => statuses.push(ContainerStatus {
                name: container.to_string(),
                image,
                state: Some(state),
                ..ContainerStatus::default()
            }),
        }
    }
}

fn not_found(namespace: &str, pod: &str) -> ClusterError {
    ClusterError::NotFound(format!("pods \"{pod}\" not found in {namespace}"))
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get_pod(&self, namespace: &str, pod: &str) -> Result<Pod, ClusterError> {
        let mut state = self.state();
        state.calls += 1;
        state
            .pods
            .get(&(namespace.to_string(), pod.to_string()))
            .cloned()
            .ok_or_else(|| not_found(namespace, pod))
    }

    async fn update_ephemeral_containers(
        &self,
        namespace: &str,
        pod: &Pod,
    ) -> Result<Pod, ClusterError> {
        let mut state = self.state();
        state.calls += 1;
        if let Some(error) = state.update_failures.pop_front() {
            return Err(error);
        }
        let name = pod.metadata.name.clone().unwrap_or_default();
        let key = (namespace.to_string(), name.clone());
        let Some(stored) = state.pods.get_mut(&key) else {
            return Err(not_found(namespace, &name));
        };
        if stored.metadata.resource_version != pod.metadata.resource_version {
            return Err(ClusterError::Conflict(
                "the object has been modified".to_string(),
            ));
        }
        let version = stored
            .metadata
            .resource_version
            .as_deref()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or_default();
        let mut updated = pod.clone();
        updated.metadata.resource_version = Some((version + 1).to_string());
        updated.status = stored.status.clone();
        *stored = updated.clone();
        state.submitted.push(pod.clone());
        Ok(updated)
    }

    async fn watch_pod(
        &self,
        namespace: &str,
        pod: &str,
        timeout_seconds: u32,
    ) -> Result<PodEvents, ClusterError> {
        let mut state = self.state();
        state.calls += 1;
        state.watch_timeouts.push(timeout_seconds);
        let mut events = Vec::new();
        if let Some(current) = state.pods.get(&(namespace.to_string(), pod.to_string())) {
            events.push(Ok(PodEvent::Added(Box::new(current.clone()))));
        }
        if let Some(script) = state.watch_scripts.pop_front() {
            events.extend(script.into_iter().map(Ok));
        }
        Ok(stream::iter(events).boxed())
    }

    async fn container_logs(
        &self,
        _namespace: &str,
        _pod: &str,
        container: &str,
    ) -> Result<LogReader, ClusterError> {
        let mut state = self.state();
        state.calls += 1;
        let bytes = state.logs.get(container).cloned().unwrap_or_default();
        Ok(Box::pin(Cursor::new(bytes)))
    }

    async fn exec(
        &self,
        _namespace: &str,
        _pod: &str,
        container: &str,
        request: &ExecRequest,
    ) -> Result<RemoteProcess, ClusterError> {
        let mut state = self.state();
        state.calls += 1;
        state
            .exec_requests
            .push((container.to_string(), request.clone()));
        match state.exec_outcomes.pop_front() {
            Some(ExecOutcome::Fail(error)) => Err(error),
            Some(ExecOutcome::Complete {
                stdout,
                stderr,
                exit,
            }) => Ok(RemoteProcess {
                stdin: Some(Box::new(tokio::io::sink())),
                stdout: Some(Box::new(Cursor::new(stdout))),
                stderr: (!request.tty).then(|| {
                    Box::new(Cursor::new(stderr)) as Box<dyn tokio::io::AsyncRead + Send + Unpin>
                }),
                status: futures::future::ready(exit).boxed(),
            }),
            None => Err(ClusterError::Transport(
                "no exec outcome scripted".to_string(),
            )),
        }
    }
}
