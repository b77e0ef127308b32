//! Engine container and exec semantics expressed as ephemeral-container
//! mutations and cluster streams.

use std::{sync::Arc, time::Duration};

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use hyper::upgrade::OnUpgrade;
use k8s_openapi::api::core::v1::{EnvVar, EphemeralContainer, Pod, PodSpec};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    cluster::{
        ClusterClient, ClusterError, ExecRequest, ExitCode, RemoteProcess,
        ephemeral_container_status,
    },
    engine::{
        ContainerCreateRequest, ContainerCreateResponse, ContainerInspectResponse,
        ContainerSummary, EventMessage, ExecCreateRequest, ExecInspectResponse, ExecStartRequest,
        IdResponse, InfoResponse, PLATFORM_NAME, VersionResponse,
    },
    exec_sessions::{ExecCompletion, ExecSessionError, ExecSessionTable},
    readiness::{ReadinessError, ReadinessWatcher},
    scope::{ContainerName, ExecId, PodScope, random_segment},
    stream_bridge::{self, Framing, StreamBridgeError},
    wait::{WaitCondition, WaitError, WaitStateMachine, WaitSubscription},
};

pub const CONTAINER_NAME_PREFIX: &str = "levias-";
const CONTAINER_SUFFIX_LEN: usize = 8;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0} is not implemented")]
    Unimplemented(String),
    #[error("{0}")]
    Upstream(String),
}

impl BackendError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Unimplemented(_) => "unimplemented",
            Self::Upstream(_) => "upstream",
        }
    }
}

impl From<ClusterError> for BackendError {
    fn from(error: ClusterError) -> Self {
        match error {
            ClusterError::NotFound(message) => Self::NotFound(message),
            ClusterError::Conflict(message) => Self::Conflict(message),
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl From<ReadinessError> for BackendError {
    fn from(error: ReadinessError) -> Self {
        match error {
            ReadinessError::Cluster(error) => error.into(),
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl From<ExecSessionError> for BackendError {
    fn from(error: ExecSessionError) -> Self {
        match error {
            ExecSessionError::NotFound(_) => Self::NotFound(error.to_string()),
            ExecSessionError::AlreadyStarted(_) => Self::Conflict(error.to_string()),
        }
    }
}

impl From<WaitError> for BackendError {
    fn from(error: WaitError) -> Self {
        match error {
            WaitError::InvalidCondition(_) => Self::InvalidArgument(error.to_string()),
            WaitError::Unsupported(_) => Self::Unimplemented(error.to_string()),
        }
    }
}

impl From<StreamBridgeError> for BackendError {
    fn from(error: StreamBridgeError) -> Self {
        Self::Upstream(error.to_string())
    }
}

#[derive(Clone)]
pub struct LifecycleBackend {
    cluster: Arc<dyn ClusterClient>,
    readiness: ReadinessWatcher,
    waits: WaitStateMachine,
    sessions: Arc<ExecSessionTable>,
    readiness_timeout: Duration,
    placeholders: Arc<[String]>,
}

impl LifecycleBackend {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        readiness: ReadinessWatcher,
        sessions: Arc<ExecSessionTable>,
        readiness_timeout: Duration,
        placeholders: Vec<String>,
    ) -> Self {
        Self {
            cluster,
            waits: WaitStateMachine::new(readiness.clone()),
            readiness,
            sessions,
            readiness_timeout,
            placeholders: placeholders.into(),
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<ExecSessionTable> {
        &self.sessions
    }

    fn is_placeholder(&self, name: &ContainerName) -> bool {
        self.placeholders
            .iter()
            .any(|placeholder| *placeholder == name.container)
    }

    pub async fn create(
        &self,
        scope: &PodScope,
        request: ContainerCreateRequest,
    ) -> Result<ContainerCreateResponse, BackendError> {
        if request.image.trim().is_empty() {
            return Err(BackendError::InvalidArgument(
                "image is required".to_string(),
            ));
        }
        let mut pod = self.cluster.get_pod(&scope.namespace, &scope.pod).await?;
        let container = format!(
            "{CONTAINER_NAME_PREFIX}{}",
            random_segment(CONTAINER_SUFFIX_LEN)
        );
        let image = request.image.clone();
        append_ephemeral_container(&mut pod, ephemeral_container(&container, request));
        self.cluster
            .update_ephemeral_containers(&scope.namespace, &pod)
            .await?;

        let id = scope.name(&container);
        info!(
            namespace = %scope.namespace,
            pod = %scope.pod,
            container = %container,
            image = %image,
            "ephemeral container created"
        );
        Ok(ContainerCreateResponse {
            id: id.to_string(),
            warnings: Vec::new(),
        })
    }

    /// Ephemeral containers start once admitted, so there is nothing to do.
    pub async fn start(&self, name: &ContainerName) -> Result<(), BackendError> {
        debug!(container = %name, "start requested for auto-started container");
        Ok(())
    }

    pub async fn inspect(
        &self,
        name: &ContainerName,
    ) -> Result<ContainerInspectResponse, BackendError> {
        if self.is_placeholder(name) {
            return Ok(ContainerInspectResponse::placeholder(
                &name.to_string(),
                &name.container,
            ));
        }
        let pod = self.cluster.get_pod(&name.namespace, &name.pod).await?;
        let spec = find_ephemeral_container(&pod, &name.container)
            .ok_or_else(|| no_such_container(name))?;
        Ok(ContainerInspectResponse::from_cluster(
            &name.to_string(),
            &name.container,
            Some(spec),
            ephemeral_container_status(&pod, &name.container),
        ))
    }

    pub async fn list(
        &self,
        scope: &PodScope,
        all: bool,
    ) -> Result<Vec<ContainerSummary>, BackendError> {
        let pod = self.cluster.get_pod(&scope.namespace, &scope.pod).await?;
        let containers = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.ephemeral_containers.as_deref())
            .unwrap_or_default();
        Ok(containers
            .iter()
            .map(|spec| {
                ContainerInspectResponse::from_cluster(
                    &scope.name(&spec.name).to_string(),
                    &spec.name,
                    Some(spec),
                    ephemeral_container_status(&pod, &spec.name),
                )
            })
            .filter(|inspect| all || inspect.state.running)
            .map(|inspect| ContainerSummary::from_inspect(&inspect))
            .collect())
    }

    pub async fn wait(
        &self,
        name: &ContainerName,
        condition: WaitCondition,
    ) -> Result<WaitSubscription, BackendError> {
        let pod = self.cluster.get_pod(&name.namespace, &name.pod).await?;
        if find_ephemeral_container(&pod, &name.container).is_none() {
            return Err(no_such_container(name));
        }
        Ok(self.waits.start(name, condition)?)
    }

    /// Ephemeral containers cannot be removed from a pod; removal succeeds
    /// without effect.
    pub async fn remove(&self, name: &ContainerName) -> Result<(), BackendError> {
        debug!(container = %name, "remove requested for ephemeral container");
        Ok(())
    }

    /// Follows the container's log stream over a hijacked connection.
    pub async fn attach(
        &self,
        name: &ContainerName,
        headers: &HeaderMap,
        on_upgrade: Option<OnUpgrade>,
    ) -> Result<Response, BackendError> {
        let pod = self.cluster.get_pod(&name.namespace, &name.pod).await?;
        let spec = find_ephemeral_container(&pod, &name.container)
            .ok_or_else(|| no_such_container(name))?;
        let framing = Framing::for_tty(spec.tty.unwrap_or(false));
        let (response, pending) = stream_bridge::hijack(headers, on_upgrade, framing)?;

        let cluster = Arc::clone(&self.cluster);
        let readiness = self.readiness.clone();
        let timeout = self.readiness_timeout;
        let name = name.clone();
        tokio::spawn(async move {
            let result: Result<(), BackendError> = async {
                let connection = pending.connect().await?;
                readiness
                    .wait_until_observable(&name.namespace, &name.pod, &name.container, timeout)
                    .await?;
                let logs = cluster
                    .container_logs(&name.namespace, &name.pod, &name.container)
                    .await?;
                stream_bridge::pump(connection, framing, None, Some(Box::new(logs)), None).await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => debug!(container = %name, "attach stream closed"),
                Err(error) => warn!(container = %name, error = %error, "attach stream failed"),
            }
        });
        Ok(response)
    }

    /// Registers an exec instance. The cluster is not contacted.
    pub fn exec_create(
        &self,
        name: &ContainerName,
        request: ExecCreateRequest,
    ) -> Result<IdResponse, BackendError> {
        if request.cmd.is_empty() {
            return Err(BackendError::InvalidArgument(
                "No exec command specified".to_string(),
            ));
        }
        let id = self.sessions.create(name, request.into());
        Ok(IdResponse { id: id.to_string() })
    }

    pub fn exec_inspect(&self, id: &ExecId) -> Result<ExecInspectResponse, BackendError> {
        let snapshot = self.sessions.inspect(id)?;
        Ok(ExecInspectResponse::from(&snapshot))
    }

    /// Waits for the container, opens the remote command and then hands the
    /// caller's connection to the stream bridge.
    ///
    /// Failures before the stream is established are returned to the caller
    /// and recorded as exit code 1.
    pub async fn exec_start(
        &self,
        id: &ExecId,
        request: ExecStartRequest,
        headers: &HeaderMap,
        on_upgrade: Option<OnUpgrade>,
    ) -> Result<Response, BackendError> {
        let (config, completion) = self.sessions.begin_start(id)?;
        let tty = request.tty.unwrap_or(config.tty);
        let exec_request = ExecRequest {
            command: config.cmd.clone(),
            stdin: config.attach_stdin && !request.detach,
            stdout: config.attach_stdout || request.detach,
            stderr: config.attach_stderr || request.detach,
            tty,
        };

        let process = match self.open_exec(&id.container, &exec_request).await {
            Ok(process) => process,
            Err(error) => {
                warn!(exec_id = %id, error = %error, "exec start failed");
                completion.finish(ExitCode::Code(1));
                return Err(error);
            }
        };

        if request.detach {
            let exec_id = id.clone();
            tokio::spawn(async move {
                let code = drain_detached(process).await;
                debug!(exec_id = %exec_id, ?code, "detached exec finished");
                completion.finish(code);
            });
            return Ok(StatusCode::OK.into_response());
        }

        let framing = Framing::for_tty(tty);
        let (response, pending) = match stream_bridge::hijack(headers, on_upgrade, framing) {
            Ok(handshake) => handshake,
            Err(error) => {
                completion.finish(ExitCode::Code(1));
                return Err(error.into());
            }
        };
        let exec_id = id.clone();
        tokio::spawn(async move {
            run_attached(exec_id, pending, framing, process, completion).await;
        });
        Ok(response)
    }

    async fn open_exec(
        &self,
        name: &ContainerName,
        request: &ExecRequest,
    ) -> Result<RemoteProcess, BackendError> {
        self.readiness
            .wait_until_observable(
                &name.namespace,
                &name.pod,
                &name.container,
                self.readiness_timeout,
            )
            .await?;
        Ok(self
            .cluster
            .exec(&name.namespace, &name.pod, &name.container, request)
            .await?)
    }

    pub async fn info(&self, scope: &PodScope) -> Result<InfoResponse, BackendError> {
        let summaries = self.list(scope, true).await?;
        let running = summaries
            .iter()
            .filter(|summary| summary.state == "running")
            .count();
        Ok(InfoResponse {
            id: format!("{}/{}", scope.namespace, scope.pod),
            name: scope.pod.clone(),
            server_version: VersionResponse::current().version,
            operating_system: PLATFORM_NAME.to_string(),
            os_type: "linux".to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            driver: PLATFORM_NAME.to_string(),
            containers: summaries.len(),
            containers_running: running,
            containers_stopped: summaries.len() - running,
            images: 0,
        })
    }

    /// Answers an events query with a single destroy event, naming the
    /// container from the `container` filter when one is given.
    pub fn destroy_event(&self, filters: Option<&str>) -> Result<EventMessage, BackendError> {
        let container = match filters.map(str::trim).filter(|raw| !raw.is_empty()) {
            Some(raw) => filtered_container(raw)?,
            None => None,
        };
        Ok(EventMessage::container_destroyed(
            container.as_deref().unwrap_or_default(),
            Utc::now(),
        ))
    }
}

async fn run_attached(
    exec_id: ExecId,
    pending: stream_bridge::PendingConnection,
    framing: Framing,
    process: RemoteProcess,
    completion: ExecCompletion,
) {
    let RemoteProcess {
        stdin,
        stdout,
        stderr,
        status,
    } = process;
    let streamed = async {
        let connection = pending.connect().await?;
        stream_bridge::pump(connection, framing, stdin, stdout, stderr).await
    }
    .await;
    match streamed {
        Ok(()) => {
            let code = status.await;
            debug!(exec_id = %exec_id, ?code, "exec stream finished");
            completion.finish(code);
        }
        Err(error) => {
            warn!(exec_id = %exec_id, error = %error, "exec stream failed");
            completion.finish(ExitCode::Code(1));
        }
    }
}

async fn drain_detached(process: RemoteProcess) -> ExitCode {
    let RemoteProcess {
        stdin,
        stdout,
        stderr,
        status,
    } = process;
    drop(stdin);
    let drain = |source: Option<stream_bridge::UpstreamReader>| async move {
        match source {
            Some(mut source) => tokio::io::copy(&mut source, &mut tokio::io::sink()).await,
            None => Ok(0),
        }
    };
    let (stdout, stderr) = tokio::join!(drain(stdout), drain(stderr));
    if stdout.is_err() || stderr.is_err() {
        return ExitCode::Code(1);
    }
    status.await
}

fn no_such_container(name: &ContainerName) -> BackendError {
    BackendError::NotFound(format!("No such container: {name}"))
}

fn find_ephemeral_container<'a>(pod: &'a Pod, container: &str) -> Option<&'a EphemeralContainer> {
    pod.spec
        .as_ref()?
        .ephemeral_containers
        .as_ref()?
        .iter()
        .find(|spec| spec.name == container)
}

fn append_ephemeral_container(pod: &mut Pod, container: EphemeralContainer) {
    pod.spec
        .get_or_insert_with(PodSpec::default)
        .ephemeral_containers
        .get_or_insert_with(Vec::new)
        .push(container);
}

fn ephemeral_container(name: &str, request: ContainerCreateRequest) -> EphemeralContainer {
    let env = request.env.filter(|env| !env.is_empty()).map(|env| {
        env.iter()
            .map(|entry| match entry.split_once('=') {
                Some((key, value)) => EnvVar {
                    name: key.to_string(),
                    value: Some(value.to_string()),
                    value_from: None,
                },
                None => EnvVar {
                    name: entry.clone(),
                    value: None,
                    value_from: None,
                },
            })
            .collect()
    });
    EphemeralContainer {
        name: name.to_string(),
        image: Some(request.image),
        command: request.entrypoint.filter(|entrypoint| !entrypoint.is_empty()),
        args: request.cmd.filter(|cmd| !cmd.is_empty()),
        env,
        working_dir: request.working_dir.filter(|dir| !dir.is_empty()),
        tty: request.tty.then_some(true),
        stdin: request.open_stdin.then_some(true),
        stdin_once: request.stdin_once.then_some(true),
        ..EphemeralContainer::default()
    }
}

/// Pulls the container named by an engine `filters` query, which is a JSON
/// object whose values are either lists or `{value: true}` maps.
fn filtered_container(raw: &str) -> Result<Option<String>, BackendError> {
    let filters: Value = serde_json::from_str(raw)
        .map_err(|error| BackendError::InvalidArgument(format!("invalid filters: {error}")))?;
    let Value::Object(filters) = filters else {
        return Err(BackendError::InvalidArgument(
            "invalid filters: expected a JSON object".to_string(),
        ));
    };
    let container = match filters.get("container") {
        Some(Value::Array(values)) => values
            .iter()
            .find_map(|value| value.as_str().map(ToString::to_string)),
        Some(Value::Object(values)) => values.keys().next().cloned(),
        _ => None,
    };
    Ok(container)
}
