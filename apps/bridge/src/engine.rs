//! Engine-API request and response bodies.
//!
//! Field names follow the engine's JSON casing; only the fields the bridge
//! reads or fills are modelled.

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, EphemeralContainer};
use serde::{Deserialize, Serialize};

use crate::{
    exec_sessions::{ExecConfig, ExecSnapshot},
    readiness::terminated_state,
    wait::ContainerPhase,
};

pub const API_VERSION: &str = "1.45";
pub const MIN_API_VERSION: &str = "1.24";
pub const PLATFORM_NAME: &str = "levias";
pub const MULTIPLEXED_STREAM_MEDIA_TYPE: &str = "application/vnd.docker.multiplexed-stream";
pub const RAW_STREAM_MEDIA_TYPE: &str = "application/vnd.docker.raw-stream";

const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

fn rfc3339(time: Option<DateTime<Utc>>) -> String {
    time.map_or_else(
        || ZERO_TIME.to_string(),
        |time| time.to_rfc3339_opts(SecondsFormat::Nanos, true),
    )
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerCreateRequest {
    pub image: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateResponse {
    pub id: String,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerStateBody {
    pub status: String,
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
    pub dead: bool,
    pub pid: i64,
    pub exit_code: i64,
    pub error: String,
    pub started_at: String,
    pub finished_at: String,
}

impl ContainerStateBody {
    fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            running: false,
            paused: false,
            restarting: false,
            oom_killed: false,
            dead: false,
            pid: 0,
            exit_code: 0,
            error: String::new(),
            started_at: ZERO_TIME.to_string(),
            finished_at: ZERO_TIME.to_string(),
        }
    }

    #[must_use]
    pub fn running_placeholder() -> Self {
        Self {
            running: true,
            ..Self::with_status("running")
        }
    }

    /// Maps an ephemeral container's cluster status to engine state.
    #[must_use]
    pub fn from_status(status: Option<&ContainerStatus>) -> Self {
        let Some(state) = status.and_then(|status| status.state.as_ref()) else {
            return Self::with_status("created");
        };
        if let Some(running) = state.running.as_ref() {
            return Self {
                running: true,
                started_at: rfc3339(running.started_at.as_ref().map(|time| time.0)),
                ..Self::with_status("running")
            };
        }
        if let Some(terminated) = status.and_then(terminated_state) {
            return Self {
                exit_code: i64::from(terminated.exit_code),
                oom_killed: terminated.reason.as_deref() == Some("OOMKilled"),
                error: terminated.message.clone().unwrap_or_default(),
                started_at: rfc3339(terminated.started_at.as_ref().map(|time| time.0)),
                finished_at: rfc3339(terminated.finished_at.as_ref().map(|time| time.0)),
                ..Self::with_status("exited")
            };
        }
        Self::with_status("created")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfigBody {
    pub image: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub working_dir: String,
    pub tty: bool,
    pub open_stdin: bool,
}

impl ContainerConfigBody {
    fn from_spec(spec: Option<&EphemeralContainer>) -> Self {
        Self {
            image: spec
                .and_then(|spec| spec.image.clone())
                .unwrap_or_default(),
            entrypoint: spec.and_then(|spec| spec.command.clone()),
            cmd: spec.and_then(|spec| spec.args.clone()),
            env: spec.and_then(|spec| spec.env.as_ref()).map(|env| {
                env.iter()
                    .map(|var| format!("{}={}", var.name, var.value.clone().unwrap_or_default()))
                    .collect()
            }),
            working_dir: spec
                .and_then(|spec| spec.working_dir.clone())
                .unwrap_or_default(),
            tty: spec.and_then(|spec| spec.tty).unwrap_or(false),
            open_stdin: spec.and_then(|spec| spec.stdin).unwrap_or(false),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspectResponse {
    pub id: String,
    pub name: String,
    pub created: String,
    pub path: String,
    pub args: Vec<String>,
    pub state: ContainerStateBody,
    pub image: String,
    pub config: ContainerConfigBody,
    pub platform: String,
    pub driver: String,
}

impl ContainerInspectResponse {
    #[must_use]
    pub fn placeholder(id: &str, container: &str) -> Self {
        Self {
            id: id.to_string(),
            name: format!("/{container}"),
            created: ZERO_TIME.to_string(),
            path: String::new(),
            args: Vec::new(),
            state: ContainerStateBody::running_placeholder(),
            image: String::new(),
            config: ContainerConfigBody::from_spec(None),
            platform: "linux".to_string(),
            driver: PLATFORM_NAME.to_string(),
        }
    }

    #[must_use]
    pub fn from_cluster(
        id: &str,
        container: &str,
        spec: Option<&EphemeralContainer>,
        status: Option<&ContainerStatus>,
    ) -> Self {
        let config = ContainerConfigBody::from_spec(spec);
        let mut argv = config
            .entrypoint
            .iter()
            .chain(config.cmd.iter())
            .flatten()
            .cloned();
        let path = argv.next().unwrap_or_default();
        let args = argv.collect();
        let state = ContainerStateBody::from_status(status);
        Self {
            id: id.to_string(),
            name: format!("/{container}"),
            created: state.started_at.clone(),
            path,
            args,
            image: config.image.clone(),
            state,
            config,
            platform: "linux".to_string(),
            driver: PLATFORM_NAME.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub command: String,
    pub created: i64,
    pub state: String,
    pub status: String,
}

impl ContainerSummary {
    #[must_use]
    pub fn from_inspect(inspect: &ContainerInspectResponse) -> Self {
        let command = std::iter::once(inspect.path.as_str())
            .chain(inspect.args.iter().map(String::as_str))
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let status = match inspect.state.status.as_str() {
            "running" => "Up".to_string(),
            "exited" => format!("Exited ({})", inspect.state.exit_code),
            _ => "Created".to_string(),
        };
        let created = DateTime::parse_from_rfc3339(&inspect.created)
            .map(|time| time.timestamp().max(0))
            .unwrap_or_default();
        Self {
            id: inspect.id.clone(),
            names: vec![inspect.name.clone()],
            image: inspect.image.clone(),
            command,
            created,
            state: inspect.state.status.clone(),
            status,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitErrorBody {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitResponse {
    pub status_code: i64,
    pub error: Option<WaitErrorBody>,
}

impl WaitResponse {
    #[must_use]
    pub fn from_phase(phase: &ContainerPhase) -> Self {
        match phase {
            ContainerPhase::Terminated { exit_code, .. } => Self {
                status_code: *exit_code,
                error: None,
            },
            ContainerPhase::Failed(message) => Self {
                status_code: -1,
                error: Some(WaitErrorBody {
                    message: message.clone(),
                }),
            },
            ContainerPhase::Pending | ContainerPhase::Running => Self {
                status_code: -1,
                error: Some(WaitErrorBody {
                    message: "container has not exited".to_string(),
                }),
            },
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecCreateRequest {
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub cmd: Vec<String>,
    pub user: Option<String>,
}

impl From<ExecCreateRequest> for ExecConfig {
    fn from(request: ExecCreateRequest) -> Self {
        Self {
            cmd: request.cmd,
            user: request.user.filter(|user| !user.is_empty()),
            tty: request.tty,
            attach_stdin: request.attach_stdin,
            attach_stdout: request.attach_stdout,
            attach_stderr: request.attach_stderr,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdResponse {
    pub id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecStartRequest {
    pub detach: bool,
    pub tty: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfigBody {
    pub entrypoint: String,
    pub arguments: Vec<String>,
    pub tty: bool,
    pub user: String,
    pub privileged: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspectResponse {
    #[serde(rename = "ID")]
    pub id: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub process_config: ProcessConfigBody,
    pub open_stdin: bool,
    pub open_stdout: bool,
    pub open_stderr: bool,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    pub pid: i64,
}

impl From<&ExecSnapshot> for ExecInspectResponse {
    fn from(snapshot: &ExecSnapshot) -> Self {
        let mut argv = snapshot.config.cmd.iter().cloned();
        Self {
            id: snapshot.id.to_string(),
            running: snapshot.running(),
            exit_code: snapshot.exit_code().and_then(|code| code.as_engine_code()),
            process_config: ProcessConfigBody {
                entrypoint: argv.next().unwrap_or_default(),
                arguments: argv.collect(),
                tty: snapshot.config.tty,
                user: snapshot.config.user.clone().unwrap_or_default(),
                privileged: false,
            },
            open_stdin: snapshot.config.attach_stdin,
            open_stdout: snapshot.config.attach_stdout,
            open_stderr: snapshot.config.attach_stderr,
            container_id: snapshot.id.container.to_string(),
            pid: 0,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlatformBody {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionResponse {
    pub platform: PlatformBody,
    pub version: String,
    pub api_version: String,
    #[serde(rename = "MinAPIVersion")]
    pub min_api_version: String,
    pub os: String,
    pub arch: String,
    pub kernel_version: String,
}

impl VersionResponse {
    #[must_use]
    pub fn current() -> Self {
        Self {
            platform: PlatformBody {
                name: PLATFORM_NAME.to_string(),
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            api_version: API_VERSION.to_string(),
            min_api_version: MIN_API_VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            kernel_version: String::new(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InfoResponse {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub server_version: String,
    pub operating_system: String,
    #[serde(rename = "OSType")]
    pub os_type: String,
    pub architecture: String,
    pub driver: String,
    pub containers: usize,
    pub containers_running: usize,
    pub containers_stopped: usize,
    pub images: usize,
}

/// One engine event, as written to the events stream.
#[derive(Debug, Serialize)]
pub struct EventMessage {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Actor")]
    pub actor: EventActor,
    pub status: String,
    pub id: String,
    pub scope: String,
    pub time: i64,
    #[serde(rename = "timeNano")]
    pub time_nano: i64,
}

#[derive(Debug, Serialize)]
pub struct EventActor {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Attributes")]
    pub attributes: std::collections::BTreeMap<String, String>,
}

impl EventMessage {
    /// The destroy event clients wait for before closing their stream.
    #[must_use]
    pub fn container_destroyed(id: &str, now: DateTime<Utc>) -> Self {
        let attributes = std::iter::once(("exitCode".to_string(), "0".to_string())).collect();
        Self {
            kind: "container".to_string(),
            action: "destroy".to_string(),
            actor: EventActor {
                id: id.to_string(),
                attributes,
            },
            status: "destroy".to_string(),
            id: id.to_string(),
            scope: "local".to_string(),
            time: now.timestamp(),
            time_nano: now.timestamp_nanos_opt().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use k8s_openapi::{
        api::core::v1::{
            ContainerState, ContainerStateRunning, ContainerStateTerminated,
            ContainerStateWaiting, ContainerStatus, EphemeralContainer,
        },
        apimachinery::pkg::apis::meta::v1::Time,
    };
    use serde_json::json;

    use super::{
        ContainerInspectResponse, ContainerStateBody, ContainerSummary, EventMessage,
        ExecCreateRequest, WaitResponse,
    };
    use crate::{exec_sessions::ExecConfig, wait::ContainerPhase};

    fn status(state: ContainerState) -> ContainerStatus {
        ContainerStatus {
            name: "levias-abcd1234".to_string(),
            state: Some(state),
            ..ContainerStatus::default()
        }
    }

    #[test]
    fn cluster_states_map_to_engine_states() {
        assert_eq!(ContainerStateBody::from_status(None).status, "created");

        let waiting = status(ContainerState {
            waiting: Some(ContainerStateWaiting::default()),
            ..ContainerState::default()
        });
        assert_eq!(ContainerStateBody::from_status(Some(&waiting)).status, "created");

        let started = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("time");
        let running = status(ContainerState {
            running: Some(ContainerStateRunning {
                started_at: Some(Time(started)),
            }),
            ..ContainerState::default()
        });
        let body = ContainerStateBody::from_status(Some(&running));
        assert_eq!(body.status, "running");
        assert!(body.running);
        assert_eq!(body.started_at, "2024-05-01T12:00:00.000000000Z");

        let terminated = status(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 137,
                reason: Some("OOMKilled".to_string()),
                ..ContainerStateTerminated::default()
            }),
            ..ContainerState::default()
        });
        let body = ContainerStateBody::from_status(Some(&terminated));
        assert_eq!(body.status, "exited");
        assert_eq!(body.exit_code, 137);
        assert!(body.oom_killed);
        assert!(!body.running);
    }

    #[test]
    fn inspect_and_summary_carry_command_line() {
        let spec = EphemeralContainer {
            name: "levias-abcd1234".to_string(),
            image: Some("alpine".to_string()),
            command: Some(vec!["/bin/sh".to_string()]),
            args: Some(vec!["-c".to_string(), "echo hi".to_string()]),
            ..EphemeralContainer::default()
        };
        let inspect = ContainerInspectResponse::from_cluster(
            "build.runner-1.levias-abcd1234",
            "levias-abcd1234",
            Some(&spec),
            None,
        );
        assert_eq!(inspect.path, "/bin/sh");
        assert_eq!(inspect.args, vec!["-c", "echo hi"]);
        assert_eq!(inspect.image, "alpine");
        assert_eq!(inspect.name, "/levias-abcd1234");

        let summary = ContainerSummary::from_inspect(&inspect);
        assert_eq!(summary.command, "/bin/sh -c echo hi");
        assert_eq!(summary.status, "Created");
        assert_eq!(summary.created, 0);
    }

    #[test]
    fn wait_body_shape() {
        let done = WaitResponse::from_phase(&ContainerPhase::Terminated {
            exit_code: 2,
            finished_at: None,
        });
        assert_eq!(
            serde_json::to_value(&done).expect("json"),
            json!({ "StatusCode": 2, "Error": null })
        );
        let failed = WaitResponse::from_phase(&ContainerPhase::Failed("gone".to_string()));
        assert_eq!(
            serde_json::to_value(&failed).expect("json"),
            json!({ "StatusCode": -1, "Error": { "Message": "gone" } })
        );
    }

    #[test]
    fn destroy_event_carries_exit_code_zero() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("time");
        let event = serde_json::to_value(EventMessage::container_destroyed("abc", now))
            .expect("json");
        assert_eq!(event["Type"], "container");
        assert_eq!(event["Action"], "destroy");
        assert_eq!(event["Actor"]["Attributes"]["exitCode"], "0");
        assert_eq!(event["time"], now.timestamp());
    }

    #[test]
    fn exec_create_keeps_only_what_remote_exec_can_apply() {
        let request: ExecCreateRequest = serde_json::from_value(json!({
            "Cmd": ["sh", "-c", "env"],
            "Env": ["A=1"],
            "WorkingDir": "/work",
            "User": "",
            "AttachStdout": true,
            "Tty": true,
        }))
        .expect("exec create body");
        assert_eq!(
            ExecConfig::from(request),
            ExecConfig {
                cmd: vec!["sh".to_string(), "-c".to_string(), "env".to_string()],
                user: None,
                tty: true,
                attach_stdout: true,
                ..ExecConfig::default()
            }
        );
    }
}
