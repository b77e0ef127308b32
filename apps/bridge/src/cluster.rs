//! The slice of the cluster API the bridge depends on.
//!
//! `ClusterClient` is implemented by [`KubeCluster`] in production and by an
//! in-memory double in tests.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{future::BoxFuture, stream::BoxStream};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use tokio::io::{AsyncRead, AsyncWrite};

mod kube_client;
#[cfg(test)]
pub(crate) mod memory;

pub use kube_client::KubeCluster;

pub type LogReader = Pin<Box<dyn AsyncRead + Send>>;
pub type PodEvents = BoxStream<'static, Result<PodEvent, ClusterError>>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("cluster api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("cluster transport error: {0}")]
    Transport(String),
    #[error("cluster response could not be decoded: {0}")]
    Decode(String),
}

/// One observation from a single-pod watch.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Added(Box<Pod>),
    Modified(Box<Pod>),
    Deleted,
    Bookmark,
    Error(String),
}

/// Final status of a remote command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCode {
    Code(i32),
    /// The transport closed without reporting a usable status.
    Unknown,
}

impl ExitCode {
    /// Engine-API representation; `Unknown` has none.
    #[must_use]
    pub fn as_engine_code(self) -> Option<i64> {
        match self {
            Self::Code(code) => Some(i64::from(code)),
            Self::Unknown => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

/// Handles to a command running inside a container.
pub struct RemoteProcess {
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Resolves once the remote side closes the session.
    pub status: BoxFuture<'static, ExitCode>,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_pod(&self, namespace: &str, pod: &str) -> Result<Pod, ClusterError>;

    /// Submits `pod` to the `ephemeralcontainers` subresource.
    async fn update_ephemeral_containers(
        &self,
        namespace: &str,
        pod: &Pod,
    ) -> Result<Pod, ClusterError>;

    /// Watches one pod. The server closes the stream after `timeout_seconds`.
    async fn watch_pod(
        &self,
        namespace: &str,
        pod: &str,
        timeout_seconds: u32,
    ) -> Result<PodEvents, ClusterError>;

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogReader, ClusterError>;

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        request: &ExecRequest,
    ) -> Result<RemoteProcess, ClusterError>;
}

#[must_use]
pub fn ephemeral_container_status<'a>(pod: &'a Pod, container: &str) -> Option<&'a ContainerStatus> {
    pod.status
        .as_ref()?
        .ephemeral_container_statuses
        .as_ref()?
        .iter()
        .find(|status| status.name == container)
}

/// Maps the status frame sent at the end of a remote command.
#[must_use]
pub fn exit_code_from_status(status: Option<&Status>) -> ExitCode {
    let Some(status) = status else {
        return ExitCode::Unknown;
    };
    if status.status.as_deref() == Some("Success") {
        return ExitCode::Code(0);
    }
    if status.reason.as_deref() != Some("NonZeroExitCode") {
        return ExitCode::Unknown;
    }
    status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.trim().parse::<i32>().ok())
        .map_or(ExitCode::Unknown, ExitCode::Code)
}

/// Exit status of a finished remote exec. A transport that failed before
/// any status frame arrived counts as exit code 1.
#[must_use]
pub fn exit_code_from_outcome(status: Option<&Status>, transport_ok: bool) -> ExitCode {
    if status.is_none() && !transport_ok {
        return ExitCode::Code(1);
    }
    exit_code_from_status(status)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Status, StatusCause, StatusDetails};

    use super::{ExitCode, exit_code_from_outcome, exit_code_from_status};

    fn non_zero(cause_reason: &str, message: &str) -> Status {
        Status {
            status: Some("Failure".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some(cause_reason.to_string()),
                    message: Some(message.to_string()),
                    ..StatusCause::default()
                }]),
                ..StatusDetails::default()
            }),
            ..Status::default()
        }
    }

    #[test]
    fn success_maps_to_zero() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Status::default()
        };
        assert_eq!(exit_code_from_status(Some(&status)), ExitCode::Code(0));
    }

    #[test]
    fn non_zero_exit_code_is_recovered() {
        assert_eq!(
            exit_code_from_status(Some(&non_zero("ExitCode", "42"))),
            ExitCode::Code(42)
        );
    }

    #[test]
    fn unrecognised_status_is_unknown() {
        assert_eq!(exit_code_from_status(None), ExitCode::Unknown);
        assert_eq!(
            exit_code_from_status(Some(&non_zero("Signal", "9"))),
            ExitCode::Unknown
        );
        assert_eq!(
            exit_code_from_status(Some(&non_zero("ExitCode", "not-a-number"))),
            ExitCode::Unknown
        );
        let failure = Status {
            status: Some("Failure".to_string()),
            reason: Some("InternalError".to_string()),
            ..Status::default()
        };
        assert_eq!(exit_code_from_status(Some(&failure)), ExitCode::Unknown);
        assert_eq!(ExitCode::Unknown.as_engine_code(), None);
        assert_eq!(ExitCode::Code(3).as_engine_code(), Some(3));
    }

    #[test]
    fn transport_failure_without_status_records_one() {
        assert_eq!(exit_code_from_outcome(None, false), ExitCode::Code(1));
        assert_eq!(exit_code_from_outcome(None, true), ExitCode::Unknown);
        assert_eq!(
            exit_code_from_outcome(Some(&non_zero("ExitCode", "42")), false),
            ExitCode::Code(42)
        );
        let success = Status {
            status: Some("Success".to_string()),
            ..Status::default()
        };
        assert_eq!(exit_code_from_outcome(Some(&success), true), ExitCode::Code(0));
    }
}
