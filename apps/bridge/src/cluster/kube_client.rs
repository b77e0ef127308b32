use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client,
    api::{AttachParams, LogParams, PostParams, WatchEvent, WatchParams},
};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, warn};

use super::{
    ClusterClient, ClusterError, ExecRequest, LogReader, PodEvent, PodEvents, RemoteProcess,
    exit_code_from_outcome,
};

const EPHEMERAL_CONTAINERS_SUBRESOURCE: &str = "ephemeralcontainers";

/// [`ClusterClient`] backed by the in-cluster (or kubeconfig) API client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects using in-cluster config, falling back to the local kubeconfig.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await.map_err(ClusterError::from)?;
        Ok(Self::new(client))
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl From<kube::Error> for ClusterError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => match response.code {
                404 => Self::NotFound(response.message),
                409 => Self::Conflict(response.message),
                code => Self::Api {
                    code,
                    message: response.message,
                },
            },
            kube::Error::SerdeError(error) => Self::Decode(error.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_pod(&self, namespace: &str, pod: &str) -> Result<Pod, ClusterError> {
        Ok(self.pods(namespace).get(pod).await?)
    }

    async fn update_ephemeral_containers(
        &self,
        namespace: &str,
        pod: &Pod,
    ) -> Result<Pod, ClusterError> {
        let name = pod
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClusterError::Decode("pod has no name".to_string()))?;
        let body = serde_json::to_vec(pod).map_err(|error| ClusterError::Decode(error.to_string()))?;
        let updated = self
            .pods(namespace)
            .replace_subresource(
                EPHEMERAL_CONTAINERS_SUBRESOURCE,
                name,
                &PostParams::default(),
                body,
            )
            .await?;
        Ok(updated)
    }

    async fn watch_pod(
        &self,
        namespace: &str,
        pod: &str,
        timeout_seconds: u32,
    ) -> Result<PodEvents, ClusterError> {
        let params = WatchParams::default()
            .fields(&format!("metadata.name={pod}"))
            .timeout(timeout_seconds);
        let events = self.pods(namespace).watch(&params, "0").await?;
        debug!(namespace, pod, timeout_seconds, "opened pod watch");
        Ok(events
            .map(|event| match event {
                Ok(WatchEvent::Added(pod)) => Ok(PodEvent::Added(Box::new(pod))),
                Ok(WatchEvent::Modified(pod)) => Ok(PodEvent::Modified(Box::new(pod))),
                Ok(WatchEvent::Deleted(_)) => Ok(PodEvent::Deleted),
                Ok(WatchEvent::Bookmark(_)) => Ok(PodEvent::Bookmark),
                Ok(WatchEvent::Error(response)) => Ok(PodEvent::Error(response.message)),
                Err(error) => Err(ClusterError::from(error)),
            })
            .boxed())
    }

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogReader, ClusterError> {
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..LogParams::default()
        };
        let reader = self.pods(namespace).log_stream(pod, &params).await?;
        Ok(Box::pin(reader.compat()))
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        request: &ExecRequest,
    ) -> Result<RemoteProcess, ClusterError> {
        // The exec sub-protocol has no separate stderr channel under a TTY.
        let params = AttachParams::default()
            .container(container)
            .stdin(request.stdin)
            .stdout(request.stdout)
            .stderr(request.stderr && !request.tty)
            .tty(request.tty);
        let mut process = self
            .pods(namespace)
            .exec(pod, request.command.clone(), &params)
            .await?;

        let stdin = process
            .stdin()
            .map(|writer| Box::new(writer) as Box<dyn tokio::io::AsyncWrite + Send + Unpin>);
        let stdout = process
            .stdout()
            .map(|reader| Box::new(reader) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);
        let stderr = process
            .stderr()
            .map(|reader| Box::new(reader) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);
        let status = process.take_status();
        let container = container.to_string();
        let status = async move {
            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            let joined = process.join().await;
            if let Err(error) = &joined {
                warn!(container = %container, error = %error, "exec session ended with error");
            }
            exit_code_from_outcome(status.as_ref(), joined.is_ok())
        }
        .boxed();

        Ok(RemoteProcess {
            stdin,
            stdout,
            stderr,
            status,
        })
    }
}
