//! The server-side surface a session talks to.
//!
//! [`ServerApi`] covers the Jupyter REST operations (specs, kernels,
//! sessions); [`KernelChannel`] is one open message connection to a running
//! kernel. Remote servers implement both over HTTP + WebSocket, local
//! kernels over ZeroMQ.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use jupyter_protocol::{Channel, JupyterMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::error::KernelError;
use crate::events::{status_from_execution_state, KernelStatus};
use crate::metadata::{KernelConnectionMetadata, KernelSpec, LiveKernelModel};

/// A kernel as reported by `GET /api/kernels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
    #[serde(default)]
    pub connections: u64,
}

/// A session as reported by `GET /api/sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionModel {
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub session_type: String,
    pub kernel: KernelModel,
}

impl KernelModel {
    /// The reported `execution_state`, `Unknown` when the server sent none.
    pub fn status(&self) -> KernelStatus {
        self.execution_state
            .as_deref()
            .map(status_from_execution_state)
            .unwrap_or(KernelStatus::Unknown)
    }

    /// Merge with the session attached to this kernel, if any.
    pub fn into_live(self, session: Option<&SessionModel>) -> LiveKernelModel {
        LiveKernelModel {
            id: self.id,
            name: self.name,
            last_activity_time: self.last_activity,
            number_of_connections: self.connections,
            execution_state: self.execution_state,
            session_id: session.map(|s| s.id.clone()),
            path: session.map(|s| s.path.clone()).filter(|p| !p.is_empty()),
        }
    }
}

/// One open message connection to a running kernel.
#[async_trait]
pub trait KernelChannel: Send + Sync {
    fn kernel_id(&self) -> &str;

    /// Send a request on `channel` (shell or control) and wait for the reply
    /// whose parent `msg_id` matches the request.
    async fn request(
        &self,
        channel: Channel,
        message: JupyterMessage,
    ) -> Result<JupyterMessage, KernelError>;

    /// Send without waiting for a reply.
    async fn send(&self, channel: Channel, message: JupyterMessage) -> Result<(), KernelError>;

    /// IOPub traffic and anything else not correlated with a request.
    fn subscribe(&self) -> broadcast::Receiver<JupyterMessage>;

    /// Latest kernel status seen on this channel.
    fn status(&self) -> watch::Receiver<KernelStatus>;

    /// Close the connection. Pending requests fail with `SessionDisposed`.
    async fn close(&self);
}

/// REST-level operations on a Jupyter server (or a local stand-in for one).
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Normalized base URL, empty for local kernels.
    fn base_url(&self) -> &str;

    /// Resolves once the server answers requests.
    async fn ready(&self) -> Result<(), KernelError>;

    async fn kernel_specs(&self) -> Result<Vec<KernelSpec>, KernelError>;

    async fn running_kernels(&self) -> Result<Vec<KernelModel>, KernelError>;

    async fn running_sessions(&self) -> Result<Vec<SessionModel>, KernelError>;

    /// Look up one running kernel. `KernelNotFound` if it is gone.
    async fn kernel(&self, kernel_id: &str) -> Result<KernelModel, KernelError>;

    /// Start a new kernel for `metadata`.
    async fn start_kernel(
        &self,
        metadata: &KernelConnectionMetadata,
        working_dir: Option<&Path>,
    ) -> Result<KernelModel, KernelError>;

    /// Open a message connection to a running kernel.
    async fn connect_kernel(
        &self,
        kernel: &KernelModel,
    ) -> Result<Arc<dyn KernelChannel>, KernelError>;

    async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), KernelError>;

    /// Restart a kernel in place, keeping its id.
    async fn restart_kernel(&self, kernel_id: &str) -> Result<(), KernelError> {
        Err(KernelError::Protocol(format!(
            "in-place restart is not supported for kernel {}",
            kernel_id
        )))
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), KernelError>;

    /// Release everything the API holds (connections, child processes).
    async fn dispose(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_model() {
        let json = r#"{
            "id": "s1",
            "path": "notebooks/a.ipynb",
            "name": "a.ipynb",
            "type": "notebook",
            "kernel": {
                "id": "k1",
                "name": "python3",
                "last_activity": "2025-05-14T14:32:23.490000Z",
                "execution_state": "idle",
                "connections": 1
            }
        }"#;
        let session: SessionModel = serde_json::from_str(json).unwrap();
        assert_eq!(session.session_type, "notebook");
        assert_eq!(session.kernel.connections, 1);

        let live = session.kernel.clone().into_live(Some(&session));
        assert_eq!(live.session_id.as_deref(), Some("s1"));
        assert_eq!(live.path.as_deref(), Some("notebooks/a.ipynb"));
        assert!(live.last_activity_time.is_some());
        assert_eq!(session.kernel.status(), KernelStatus::Idle);
    }

    #[test]
    fn test_kernel_model_status() {
        let mut kernel = KernelModel {
            id: "k1".into(),
            name: "python3".into(),
            last_activity: None,
            execution_state: Some("autorestarting".into()),
            connections: 0,
        };
        assert_eq!(kernel.status(), KernelStatus::Restarting);
        kernel.execution_state = None;
        assert_eq!(kernel.status(), KernelStatus::Unknown);
    }

    #[test]
    fn test_kernel_model_tolerates_missing_fields() {
        let model: KernelModel = serde_json::from_str(r#"{"id": "k", "name": "ir"}"#).unwrap();
        assert_eq!(model.connections, 0);
        assert!(model.into_live(None).path.is_none());
    }
}
