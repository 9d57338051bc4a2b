//! In-memory `ServerApi` / `KernelChannel` doubles for unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jupyter_protocol::{Channel, JupyterMessage};
use tokio::sync::{broadcast, watch};

use crate::api::{KernelChannel, KernelModel, ServerApi, SessionModel};
use crate::error::KernelError;
use crate::events::KernelStatus;
use crate::metadata::{KernelConnectionMetadata, KernelSpec};
use crate::router::testing::status_message;

pub struct FakeChannel {
    pub kernel_id: String,
    pub hang_requests: AtomicBool,
    pub requests: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
    pub iopub_tx: broadcast::Sender<JupyterMessage>,
    pub status_tx: watch::Sender<KernelStatus>,
}

impl FakeChannel {
    pub fn new(kernel_id: &str, hang_requests: bool) -> Arc<Self> {
        Arc::new(Self {
            kernel_id: kernel_id.to_string(),
            hang_requests: AtomicBool::new(hang_requests),
            requests: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            iopub_tx: broadcast::channel(16).0,
            status_tx: watch::channel(KernelStatus::Starting).0,
        })
    }

    pub fn set_status(&self, status: KernelStatus) {
        self.status_tx.send_replace(status);
    }

    pub fn request_types(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl KernelChannel for FakeChannel {
    fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    async fn request(
        &self,
        _channel: Channel,
        message: JupyterMessage,
    ) -> Result<JupyterMessage, KernelError> {
        self.requests
            .lock()
            .unwrap()
            .push(message.header.msg_type.clone());
        if self.hang_requests.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(status_message("idle", Some(&message.header.msg_id)))
    }

    async fn send(&self, _channel: Channel, message: JupyterMessage) -> Result<(), KernelError> {
        self.requests
            .lock()
            .unwrap()
            .push(message.header.msg_type.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JupyterMessage> {
        self.iopub_tx.subscribe()
    }

    fn status(&self) -> watch::Receiver<KernelStatus> {
        self.status_tx.subscribe()
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.status_tx.send_replace(KernelStatus::Disposed);
    }
}

#[derive(Default)]
pub struct FakeServerApi {
    pub specs: Mutex<Vec<KernelSpec>>,
    pub specs_error: Mutex<Option<KernelError>>,
    pub specs_delay: Mutex<Option<Duration>>,
    pub kernels: Mutex<Vec<KernelModel>>,
    pub sessions: Mutex<Vec<SessionModel>>,
    pub start_error: Mutex<Option<KernelError>>,
    /// The kernel exists on the server as soon as the start request
    /// arrives; the reply comes this much later.
    pub start_delay: Mutex<Option<Duration>>,
    /// Channels opened from now on never answer requests.
    pub hang_requests: AtomicBool,
    /// `interrupt_kernel` reports the kernel idle afterwards.
    pub interrupt_settles: AtomicBool,
    pub started: Mutex<Vec<String>>,
    pub shutdowns: Mutex<Vec<String>>,
    pub restarts: Mutex<Vec<String>>,
    pub interrupts: AtomicUsize,
    pub ready_calls: AtomicUsize,
    pub disposes: AtomicUsize,
    pub channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeServerApi {
    pub fn new() -> Arc<Self> {
        let api = Self::default();
        api.interrupt_settles.store(true, Ordering::SeqCst);
        Arc::new(api)
    }

    pub fn channel(&self, index: usize) -> Arc<FakeChannel> {
        self.channels.lock().unwrap()[index].clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn shutdowns(&self) -> Vec<String> {
        self.shutdowns.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServerApi for FakeServerApi {
    fn base_url(&self) -> &str {
        "http://fake:8888"
    }

    async fn ready(&self) -> Result<(), KernelError> {
        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn kernel_specs(&self) -> Result<Vec<KernelSpec>, KernelError> {
        let delay = *self.specs_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.specs_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.specs.lock().unwrap().clone())
    }

    async fn running_kernels(&self) -> Result<Vec<KernelModel>, KernelError> {
        Ok(self.kernels.lock().unwrap().clone())
    }

    async fn running_sessions(&self) -> Result<Vec<SessionModel>, KernelError> {
        Ok(self.sessions.lock().unwrap().clone())
    }

    async fn kernel(&self, kernel_id: &str) -> Result<KernelModel, KernelError> {
        self.kernels
            .lock()
            .unwrap()
            .iter()
            .find(|k| k.id == kernel_id)
            .cloned()
            .ok_or_else(|| KernelError::KernelNotFound(kernel_id.to_string()))
    }

    async fn start_kernel(
        &self,
        metadata: &KernelConnectionMetadata,
        _working_dir: Option<&Path>,
    ) -> Result<KernelModel, KernelError> {
        if let Some(err) = self.start_error.lock().unwrap().clone() {
            return Err(err);
        }
        let id = {
            let mut started = self.started.lock().unwrap();
            let id = format!("kernel-{}", started.len() + 1);
            started.push(id.clone());
            id
        };
        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(KernelModel {
            id,
            name: metadata.spec_name().to_string(),
            last_activity: None,
            execution_state: Some("starting".into()),
            connections: 0,
        })
    }

    async fn connect_kernel(
        &self,
        kernel: &KernelModel,
    ) -> Result<Arc<dyn KernelChannel>, KernelError> {
        let channel = FakeChannel::new(&kernel.id, self.hang_requests.load(Ordering::SeqCst));
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn interrupt_kernel(&self, _kernel_id: &str) -> Result<(), KernelError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        if self.interrupt_settles.load(Ordering::SeqCst) {
            for channel in self.channels.lock().unwrap().iter() {
                channel.set_status(KernelStatus::Idle);
            }
        }
        Ok(())
    }

    async fn restart_kernel(&self, kernel_id: &str) -> Result<(), KernelError> {
        self.restarts.lock().unwrap().push(kernel_id.to_string());
        Ok(())
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), KernelError> {
        self.shutdowns.lock().unwrap().push(kernel_id.to_string());
        Ok(())
    }

    async fn dispose(&self) {
        self.disposes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn python_metadata() -> KernelConnectionMetadata {
    KernelConnectionMetadata::local_spec(KernelSpec::default_python(), None)
}
