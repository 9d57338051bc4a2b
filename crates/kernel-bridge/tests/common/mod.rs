//! In-memory Jupyter server for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jupyter_protocol::{Channel, JupyterMessage};
use kernel_bridge::{
    KernelChannel, KernelConnectionMetadata, KernelError, KernelModel, KernelSpec, KernelStatus,
    Prompt, ServerApi, SessionModel,
};
use tokio::sync::{broadcast, watch};

pub struct MemoryChannel {
    kernel_id: String,
    responsive: bool,
    pub closed: AtomicBool,
    iopub: broadcast::Sender<JupyterMessage>,
    status: watch::Sender<KernelStatus>,
}

#[async_trait]
impl KernelChannel for MemoryChannel {
    fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    async fn request(
        &self,
        _channel: Channel,
        message: JupyterMessage,
    ) -> Result<JupyterMessage, KernelError> {
        if !self.responsive {
            std::future::pending::<()>().await;
        }
        // Echo the request back as its own reply
        Ok(message)
    }

    async fn send(&self, _channel: Channel, _message: JupyterMessage) -> Result<(), KernelError> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JupyterMessage> {
        self.iopub.subscribe()
    }

    fn status(&self) -> watch::Receiver<KernelStatus> {
        self.status.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.status.send_replace(KernelStatus::Disposed);
    }
}

/// A Jupyter server that lives in memory.
#[derive(Default)]
pub struct MemoryServer {
    pub specs: Mutex<Vec<KernelSpec>>,
    pub running: Mutex<Vec<KernelModel>>,
    /// Kernels started from now on never answer requests.
    pub unresponsive: AtomicBool,
    pub started: Mutex<Vec<String>>,
    pub shut_down: Mutex<Vec<String>>,
    pub channels: Mutex<Vec<Arc<MemoryChannel>>>,
    pub disposes: AtomicUsize,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn shut_down(&self) -> Vec<String> {
        self.shut_down.lock().unwrap().clone()
    }

    pub fn open_channels(&self) -> usize {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl ServerApi for MemoryServer {
    fn base_url(&self) -> &str {
        "http://memory:8888"
    }

    async fn ready(&self) -> Result<(), KernelError> {
        Ok(())
    }

    async fn kernel_specs(&self) -> Result<Vec<KernelSpec>, KernelError> {
        Ok(self.specs.lock().unwrap().clone())
    }

    async fn running_kernels(&self) -> Result<Vec<KernelModel>, KernelError> {
        Ok(self.running.lock().unwrap().clone())
    }

    async fn running_sessions(&self) -> Result<Vec<SessionModel>, KernelError> {
        Ok(Vec::new())
    }

    async fn kernel(&self, kernel_id: &str) -> Result<KernelModel, KernelError> {
        self.running
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
        let mut started = self.started.lock().unwrap();
        let id = format!("k{}", started.len() + 1);
        started.push(id.clone());
        Ok(kernel_model(&id, metadata.spec_name()))
    }

    async fn connect_kernel(
        &self,
        kernel: &KernelModel,
    ) -> Result<Arc<dyn KernelChannel>, KernelError> {
        let channel = Arc::new(MemoryChannel {
            kernel_id: kernel.id.clone(),
            responsive: !self.unresponsive.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
            iopub: broadcast::channel(16).0,
            status: watch::channel(KernelStatus::Starting).0,
        });
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn interrupt_kernel(&self, _kernel_id: &str) -> Result<(), KernelError> {
        Ok(())
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), KernelError> {
        self.shut_down.lock().unwrap().push(kernel_id.to_string());
        Ok(())
    }

    async fn dispose(&self) {
        self.disposes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn kernel_model(id: &str, name: &str) -> KernelModel {
    KernelModel {
        id: id.to_string(),
        name: name.to_string(),
        last_activity: None,
        execution_state: Some("idle".to_string()),
        connections: 1,
    }
}

/// Answers every prompt with the same choice and counts how often it was
/// asked.
pub struct CountingPrompt {
    answer: Option<String>,
    pub asked: AtomicUsize,
}

impl CountingPrompt {
    pub fn answering(answer: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            answer: answer.map(String::from),
            asked: AtomicUsize::new(0),
        })
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prompt for CountingPrompt {
    async fn show_warning_message(&self, _message: &str, _options: &[&str]) -> Option<String> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}
