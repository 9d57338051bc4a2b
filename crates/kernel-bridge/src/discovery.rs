//! Kernel discovery: what can be started or attached to, locally and on
//! remote servers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::error::KernelError;
use crate::events::RestartSessionEvent;
use crate::host::{InterpreterService, KernelSpecSource};
use crate::metadata::{InterpreterInfo, KernelConnectionMetadata, KernelSpec};
use crate::session_manager::SessionManager;

#[async_trait]
pub trait KernelFinder: Send + Sync {
    /// Every kernel connection available for `resource`. Never fails: errors
    /// are logged and produce an empty list.
    async fn list_kernels(&self, resource: Option<&Path>) -> Vec<KernelConnectionMetadata>;
}

/// Keep the first entry for each id.
fn dedupe(kernels: Vec<KernelConnectionMetadata>) -> Vec<KernelConnectionMetadata> {
    let mut seen = HashSet::new();
    kernels
        .into_iter()
        .filter(|k| seen.insert(k.id().to_string()))
        .collect()
}

/// The interpreter a spec launches, when `argv[0]` is a known interpreter.
async fn spec_interpreter(
    interpreters: Option<&Arc<dyn InterpreterService>>,
    spec: &KernelSpec,
) -> Option<InterpreterInfo> {
    let interpreters = interpreters?;
    let program = spec.argv.first()?;
    let path = PathBuf::from(program);
    if !path.is_absolute() {
        return None;
    }
    interpreters.interpreter_details(&path).await
}

/// Kernel specs installed on this machine plus the active interpreter.
pub struct LocalKernelFinder {
    specs: Arc<dyn KernelSpecSource>,
    interpreters: Option<Arc<dyn InterpreterService>>,
}

impl LocalKernelFinder {
    pub fn new(
        specs: Arc<dyn KernelSpecSource>,
        interpreters: Option<Arc<dyn InterpreterService>>,
    ) -> Self {
        Self {
            specs,
            interpreters,
        }
    }
}

#[async_trait]
impl KernelFinder for LocalKernelFinder {
    async fn list_kernels(&self, resource: Option<&Path>) -> Vec<KernelConnectionMetadata> {
        let mut kernels = Vec::new();

        match self.specs.kernel_specs().await {
            Ok(specs) => {
                for spec in specs {
                    let interpreter = spec_interpreter(self.interpreters.as_ref(), &spec).await;
                    kernels.push(KernelConnectionMetadata::local_spec(spec, interpreter));
                }
            }
            Err(e) => warn!("[discovery] Failed to list local kernel specs: {}", e),
        }

        if let Some(interpreters) = &self.interpreters {
            if let Some(active) = interpreters.active_interpreter(resource).await {
                kernels.push(KernelConnectionMetadata::python_interpreter(active));
            }
        }

        let kernels = dedupe(kernels);
        debug!("[discovery] Found {} local kernels", kernels.len());
        kernels
    }
}

/// Specs and live kernels on one Jupyter server.
pub struct RemoteKernelFinder {
    manager: Arc<SessionManager>,
    interpreters: Option<Arc<dyn InterpreterService>>,
    restart_events: Mutex<broadcast::Receiver<RestartSessionEvent>>,
    restart_kernels: Mutex<HashSet<String>>,
}

impl RemoteKernelFinder {
    /// `restart_events` should come from the manager (or its factory), so
    /// replacement kernels mid-restart stay hidden.
    pub fn new(
        manager: Arc<SessionManager>,
        interpreters: Option<Arc<dyn InterpreterService>>,
        restart_events: broadcast::Receiver<RestartSessionEvent>,
    ) -> Self {
        Self {
            manager,
            interpreters,
            restart_events: Mutex::new(restart_events),
            restart_kernels: Mutex::new(HashSet::new()),
        }
    }

    /// Apply pending restart events and return the kernels to hide.
    fn restart_kernel_ids(&self) -> HashSet<String> {
        let mut events = self
            .restart_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ids = self
            .restart_kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            match events.try_recv() {
                Ok(RestartSessionEvent::Created { kernel_id }) => {
                    ids.insert(kernel_id);
                }
                Ok(RestartSessionEvent::Used { kernel_id }) => {
                    ids.remove(&kernel_id);
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("[discovery] Missed {} restart events", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        ids.clone()
    }

    fn same_machine(&self) -> bool {
        self.manager
            .connection()
            .map(|c| c.local_launch)
            .unwrap_or(false)
    }

    async fn try_list(&self) -> Result<Vec<KernelConnectionMetadata>, KernelError> {
        let api = self.manager.api();
        let base_url = api.base_url().to_string();
        let specs = api.kernel_specs().await?;
        let sessions = self.manager.fetch_running_sessions().await?;
        let running = self.manager.fetch_running_kernels().await?;
        let hidden = self.restart_kernel_ids();

        let interpreters = if self.same_machine() {
            self.interpreters.as_ref()
        } else {
            None
        };

        let mut kernels = Vec::new();
        for spec in &specs {
            let interpreter = spec_interpreter(interpreters, spec).await;
            kernels.push(KernelConnectionMetadata::remote_spec(
                spec.clone(),
                &base_url,
                interpreter,
            ));
        }

        for kernel in running {
            if hidden.contains(&kernel.id) {
                debug!("[discovery] Hiding restart kernel {}", kernel.id);
                continue;
            }
            let session = sessions.iter().find(|s| s.kernel.id == kernel.id);
            let spec = specs.iter().find(|s| s.name == kernel.name).cloned();
            kernels.push(KernelConnectionMetadata::live_remote(
                kernel.into_live(session),
                &base_url,
                spec,
            ));
        }

        Ok(dedupe(kernels))
    }
}

#[async_trait]
impl KernelFinder for RemoteKernelFinder {
    async fn list_kernels(&self, _resource: Option<&Path>) -> Vec<KernelConnectionMetadata> {
        match self.try_list().await {
            Ok(kernels) => kernels,
            Err(e) => {
                warn!("[discovery] Failed to list remote kernels: {}", e);
                Vec::new()
            }
        }
    }
}
