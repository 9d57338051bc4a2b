//! Kernel lifecycle: one [`Kernel`] per document, owned by a
//! [`KernelProvider`].
//!
//! A `Kernel` wraps the [`KernelSession`] behind it, republishes its status as
//! [`KernelEvent`]s, and handles start failures (installing missing
//! dependencies once before giving up). The provider guarantees at most one
//! live kernel per document identity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::future::join_all;
use jupyter_protocol::JupyterMessage;
use log::{debug, info, warn};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{classify, KernelError, RecoveryAction};
use crate::events::{event_channel, KernelEvent, KernelStatus};
use crate::host::{DependencyManager, InstallResponse};
use crate::metadata::KernelConnectionMetadata;
use crate::session::KernelSession;
use crate::session_manager::SessionStarter;

/// Everything needed to build a kernel for one document.
#[derive(Clone)]
pub struct KernelOptions {
    pub metadata: KernelConnectionMetadata,
    /// The document the kernel runs for.
    pub resource: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub starter: Arc<dyn SessionStarter>,
    pub dependency_manager: Option<Arc<dyn DependencyManager>>,
}

pub struct Kernel {
    options: KernelOptions,
    status_tx: watch::Sender<KernelStatus>,
    events: broadcast::Sender<KernelEvent>,
    session: Mutex<Option<Arc<KernelSession>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    start_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl Kernel {
    fn new(options: KernelOptions) -> Self {
        Self {
            options,
            status_tx: watch::channel(KernelStatus::Unknown).0,
            events: event_channel(),
            session: Mutex::new(None),
            watcher: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn metadata(&self) -> &KernelConnectionMetadata {
        &self.options.metadata
    }

    pub fn resource(&self) -> Option<&Path> {
        self.options.resource.as_deref()
    }

    pub fn status(&self) -> watch::Receiver<KernelStatus> {
        self.status_tx.subscribe()
    }

    pub fn current_status(&self) -> KernelStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> Option<Arc<KernelSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn publish(&self, status: KernelStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous == status {
            return;
        }
        debug!(
            "[kernel] {} -> {} ({})",
            previous,
            status,
            self.metadata().display_name()
        );
        let _ = self.events.send(KernelEvent::StatusChanged(status));
        if status == KernelStatus::Dead && !self.is_disposed() {
            warn!("[kernel] {} died", self.metadata().display_name());
            let _ = self.events.send(KernelEvent::Died {
                reason: format!(
                    "Kernel {} exited unexpectedly",
                    self.metadata().display_name()
                ),
            });
        }
    }

    /// Start the kernel, or return the running session.
    ///
    /// A session whose kernel died is thrown away and a fresh one started.
    /// A missing dependency is handed to the dependency manager; if it
    /// installs it the launch is retried once. Declining the install or
    /// cancelling leaves the kernel unstarted; any other failure leaves it
    /// `Dead`.
    pub async fn start(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<Arc<KernelSession>, KernelError> {
        let _start = self.start_lock.lock().await;
        if self.is_disposed() {
            return Err(KernelError::SessionDisposed);
        }
        if let Some(session) = self.session() {
            if !self.session_is_dead(&session) {
                return Ok(session);
            }
            self.discard_session().await;
        }

        self.publish(KernelStatus::Starting);
        let mut retried = false;
        let session = loop {
            let attempt = self
                .options
                .starter
                .start_session(
                    self.options.resource.as_deref(),
                    &self.options.metadata,
                    self.options.working_dir.as_deref(),
                    cancel,
                )
                .await;
            match attempt {
                Ok(session) => break session,
                Err(e) if e.is_cancellation() => {
                    self.publish(KernelStatus::Unknown);
                    return Err(e);
                }
                Err(e)
                    if !retried
                        && self.options.dependency_manager.is_some()
                        && classify(&e) == RecoveryAction::PromptInstall =>
                {
                    retried = true;
                    if !self.install_dependencies(&e).await {
                        self.publish(KernelStatus::Unknown);
                        return Err(KernelError::Cancelled);
                    }
                    info!("[kernel] Dependencies installed, retrying launch");
                }
                Err(e) => {
                    warn!(
                        "[kernel] Failed to start {}: {}",
                        self.metadata().display_name(),
                        e
                    );
                    self.publish(KernelStatus::Dead);
                    return Err(e);
                }
            }
        };

        let stored = {
            let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_disposed() {
                false
            } else {
                *slot = Some(session.clone());
                true
            }
        };
        if !stored {
            session.dispose().await;
            return Err(KernelError::SessionDisposed);
        }

        let current = *session.status().borrow();
        self.publish(current);
        self.watch_session(&session);
        let _ = self.events.send(KernelEvent::Started);
        info!("[kernel] Started {}", self.metadata().display_name());
        Ok(session)
    }

    fn session_is_dead(&self, session: &KernelSession) -> bool {
        session.status().borrow().is_terminal() || self.current_status() == KernelStatus::Dead
    }

    async fn discard_session(&self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
        let stale = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stale) = stale {
            info!(
                "[kernel] Discarding dead session of {}",
                self.metadata().display_name()
            );
            stale.dispose().await;
        }
    }

    /// Returns whether the launch should be retried.
    async fn install_dependencies(&self, error: &KernelError) -> bool {
        let Some(manager) = &self.options.dependency_manager else {
            return false;
        };
        match manager.install_missing_dependencies(error).await {
            InstallResponse::Ok => true,
            InstallResponse::SelectAnother | InstallResponse::Cancel => {
                info!("[kernel] Dependency install declined");
                false
            }
        }
    }

    /// Mirror the session's status into the kernel's.
    fn watch_session(self: &Arc<Self>, session: &KernelSession) {
        let mut status = session.status();
        let kernel: Weak<Kernel> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let current = *status.borrow_and_update();
                let Some(kernel) = kernel.upgrade() else {
                    break;
                };
                // Disposal publishes its own status
                if current == KernelStatus::Disposed || kernel.is_disposed() {
                    break;
                }
                if current != KernelStatus::Unknown {
                    kernel.publish(current);
                }
                drop(kernel);
                if status.changed().await.is_err() {
                    break;
                }
            }
        });

        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn running_session(&self) -> Result<Arc<KernelSession>, KernelError> {
        if self.is_disposed() {
            return Err(KernelError::SessionDisposed);
        }
        self.session().ok_or_else(|| {
            KernelError::Connection(format!(
                "kernel {} has not been started",
                self.metadata().display_name()
            ))
        })
    }

    pub async fn execute(&self, code: &str) -> Result<JupyterMessage, KernelError> {
        self.running_session()?.execute(code).await
    }

    pub async fn interrupt(&self) -> Result<(), KernelError> {
        self.running_session()?.interrupt().await
    }

    pub async fn restart(&self) -> Result<(), KernelError> {
        self.running_session()?.restart().await?;
        let _ = self.events.send(KernelEvent::Restarted);
        Ok(())
    }

    /// Flag the kernel disposed and fire `Disposed`, without waiting for
    /// teardown. Returns false if it already was.
    pub(crate) fn mark_disposed(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
        self.publish(KernelStatus::Disposed);
        let _ = self.events.send(KernelEvent::Disposed);
        true
    }

    pub async fn dispose(&self) {
        if self.mark_disposed() {
            debug!("[kernel] Disposing {}", self.metadata().display_name());
        }
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.dispose().await;
        }
    }
}

/// Kernels keyed by document identity.
#[derive(Default)]
pub struct KernelProvider {
    kernels: Mutex<HashMap<String, Arc<Kernel>>>,
}

impl KernelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The kernel for `identity`, created if there is none for this
    /// connection.
    ///
    /// A kernel for a different connection, or one that died, is replaced:
    /// it is removed and marked disposed in the same critical section that
    /// inserts the new one, then torn down before this returns.
    pub async fn get_or_create(&self, identity: &str, options: KernelOptions) -> Arc<Kernel> {
        let (kernel, replaced) = {
            let mut kernels = self.kernels.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = kernels.get(identity) {
                if existing.metadata().id() == options.metadata.id()
                    && !existing.is_disposed()
                    && existing.current_status() != KernelStatus::Dead
                {
                    return existing.clone();
                }
            }
            let kernel = Arc::new(Kernel::new(options));
            let replaced = kernels.insert(identity.to_string(), kernel.clone());
            if let Some(old) = &replaced {
                old.mark_disposed();
            }
            (kernel, replaced)
        };

        if let Some(old) = replaced {
            info!(
                "[kernel] Replacing {} with {} for {}",
                old.metadata().display_name(),
                kernel.metadata().display_name(),
                identity
            );
            old.dispose().await;
        }
        kernel
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Kernel>> {
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn dispose_kernel(&self, identity: &str) {
        let removed = self
            .kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity);
        if let Some(kernel) = removed {
            kernel.dispose().await;
        }
    }

    pub async fn dispose_all(&self) {
        let kernels: Vec<_> = self
            .kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, kernel)| kernel)
            .collect();
        if !kernels.is_empty() {
            info!("[kernel] Disposing {} kernels", kernels.len());
        }
        join_all(kernels.iter().map(|k| k.dispose())).await;
    }
}
