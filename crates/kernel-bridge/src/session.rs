//! One connection to one kernel, with its protocol state machine.
//!
//! ```text
//! Idle -> Connecting -> Connected -> Restarting -> Connected
//!                          |                          |
//!                          +------> Disconnecting <---+
//!                                        |
//!                                     Disposed
//! ```
//!
//! `connect` and `restart` are serialized by an operation lock. `dispose`
//! never takes that lock, so a failing `connect` can dispose itself.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use jupyter_protocol::{Channel, ExecuteRequest, JupyterMessage, KernelInfoRequest};
use log::{debug, info, warn};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{KernelChannel, KernelModel, ServerApi};
use crate::error::{KernelError, TimeoutOperation};
use crate::events::{KernelStatus, RestartSessionEvent, EVENT_CHANNEL_CAPACITY};
use crate::metadata::KernelConnectionMetadata;
use crate::settings::BridgeSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Restarting,
    Disconnecting,
    Disposed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Restarting => write!(f, "restarting"),
            SessionState::Disconnecting => write!(f, "disconnecting"),
            SessionState::Disposed => write!(f, "disposed"),
        }
    }
}

/// Timeouts applied by a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub launch: Duration,
    pub interrupt: Duration,
}

impl From<&BridgeSettings> for SessionTimeouts {
    fn from(settings: &BridgeSettings) -> Self {
        Self {
            launch: settings.launch_timeout(),
            interrupt: settings.interrupt_timeout(),
        }
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        SessionTimeouts::from(&BridgeSettings::default())
    }
}

#[derive(Default)]
struct Active {
    kernel: Option<KernelModel>,
    channel: Option<Arc<dyn KernelChannel>>,
    forwarder: Option<JoinHandle<()>>,
}

pub struct KernelSession {
    api: Arc<dyn ServerApi>,
    metadata: KernelConnectionMetadata,
    working_dir: Option<PathBuf>,
    timeouts: SessionTimeouts,
    /// Whether disposing the session shuts the kernel down.
    owns_kernel: bool,
    state_tx: watch::Sender<SessionState>,
    status_tx: watch::Sender<KernelStatus>,
    iopub_tx: broadcast::Sender<JupyterMessage>,
    restart_tx: broadcast::Sender<RestartSessionEvent>,
    active: Mutex<Active>,
    op_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl KernelSession {
    pub fn new(
        api: Arc<dyn ServerApi>,
        metadata: KernelConnectionMetadata,
        working_dir: Option<PathBuf>,
        timeouts: SessionTimeouts,
        restart_tx: broadcast::Sender<RestartSessionEvent>,
    ) -> Self {
        let owns_kernel = metadata.live_kernel_id().is_none();
        Self {
            api,
            metadata,
            working_dir,
            timeouts,
            owns_kernel,
            state_tx: watch::channel(SessionState::Idle).0,
            status_tx: watch::channel(KernelStatus::Unknown).0,
            iopub_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY * 4).0,
            restart_tx,
            active: Mutex::new(Active::default()),
            op_lock: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn metadata(&self) -> &KernelConnectionMetadata {
        &self.metadata
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Id of the kernel currently behind this session.
    pub fn kernel_id(&self) -> Option<String> {
        self.lock_active().kernel.as_ref().map(|k| k.id.clone())
    }

    /// Kernel status. Survives restarts: the same receiver keeps working
    /// after the kernel behind the session is replaced.
    pub fn status(&self) -> watch::Receiver<KernelStatus> {
        self.status_tx.subscribe()
    }

    /// IOPub traffic of whichever kernel is currently behind the session.
    pub fn subscribe_iopub(&self) -> broadcast::Receiver<JupyterMessage> {
        self.iopub_tx.subscribe()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(
                "[session] {} -> {} ({})",
                previous,
                state,
                self.metadata.display_name()
            );
        }
    }

    fn ensure_not_disposed(&self) -> Result<(), KernelError> {
        if self.is_disposed() {
            Err(KernelError::SessionDisposed)
        } else {
            Ok(())
        }
    }

    fn current_channel(&self) -> Result<(Arc<dyn KernelChannel>, KernelModel), KernelError> {
        self.ensure_not_disposed()?;
        let active = self.lock_active();
        match (&active.channel, &active.kernel) {
            (Some(channel), Some(kernel)) => Ok((channel.clone(), kernel.clone())),
            _ => Err(KernelError::Connection(
                "session is not connected to a kernel".to_string(),
            )),
        }
    }

    /// Start (or attach to) the kernel and wait until it answers
    /// `kernel_info`. On any failure the session disposes itself.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), KernelError> {
        let op = self.op_lock.lock().await;
        self.ensure_not_disposed()?;
        if self.state() == SessionState::Connected {
            return Ok(());
        }

        self.set_state(SessionState::Connecting);
        self.status_tx.send_replace(KernelStatus::Starting);

        let launch = self.timeouts.launch;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KernelError::Cancelled),
            outcome = tokio::time::timeout(launch, self.establish()) => match outcome {
                Ok(result) => result,
                Err(_) => Err(KernelError::Timeout {
                    operation: TimeoutOperation::Launch,
                    after: launch,
                }),
            },
        };

        match result {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                self.settle_status();
                info!(
                    "[session] Connected to {} ({})",
                    self.kernel_id().unwrap_or_default(),
                    self.metadata.display_name()
                );
                Ok(())
            }
            Err(e) => {
                drop(op);
                warn!(
                    "[session] Connecting to {} failed: {}",
                    self.metadata.display_name(),
                    e
                );
                self.dispose().await;
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<(), KernelError> {
        let kernel = match self.metadata.live_kernel_id() {
            Some(id) => {
                let kernel = self.api.kernel(id).await?;
                if kernel.status() == KernelStatus::Dead {
                    return Err(KernelError::KernelDied(format!(
                        "kernel {} is {}",
                        id,
                        kernel.execution_state.as_deref().unwrap_or("dead")
                    )));
                }
                kernel
            }
            None => self.start_kernel().await?,
        };
        self.record_kernel(kernel.clone()).await?;

        let channel = self.api.connect_kernel(&kernel).await?;
        self.record_channel(channel.clone()).await?;

        wait_ready(channel.as_ref()).await
    }

    /// Ask the server for a new kernel on a task of its own.
    ///
    /// A server creates the kernel as soon as the request arrives, so the
    /// request is never dropped mid-flight. If the caller stops waiting
    /// (timeout, cancellation) the kernel is shut down once it comes back.
    async fn start_kernel(&self) -> Result<KernelModel, KernelError> {
        let api = self.api.clone();
        let metadata = self.metadata.clone();
        let working_dir = self.working_dir.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let started = api.start_kernel(&metadata, working_dir.as_deref()).await;
            if let Err(Ok(kernel)) = tx.send(started) {
                shutdown_abandoned(api, kernel).await;
            }
        });

        let mut pending = PendingStart {
            rx,
            api: self.api.clone(),
        };
        (&mut pending.rx).await.map_err(|_| {
            KernelError::Connection("kernel start task ended without a result".to_string())
        })?
    }

    /// Remember the kernel so `dispose` can release it, even if connecting
    /// is abandoned later.
    async fn record_kernel(&self, kernel: KernelModel) -> Result<(), KernelError> {
        {
            let mut active = self.lock_active();
            if !self.is_disposed() {
                active.kernel = Some(kernel);
                return Ok(());
            }
        }
        if self.owns_kernel {
            let _ = self.api.shutdown_kernel(&kernel.id).await;
        }
        Err(KernelError::SessionDisposed)
    }

    async fn record_channel(&self, channel: Arc<dyn KernelChannel>) -> Result<(), KernelError> {
        {
            let mut active = self.lock_active();
            if !self.is_disposed() {
                active.forwarder = Some(self.spawn_forwarder(channel.as_ref()));
                active.channel = Some(channel);
                return Ok(());
            }
        }
        channel.close().await;
        Err(KernelError::SessionDisposed)
    }

    /// Copy a channel's IOPub traffic and status into the session's stable
    /// channels.
    fn spawn_forwarder(&self, channel: &dyn KernelChannel) -> JoinHandle<()> {
        let mut messages = channel.subscribe();
        let mut status = channel.status();
        let iopub_tx = self.iopub_tx.clone();
        let status_tx = self.status_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = messages.recv() => match received {
                        Ok(message) => {
                            let _ = iopub_tx.send(message);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("[session] IOPub subscriber lagged, {} messages dropped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *status.borrow_and_update();
                        status_tx.send_replace(current);
                        if current.is_terminal() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// After a successful connect the kernel is at least idle.
    fn settle_status(&self) {
        self.status_tx.send_if_modified(|status| {
            if matches!(
                status,
                KernelStatus::Unknown | KernelStatus::Starting | KernelStatus::Restarting
            ) {
                *status = KernelStatus::Idle;
                true
            } else {
                false
            }
        });
    }

    /// Send a shell request and wait for its reply.
    pub async fn request(&self, message: JupyterMessage) -> Result<JupyterMessage, KernelError> {
        let (channel, _) = self.current_channel()?;
        channel.request(Channel::Shell, message).await
    }

    /// Run `code`, returning the `execute_reply`. Outputs arrive on IOPub.
    pub async fn execute(&self, code: &str) -> Result<JupyterMessage, KernelError> {
        let request: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
        self.request(request).await
    }

    /// Interrupt the kernel and wait for it to go idle.
    pub async fn interrupt(&self) -> Result<(), KernelError> {
        let (_, kernel) = self.current_channel()?;
        let mut status = self.status();
        let after = self.timeouts.interrupt;

        let settle = async {
            self.api.interrupt_kernel(&kernel.id).await?;
            let settled = status
                .wait_for(|s| *s == KernelStatus::Idle || s.is_terminal())
                .await
                .map(|s| *s)
                .map_err(|_| KernelError::SessionDisposed)?;
            match settled {
                KernelStatus::Idle => Ok(()),
                KernelStatus::Disposed => Err(KernelError::SessionDisposed),
                _ => Err(KernelError::KernelDied(format!(
                    "kernel {} died while interrupting",
                    kernel.id
                ))),
            }
        };

        match tokio::time::timeout(after, settle).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "[session] Kernel {} did not settle after interrupt",
                    kernel.id
                );
                Err(KernelError::Timeout {
                    operation: TimeoutOperation::Interrupt,
                    after,
                })
            }
        }
    }

    /// Restart the kernel.
    ///
    /// Kernels this session started are replaced: a new kernel is started and
    /// made ready (announced as a restart session) before the old one is shut
    /// down. Live server kernels are restarted in place. If restarting fails
    /// the old kernel stays in service.
    pub async fn restart(&self) -> Result<(), KernelError> {
        let _op = self.op_lock.lock().await;
        let (old_channel, old_kernel) = self.current_channel()?;

        self.set_state(SessionState::Restarting);
        self.status_tx.send_replace(KernelStatus::Restarting);

        let result = if self.owns_kernel {
            self.replace_kernel(old_channel, old_kernel).await
        } else {
            self.restart_in_place(old_channel, &old_kernel).await
        };

        if self.is_disposed() {
            return Err(KernelError::SessionDisposed);
        }
        self.set_state(SessionState::Connected);
        self.settle_status();
        result
    }

    async fn restart_in_place(
        &self,
        channel: Arc<dyn KernelChannel>,
        kernel: &KernelModel,
    ) -> Result<(), KernelError> {
        self.api.restart_kernel(&kernel.id).await?;
        bounded_launch(self.timeouts.launch, wait_ready(channel.as_ref())).await?;
        info!("[session] Kernel {} restarted in place", kernel.id);
        Ok(())
    }

    async fn replace_kernel(
        &self,
        old_channel: Arc<dyn KernelChannel>,
        old_kernel: KernelModel,
    ) -> Result<(), KernelError> {
        let launch = self.timeouts.launch;
        let new_kernel = bounded_launch(launch, self.start_kernel()).await?;
        let _ = self.restart_tx.send(RestartSessionEvent::Created {
            kernel_id: new_kernel.id.clone(),
        });

        let connected = bounded_launch(launch, async {
            let channel = self.api.connect_kernel(&new_kernel).await?;
            if let Err(e) = wait_ready(channel.as_ref()).await {
                channel.close().await;
                return Err(e);
            }
            Ok(channel)
        })
        .await;

        let new_channel = match connected {
            Ok(channel) => channel,
            Err(e) => {
                warn!(
                    "[session] Replacement kernel {} failed: {}",
                    new_kernel.id, e
                );
                let _ = self.api.shutdown_kernel(&new_kernel.id).await;
                return Err(e);
            }
        };

        let old_forwarder = {
            let mut active = self.lock_active();
            if self.is_disposed() {
                None
            } else {
                let forwarder = active.forwarder.take();
                active.forwarder = Some(self.spawn_forwarder(new_channel.as_ref()));
                active.channel = Some(new_channel.clone());
                active.kernel = Some(new_kernel.clone());
                Some(forwarder)
            }
        };
        let Some(old_forwarder) = old_forwarder else {
            new_channel.close().await;
            let _ = self.api.shutdown_kernel(&new_kernel.id).await;
            return Err(KernelError::SessionDisposed);
        };

        let _ = self.restart_tx.send(RestartSessionEvent::Used {
            kernel_id: new_kernel.id.clone(),
        });

        if let Some(forwarder) = old_forwarder {
            forwarder.abort();
        }
        old_channel.close().await;
        if let Err(e) = self.api.shutdown_kernel(&old_kernel.id).await {
            warn!(
                "[session] Failed to shut down replaced kernel {}: {}",
                old_kernel.id, e
            );
        }
        info!(
            "[session] Kernel {} replaced by {}",
            old_kernel.id, new_kernel.id
        );
        Ok(())
    }

    /// Ask the server to shut the kernel down, then dispose the session.
    pub async fn shutdown(&self) -> Result<(), KernelError> {
        self.ensure_not_disposed()?;
        self.release(true).await;
        Ok(())
    }

    /// Release the channel (and the kernel, if this session started it).
    /// Idempotent; later calls on the session fail with `SessionDisposed`.
    pub async fn dispose(&self) {
        self.release(self.owns_kernel).await;
    }

    async fn release(&self, shutdown_kernel: bool) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Disconnecting);

        let active = std::mem::take(&mut *self.lock_active());
        if let Some(forwarder) = active.forwarder {
            forwarder.abort();
        }
        if let Some(channel) = active.channel {
            channel.close().await;
        }
        if let (true, Some(kernel)) = (shutdown_kernel, active.kernel) {
            if let Err(e) = self.api.shutdown_kernel(&kernel.id).await {
                warn!("[session] Failed to shut down kernel {}: {}", kernel.id, e);
            }
        }

        self.status_tx.send_replace(KernelStatus::Disposed);
        self.set_state(SessionState::Disposed);
    }
}

/// Receiving end of a kernel start. Dropped before the result was taken,
/// it shuts down whatever kernel the server hands back.
struct PendingStart {
    rx: oneshot::Receiver<Result<KernelModel, KernelError>>,
    api: Arc<dyn ServerApi>,
}

impl Drop for PendingStart {
    fn drop(&mut self) {
        // Closing first means the start task either sees the receiver gone
        // or has already delivered a result we can pick up here.
        self.rx.close();
        if let Ok(Ok(kernel)) = self.rx.try_recv() {
            tokio::spawn(shutdown_abandoned(self.api.clone(), kernel));
        }
    }
}

async fn shutdown_abandoned(api: Arc<dyn ServerApi>, kernel: KernelModel) {
    info!("[session] Shutting down abandoned kernel {}", kernel.id);
    if let Err(e) = api.shutdown_kernel(&kernel.id).await {
        warn!(
            "[session] Failed to shut down abandoned kernel {}: {}",
            kernel.id, e
        );
    }
}

/// Ready means the kernel answered `kernel_info`.
async fn wait_ready(channel: &dyn KernelChannel) -> Result<(), KernelError> {
    let request: JupyterMessage = KernelInfoRequest::default().into();
    let reply = channel.request(Channel::Shell, request).await?;
    debug!(
        "[session] Kernel {} alive: got {}",
        channel.kernel_id(),
        reply.header.msg_type
    );
    Ok(())
}

async fn bounded_launch<T>(
    limit: Duration,
    operation: impl std::future::Future<Output = Result<T, KernelError>>,
) -> Result<T, KernelError> {
    tokio::time::timeout(limit, operation)
        .await
        .unwrap_or(Err(KernelError::Timeout {
            operation: TimeoutOperation::Launch,
            after: limit,
        }))
}
