//! Per-server session management.
//!
//! A [`SessionManager`] owns the [`ServerApi`] for one server (or for the
//! local machine) and creates [`KernelSession`]s on it. Managers are built by
//! a [`SessionManagerFactory`], which funnels every manager's restart events
//! into one stable channel.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{KernelModel, ServerApi, SessionModel};
use crate::connection::{ConnectSettings, ConnectionNegotiator, ServerConnection};
use crate::error::KernelError;
use crate::events::{event_channel, RestartSessionEvent};
use crate::host::KernelSpecSource;
use crate::local::LocalKernelServer;
use crate::metadata::{KernelConnectionMetadata, KernelSpec};
use crate::remote::RemoteServerApi;
use crate::session::{KernelSession, SessionTimeouts};
use crate::settings::BridgeSettings;

/// How long `dispose` waits for the server before tearing down anyway.
const DISPOSE_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can start kernel sessions.
#[async_trait]
pub trait SessionStarter: Send + Sync {
    async fn start_session(
        &self,
        resource: Option<&Path>,
        metadata: &KernelConnectionMetadata,
        working_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<Arc<KernelSession>, KernelError>;
}

pub struct SessionManager {
    api: Arc<dyn ServerApi>,
    connection: Option<ServerConnection>,
    timeouts: SessionTimeouts,
    spec_refresh_timeout: Duration,
    restart_tx: broadcast::Sender<RestartSessionEvent>,
    last_specs: Mutex<Vec<KernelSpec>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl SessionManager {
    /// Negotiate transport settings for `connection` and build its API.
    pub async fn initialize<F>(
        connection: ServerConnection,
        negotiator: &ConnectionNegotiator,
        api_factory: F,
        settings: &BridgeSettings,
    ) -> Result<Self, KernelError>
    where
        F: FnOnce(ConnectSettings) -> Result<Arc<dyn ServerApi>, KernelError>,
    {
        let connect_settings = negotiator
            .get_server_connect_settings(&connection)
            .await
            .map_err(|e| match e {
                KernelError::Password(_)
                | KernelError::InsecureSessionDenied { .. }
                | KernelError::UntrustedCertificate { .. }
                | KernelError::Cancelled
                | KernelError::Connection(_) => e,
                other => KernelError::Connection(other.to_string()),
            })?;
        let api = api_factory(connect_settings)?;
        info!(
            "[session-manager] Initialized for {}",
            connection.display_name
        );
        Ok(Self::new(api, Some(connection), settings))
    }

    /// A manager over an already-built API.
    pub fn new(
        api: Arc<dyn ServerApi>,
        connection: Option<ServerConnection>,
        settings: &BridgeSettings,
    ) -> Self {
        Self {
            api,
            connection,
            timeouts: SessionTimeouts::from(settings),
            spec_refresh_timeout: settings.spec_refresh_timeout(),
            restart_tx: event_channel(),
            last_specs: Mutex::new(Vec::new()),
            forwarder: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn api(&self) -> &Arc<dyn ServerApi> {
        &self.api
    }

    pub fn connection(&self) -> Option<&ServerConnection> {
        self.connection.as_ref()
    }

    /// Restart-session events of every session this manager created.
    pub fn restart_events(&self) -> broadcast::Receiver<RestartSessionEvent> {
        self.restart_tx.subscribe()
    }

    fn forward_restart_events(&self, target: broadcast::Sender<RestartSessionEvent>) {
        let mut events = self.restart_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let _ = target.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[session-manager] Dropped {} restart events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.forwarder.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Create a session and connect it. On failure the session has already
    /// disposed itself.
    pub async fn start_new(
        &self,
        resource: Option<&Path>,
        metadata: &KernelConnectionMetadata,
        working_dir: Option<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<Arc<KernelSession>, KernelError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(KernelError::SessionDisposed);
        }
        let working_dir = working_dir.or_else(|| {
            resource
                .and_then(|r| r.parent())
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
        });
        debug!(
            "[session-manager] Starting {} for {:?}",
            metadata.display_name(),
            resource
        );

        let session = Arc::new(KernelSession::new(
            self.api.clone(),
            metadata.clone(),
            working_dir,
            self.timeouts,
            self.restart_tx.clone(),
        ));
        session.connect(cancel).await?;
        Ok(session)
    }

    /// Kernel specs on the server.
    ///
    /// The refresh is bounded; when it fails, times out, or comes back empty
    /// the last good list is used, and if there never was one a default
    /// Python spec stands in.
    pub async fn get_kernel_specs(&self) -> Vec<KernelSpec> {
        match tokio::time::timeout(self.spec_refresh_timeout, self.api.kernel_specs()).await {
            Ok(Ok(specs)) if !specs.is_empty() => {
                *self
                    .last_specs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = specs.clone();
                return specs;
            }
            Ok(Ok(_)) => warn!("[session-manager] Server returned no kernel specs"),
            Ok(Err(e)) => warn!("[session-manager] Failed to fetch kernel specs: {}", e),
            Err(_) => warn!(
                "[session-manager] Kernel spec refresh timed out after {:?}",
                self.spec_refresh_timeout
            ),
        }

        let cached = self
            .last_specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if cached.is_empty() {
            vec![KernelSpec::default_python()]
        } else {
            cached
        }
    }

    pub async fn fetch_running_kernels(&self) -> Result<Vec<KernelModel>, KernelError> {
        let kernels = self.api.running_kernels().await?;
        let mut seen = HashSet::new();
        Ok(kernels
            .into_iter()
            .filter(|k| seen.insert(k.id.clone()))
            .collect())
    }

    pub async fn fetch_running_sessions(&self) -> Result<Vec<SessionModel>, KernelError> {
        let sessions = self.api.running_sessions().await?;
        let mut seen = HashSet::new();
        Ok(sessions
            .into_iter()
            .filter(|s| seen.insert(s.kernel.id.clone()))
            .collect())
    }

    /// Running kernels, deduplicated by id. Errors yield an empty list.
    pub async fn get_running_kernels(&self) -> Vec<KernelModel> {
        self.fetch_running_kernels().await.unwrap_or_else(|e| {
            warn!("[session-manager] Failed to list running kernels: {}", e);
            Vec::new()
        })
    }

    /// Running sessions, one per kernel. Errors yield an empty list.
    pub async fn get_running_sessions(&self) -> Vec<SessionModel> {
        self.fetch_running_sessions().await.unwrap_or_else(|e| {
            warn!("[session-manager] Failed to list running sessions: {}", e);
            Vec::new()
        })
    }

    /// Tear down the API. Never fails; idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::time::timeout(DISPOSE_READY_TIMEOUT, self.api.ready()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[session-manager] Server not ready during dispose: {}", e),
            Err(_) => warn!("[session-manager] Server readiness timed out during dispose"),
        }
        self.api.dispose().await;
        if let Some(connection) = &self.connection {
            connection.run_dispose_hook();
        }
        if let Some(task) = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        info!("[session-manager] Disposed");
    }
}

#[async_trait]
impl SessionStarter for SessionManager {
    async fn start_session(
        &self,
        resource: Option<&Path>,
        metadata: &KernelConnectionMetadata,
        working_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<Arc<KernelSession>, KernelError> {
        self.start_new(resource, metadata, working_dir.map(Path::to_path_buf), cancel)
            .await
    }
}

/// Builds session managers that share one restart event channel.
pub struct SessionManagerFactory {
    negotiator: Arc<ConnectionNegotiator>,
    settings: BridgeSettings,
    restart_tx: broadcast::Sender<RestartSessionEvent>,
}

impl SessionManagerFactory {
    pub fn new(negotiator: Arc<ConnectionNegotiator>, settings: BridgeSettings) -> Self {
        Self {
            negotiator,
            settings,
            restart_tx: event_channel(),
        }
    }

    /// Restart-session events of every manager this factory created.
    pub fn restart_events(&self) -> broadcast::Receiver<RestartSessionEvent> {
        self.restart_tx.subscribe()
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Manager for a remote Jupyter server.
    pub async fn create_remote(
        &self,
        connection: ServerConnection,
    ) -> Result<SessionManager, KernelError> {
        let manager = SessionManager::initialize(
            connection,
            &self.negotiator,
            |settings| Ok(Arc::new(RemoteServerApi::new(settings)?) as Arc<dyn ServerApi>),
            &self.settings,
        )
        .await?;
        manager.forward_restart_events(self.restart_tx.clone());
        Ok(manager)
    }

    /// Manager for kernels spawned on this machine.
    pub fn create_local(&self, specs: Arc<dyn KernelSpecSource>) -> SessionManager {
        self.create_with_api(Arc::new(LocalKernelServer::new(specs)))
    }

    pub fn create_with_api(&self, api: Arc<dyn ServerApi>) -> SessionManager {
        let manager = SessionManager::new(api, None, &self.settings);
        manager.forward_restart_events(self.restart_tx.clone());
        manager
    }
}
