//! kernel-bridge - Jupyter kernel sessions for local and remote kernels.
//!
//! This crate connects a host application to Jupyter-protocol kernels, either
//! spawned on this machine (ZeroMQ via `runtimelib`) or running on a Jupyter
//! server (REST + WebSocket). It includes:
//!
//! - Connection negotiation: tokens, password login, insecure-server prompts
//! - Kernel discovery: installed specs, interpreters, live server kernels
//! - Sessions: the connect/interrupt/restart/dispose state machine
//! - Kernel lifecycle: one kernel per document, status and death events
//! - A server cache that deduplicates concurrent server creation
//!
//! # Starting a kernel
//!
//! ```ignore
//! use kernel_bridge::{
//!     JupyterDataDirSpecs, KernelOptions, KernelProvider, SessionManagerFactory,
//! };
//!
//! let manager = Arc::new(factory.create_local(Arc::new(JupyterDataDirSpecs)));
//! let kernel = provider
//!     .get_or_create("notebook.ipynb", KernelOptions { starter: manager, ..options })
//!     .await;
//! kernel.start(&CancellationToken::new()).await?;
//! kernel.execute("print('hello')").await?;
//! ```

pub mod api;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod host;
pub mod kernel;
pub mod local;
pub mod metadata;
pub mod password;
pub mod remote;
pub mod router;
pub mod server_cache;
pub mod session;
pub mod session_manager;
pub mod settings;
pub mod tls;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use api::{KernelChannel, KernelModel, ServerApi, SessionModel};
pub use connection::{ConnectSettings, ConnectionNegotiator, SecurityPolicy, ServerConnection};
pub use discovery::{KernelFinder, LocalKernelFinder, RemoteKernelFinder};
pub use error::{classify, ErrorReporter, KernelError, RecoveryAction, TimeoutOperation};
pub use events::{KernelEvent, KernelStatus, RestartSessionEvent};
pub use host::{
    AuthHeaderProvider, DependencyManager, InstallResponse, InterpreterService,
    JupyterDataDirSpecs, KernelSpecSource, PasswordProvider, Prompt,
};
pub use kernel::{Kernel, KernelOptions, KernelProvider};
pub use local::LocalKernelServer;
pub use metadata::{InterpreterInfo, KernelConnectionMetadata, KernelSpec, LiveKernelModel};
pub use remote::RemoteServerApi;
pub use server_cache::{DisposableServer, ServerCache, ServerHandle, ServerOptions};
pub use session::{KernelSession, SessionState, SessionTimeouts};
pub use session_manager::{SessionManager, SessionManagerFactory, SessionStarter};
pub use settings::{load_settings, BridgeSettings};
