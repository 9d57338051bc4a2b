//! Kernels launched as child processes on this machine.
//!
//! [`LocalKernelServer`] plays the role of a Jupyter server for local
//! kernels: it writes a connection file, spawns the kernel in its own process
//! group, and talks to it over ZeroMQ through `runtimelib`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jupyter_protocol::{
    Channel, ConnectionInfo, InterruptRequest, JupyterMessage, ShutdownRequest,
};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::{KernelChannel, KernelModel, ServerApi, SessionModel};
use crate::error::KernelError;
use crate::events::KernelStatus;
use crate::host::KernelSpecSource;
use crate::metadata::{KernelConnectionMetadata, KernelSpec};
use crate::router::MessageRouter;

/// How long a spawned kernel gets to open its ports.
const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_secs(30);

fn connection_error(err: impl std::fmt::Display) -> KernelError {
    KernelError::Connection(err.to_string())
}

/// Exit code of the kernel process once it has exited.
type ExitState = Option<Option<i32>>;

struct LocalKernel {
    id: String,
    spec: KernelSpec,
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
    started: DateTime<Utc>,
    #[cfg(unix)]
    process_group_id: Option<i32>,
    exit_rx: watch::Receiver<ExitState>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    connections: AtomicU64,
    killed: AtomicBool,
}

impl LocalKernel {
    fn exit_status(&self) -> ExitState {
        *self.exit_rx.borrow()
    }

    fn model(&self) -> KernelModel {
        KernelModel {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            last_activity: Some(self.started),
            execution_state: Some(if self.exit_status().is_some() {
                "dead".to_string()
            } else {
                "idle".to_string()
            }),
            connections: self.connections.load(Ordering::SeqCst),
        }
    }

    /// Kill the process group and remove the connection file. Idempotent.
    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }

        #[cfg(unix)]
        if let Some(pgid) = self.process_group_id {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    error!(
                        "[local-kernel] Failed to kill process group {}: {}",
                        pgid, e
                    );
                }
            }
        }

        // Dropping the child (kill_on_drop) covers platforms without process groups
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }

        let _ = std::fs::remove_file(&self.connection_file);
    }

    async fn control_request(
        &self,
        session_id: &str,
        message: JupyterMessage,
    ) -> Result<JupyterMessage, KernelError> {
        let msg_id = message.header.msg_id.clone();
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, session_id)
                .await
                .map_err(connection_error)?;
        control.send(message).await.map_err(connection_error)?;
        loop {
            let reply = control.read().await.map_err(connection_error)?;
            if reply.parent_header.as_ref().map(|h| h.msg_id.as_str()) == Some(msg_id.as_str()) {
                return Ok(reply);
            }
        }
    }
}

impl Drop for LocalKernel {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Check whether the kernel answers a heartbeat within `timeout`.
async fn check_kernel_alive(connection_info: &ConnectionInfo, timeout: Duration) -> bool {
    let heartbeat_result = tokio::time::timeout(timeout, async {
        let mut hb = runtimelib::create_client_heartbeat_connection(connection_info).await?;
        hb.single_heartbeat().await
    })
    .await;

    matches!(heartbeat_result, Ok(Ok(())))
}

/// Substitute `{connection_file}` and swap a bare `python` for the chosen
/// interpreter.
fn kernel_argv(
    spec: &KernelSpec,
    connection_file: &Path,
    interpreter: Option<&Path>,
) -> Vec<String> {
    let connection_file = connection_file.to_string_lossy();
    spec.argv
        .iter()
        .enumerate()
        .map(|(i, arg)| {
            if i == 0 && matches!(arg.as_str(), "python" | "python3") {
                if let Some(path) = interpreter {
                    return path.to_string_lossy().into_owned();
                }
            }
            arg.replace("{connection_file}", &connection_file)
        })
        .collect()
}

fn launches_ipykernel(argv: &[String]) -> bool {
    argv.iter()
        .any(|arg| arg == "ipykernel_launcher" || arg == "ipykernel")
}

/// Fail with `DependencyMissing` if `interpreter` cannot import ipykernel.
async fn ensure_ipykernel(interpreter: &str) -> Result<(), KernelError> {
    let status = tokio::process::Command::new(interpreter)
        .args(["-c", "import ipykernel"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| KernelError::Io(format!("{}: {}", interpreter, e)))?;
    if status.success() {
        Ok(())
    } else {
        Err(KernelError::DependencyMissing {
            module: "ipykernel".to_string(),
            interpreter: PathBuf::from(interpreter),
        })
    }
}

/// Stand-in server for kernels spawned on this machine.
pub struct LocalKernelServer {
    specs: Arc<dyn KernelSpecSource>,
    kernels: Mutex<HashMap<String, Arc<LocalKernel>>>,
    port_timeout: Duration,
}

impl LocalKernelServer {
    pub fn new(specs: Arc<dyn KernelSpecSource>) -> Self {
        Self {
            specs,
            kernels: Mutex::new(HashMap::new()),
            port_timeout: DEFAULT_PORT_TIMEOUT,
        }
    }

    pub fn with_port_timeout(mut self, timeout: Duration) -> Self {
        self.port_timeout = timeout;
        self
    }

    fn find(&self, kernel_id: &str) -> Result<Arc<LocalKernel>, KernelError> {
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kernel_id)
            .cloned()
            .ok_or_else(|| KernelError::KernelNotFound(kernel_id.to_string()))
    }

    async fn wait_for_ports(&self, kernel: &LocalKernel) -> Result<(), KernelError> {
        let started = Instant::now();
        loop {
            if let Some(exit_code) = kernel.exit_status() {
                return Err(KernelError::KernelProcessExited { exit_code });
            }
            if check_kernel_alive(&kernel.connection_info, Duration::from_millis(500)).await {
                return Ok(());
            }
            if started.elapsed() >= self.port_timeout {
                return Err(KernelError::PortNeverOpened {
                    kernel_id: kernel.id.clone(),
                });
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

#[async_trait]
impl ServerApi for LocalKernelServer {
    fn base_url(&self) -> &str {
        ""
    }

    async fn ready(&self) -> Result<(), KernelError> {
        Ok(())
    }

    async fn kernel_specs(&self) -> Result<Vec<KernelSpec>, KernelError> {
        self.specs.kernel_specs().await
    }

    async fn running_kernels(&self) -> Result<Vec<KernelModel>, KernelError> {
        let kernels = self.kernels.lock().unwrap_or_else(PoisonError::into_inner);
        let mut models: Vec<KernelModel> = kernels.values().map(|k| k.model()).collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }

    async fn running_sessions(&self) -> Result<Vec<SessionModel>, KernelError> {
        Ok(Vec::new())
    }

    async fn kernel(&self, kernel_id: &str) -> Result<KernelModel, KernelError> {
        Ok(self.find(kernel_id)?.model())
    }

    async fn start_kernel(
        &self,
        metadata: &KernelConnectionMetadata,
        working_dir: Option<&Path>,
    ) -> Result<KernelModel, KernelError> {
        if metadata.is_remote() {
            return Err(KernelError::Protocol(format!(
                "{} is a remote kernel",
                metadata.display_name()
            )));
        }
        let spec = metadata
            .kernel_spec()
            .cloned()
            .ok_or_else(|| KernelError::Protocol("no kernel spec to launch".to_string()))?;

        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;
        let connection_file = runtime_dir.join(format!("kernel-bridge-{}.json", kernel_id));

        let argv = kernel_argv(
            &spec,
            &connection_file,
            metadata.interpreter().map(|i| i.path.as_path()),
        );
        let Some((program, args)) = argv.split_first() else {
            return Err(KernelError::Protocol(format!(
                "kernel spec {} has an empty argv",
                spec.name
            )));
        };
        if launches_ipykernel(&argv) {
            ensure_ipykernel(program).await?;
        }

        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5)
            .await
            .map_err(connection_error)?;
        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(spec.name.clone()),
        };
        tokio::fs::write(
            &connection_file,
            serde_json::to_string_pretty(&connection_info)?,
        )
        .await?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.envs(&spec.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            "[local-kernel] Starting {} kernel {} with {}",
            spec.name, kernel_id, program
        );
        let mut child = match cmd.kill_on_drop(true).spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_file(&connection_file).await;
                return Err(KernelError::Io(format!("{}: {}", program, e)));
            }
        };

        #[cfg(unix)]
        let process_group_id = child.id().map(|pid| pid as i32);

        let (exit_tx, exit_rx) = watch::channel(None);
        let watcher_id = kernel_id.clone();
        let watcher = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("[local-kernel] Lost track of kernel {}: {}", watcher_id, e);
                    None
                }
            };
            info!("[local-kernel] Kernel {} exited with {:?}", watcher_id, code);
            let _ = exit_tx.send(Some(code));
        });

        let kernel = Arc::new(LocalKernel {
            id: kernel_id.clone(),
            spec,
            connection_info,
            connection_file,
            started: Utc::now(),
            #[cfg(unix)]
            process_group_id,
            exit_rx,
            watcher: Mutex::new(Some(watcher)),
            connections: AtomicU64::new(0),
            killed: AtomicBool::new(false),
        });

        if let Err(e) = self.wait_for_ports(&kernel).await {
            kernel.kill();
            return Err(e);
        }

        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kernel_id, kernel.clone());
        Ok(kernel.model())
    }

    async fn connect_kernel(
        &self,
        kernel: &KernelModel,
    ) -> Result<Arc<dyn KernelChannel>, KernelError> {
        let kernel = self.find(&kernel.id)?;
        let channel = LocalChannel::open(kernel.clone()).await?;
        kernel.connections.fetch_add(1, Ordering::SeqCst);
        Ok(channel)
    }

    async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), KernelError> {
        let kernel = self.find(kernel_id)?;

        #[cfg(unix)]
        if !kernel.spec.interrupts_by_message() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Some(pgid) = kernel.process_group_id {
                killpg(Pid::from_raw(pgid), Signal::SIGINT)
                    .map_err(|e| KernelError::Io(format!("SIGINT to kernel {}: {}", kernel_id, e)))?;
                info!("[local-kernel] Sent SIGINT to kernel {}", kernel_id);
                return Ok(());
            }
        }

        let request: JupyterMessage = InterruptRequest {}.into();
        kernel
            .control_request(&Uuid::new_v4().to_string(), request)
            .await?;
        info!("[local-kernel] Sent interrupt_request to kernel {}", kernel_id);
        Ok(())
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), KernelError> {
        let Some(kernel) = self
            .kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(kernel_id)
        else {
            return Ok(());
        };

        if kernel.exit_status().is_none() {
            let request: JupyterMessage = ShutdownRequest { restart: false }.into();
            let graceful = tokio::time::timeout(
                Duration::from_secs(2),
                kernel.control_request(&Uuid::new_v4().to_string(), request),
            )
            .await;
            if !matches!(graceful, Ok(Ok(_))) {
                debug!(
                    "[local-kernel] Kernel {} did not acknowledge shutdown",
                    kernel_id
                );
            }
        }
        kernel.kill();
        info!("[local-kernel] Kernel {} shut down", kernel_id);
        Ok(())
    }

    async fn dispose(&self) {
        let ids: Vec<String> = self
            .kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for id in ids {
            let _ = self.shutdown_kernel(&id).await;
        }
    }
}

/// Shell + IOPub connections to one local kernel.
pub struct LocalChannel {
    kernel: Arc<LocalKernel>,
    session_id: String,
    router: Arc<MessageRouter>,
    shell_writer: tokio::sync::Mutex<runtimelib::DealerSendConnection>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalChannel {
    async fn open(kernel: Arc<LocalKernel>) -> Result<Arc<Self>, KernelError> {
        let session_id = Uuid::new_v4().to_string();
        let router = MessageRouter::new();
        let info = &kernel.connection_info;

        let mut iopub = runtimelib::create_client_iopub_connection(info, "", &session_id)
            .await
            .map_err(connection_error)?;
        let identity =
            runtimelib::peer_identity_for_session(&session_id).map_err(connection_error)?;
        let shell =
            runtimelib::create_client_shell_connection_with_identity(info, &session_id, identity)
                .await
                .map_err(connection_error)?;
        let (shell_writer, mut shell_reader) = shell.split();

        let iopub_router = router.clone();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => iopub_router.route_broadcast(message),
                    Err(e) => {
                        error!("[local-kernel] iopub read error: {}", e);
                        break;
                    }
                }
            }
        });

        let shell_router = router.clone();
        let shell_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(message) => shell_router.route_reply(message),
                    Err(e) => {
                        error!("[local-kernel] shell read error: {}", e);
                        break;
                    }
                }
            }
        });

        let exit_router = router.clone();
        let mut exit_rx = kernel.exit_rx.clone();
        let exit_task = tokio::spawn(async move {
            if let Ok(state) = exit_rx.wait_for(|state| state.is_some()).await {
                let exit_code = (*state).flatten();
                exit_router.close(
                    KernelError::KernelProcessExited { exit_code },
                    KernelStatus::Dead,
                );
            }
        });

        Ok(Arc::new(Self {
            kernel,
            session_id,
            router,
            shell_writer: tokio::sync::Mutex::new(shell_writer),
            tasks: Mutex::new(vec![iopub_task, shell_task, exit_task]),
        }))
    }

    fn abort_tasks(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

#[async_trait]
impl KernelChannel for LocalChannel {
    fn kernel_id(&self) -> &str {
        &self.kernel.id
    }

    async fn request(
        &self,
        channel: Channel,
        message: JupyterMessage,
    ) -> Result<JupyterMessage, KernelError> {
        match channel {
            Channel::Shell => {
                let pending = self.router.register(&message.header.msg_id)?;
                self.send(Channel::Shell, message).await?;
                pending.wait().await
            }
            Channel::Control => {
                if let Some(reason) = self.router.closed_reason() {
                    return Err(reason);
                }
                self.kernel.control_request(&self.session_id, message).await
            }
            _ => Err(KernelError::Protocol(
                "requests are only supported on shell and control".to_string(),
            )),
        }
    }

    async fn send(&self, channel: Channel, message: JupyterMessage) -> Result<(), KernelError> {
        if let Some(reason) = self.router.closed_reason() {
            return Err(reason);
        }
        match channel {
            Channel::Shell => self
                .shell_writer
                .lock()
                .await
                .send(message)
                .await
                .map_err(connection_error),
            Channel::Control => {
                let mut control = runtimelib::create_client_control_connection(
                    &self.kernel.connection_info,
                    &self.session_id,
                )
                .await
                .map_err(connection_error)?;
                control.send(message).await.map_err(connection_error)
            }
            _ => Err(KernelError::Protocol(
                "only shell and control messages can be sent".to_string(),
            )),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<JupyterMessage> {
        self.router.subscribe()
    }

    fn status(&self) -> watch::Receiver<KernelStatus> {
        self.router.status()
    }

    async fn close(&self) {
        self.router
            .close(KernelError::SessionDisposed, KernelStatus::Disposed);
        self.abort_tasks();
        let _ = self
            .kernel
            .connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(argv: &[&str]) -> KernelSpec {
        KernelSpec {
            name: "python3".into(),
            display_name: "Python 3".into(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            language: "python".into(),
            env: HashMap::new(),
            interrupt_mode: None,
            metadata: None,
        }
    }

    #[test]
    fn test_kernel_argv_substitutes_connection_file() {
        let argv = kernel_argv(
            &spec(&["python", "-m", "ipykernel_launcher", "-f", "{connection_file}"]),
            Path::new("/run/kernel-bridge-a.json"),
            None,
        );
        assert_eq!(argv[0], "python");
        assert_eq!(argv[4], "/run/kernel-bridge-a.json");
    }

    #[test]
    fn test_kernel_argv_uses_interpreter_for_bare_python() {
        let argv = kernel_argv(
            &spec(&["python3", "-m", "ipykernel_launcher", "-f", "{connection_file}"]),
            Path::new("/tmp/c.json"),
            Some(Path::new("/opt/venv/bin/python")),
        );
        assert_eq!(argv[0], "/opt/venv/bin/python");

        let absolute = kernel_argv(
            &spec(&["/usr/bin/python3", "-f", "{connection_file}"]),
            Path::new("/tmp/c.json"),
            Some(Path::new("/opt/venv/bin/python")),
        );
        assert_eq!(absolute[0], "/usr/bin/python3");
    }

    #[test]
    fn test_launches_ipykernel() {
        assert!(launches_ipykernel(&[
            "python".into(),
            "-m".into(),
            "ipykernel_launcher".into()
        ]));
        assert!(!launches_ipykernel(&["deno".into(), "jupyter".into()]));
    }

    #[tokio::test]
    async fn test_remote_metadata_is_rejected() {
        let server = LocalKernelServer::new(Arc::new(crate::host::JupyterDataDirSpecs));
        let meta = KernelConnectionMetadata::remote_spec(
            KernelSpec::default_python(),
            "http://remote:8888",
            None,
        );
        let err = server.start_kernel(&meta, None).await.unwrap_err();
        assert!(matches!(err, KernelError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_io_error() {
        let server = LocalKernelServer::new(Arc::new(crate::host::JupyterDataDirSpecs));
        let mut spec = KernelSpec::default_python();
        spec.argv[0] = "/nonexistent/bin/python-kernel-bridge-test".into();
        let meta = KernelConnectionMetadata::local_spec(spec, None);

        let err = server.start_kernel(&meta, None).await.unwrap_err();
        assert!(matches!(err, KernelError::Io(_)));
        assert!(server.running_kernels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_kernel_operations() {
        let server = LocalKernelServer::new(Arc::new(crate::host::JupyterDataDirSpecs));
        assert!(matches!(
            server.interrupt_kernel("nope").await,
            Err(KernelError::KernelNotFound(_))
        ));
        assert!(server.shutdown_kernel("nope").await.is_ok());
    }
}
