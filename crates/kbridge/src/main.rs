use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use jupyter_protocol::{
    ExecuteRequest, ExecutionState, JupyterMessage, JupyterMessageContent, MediaType,
    ReplyStatus, Status, Stdio,
};
use kernel_bridge::{
    classify, load_settings, ConnectionNegotiator, JupyterDataDirSpecs, KernelConnectionMetadata,
    KernelError, KernelFinder, KernelOptions, KernelProvider, KernelSession, LocalKernelFinder,
    RecoveryAction, RemoteKernelFinder, SecurityPolicy, ServerConnection, SessionManager,
    SessionManagerFactory,
};
use log::{debug, warn};
use tabled::{settings::Style, Table, Tabled};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

mod terminal;

use crate::terminal::{TerminalPassword, TerminalPrompt};

/// How long to keep printing output after the execute reply arrives.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Jupyter server URL. Kernels run on this machine when omitted.
    #[arg(long, global = true)]
    server: Option<String>,

    /// Token for the Jupyter server
    #[arg(long, global = true)]
    token: Option<String>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List kernels that can be started or attached to
    Specs {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// List kernels running on the server
    Ps {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Start a kernel, run code in it, and shut it down
    Run {
        /// Kernel spec name or running kernel id (default: first Python kernel)
        #[arg(long, short)]
        kernel: Option<String>,
        /// Code to run (reads stdin when omitted)
        code: Option<String>,
    },
    /// Interrupt a kernel running on the server
    Interrupt {
        /// Kernel id
        kernel_id: String,
    },
}

#[derive(Tabled)]
struct SpecRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "LANGUAGE")]
    language: String,
    #[tabled(rename = "INTERPRETER")]
    interpreter: String,
}

impl From<&KernelConnectionMetadata> for SpecRow {
    fn from(metadata: &KernelConnectionMetadata) -> Self {
        let kind = match metadata {
            KernelConnectionMetadata::StartUsingLocalKernelSpec { .. } => "local spec",
            KernelConnectionMetadata::StartUsingPythonInterpreter { .. } => "interpreter",
            KernelConnectionMetadata::StartUsingRemoteKernelSpec { .. } => "remote spec",
            KernelConnectionMetadata::ConnectToLiveRemoteKernel { .. } => "running",
        };
        SpecRow {
            name: metadata.display_name(),
            kind: kind.to_string(),
            language: metadata
                .kernel_spec()
                .map(|s| s.language.clone())
                .unwrap_or_else(|| "-".to_string()),
            interpreter: metadata
                .interpreter()
                .map(|i| i.path.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Tabled)]
struct RunningRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "CONNECTIONS")]
    connections: u64,
    #[tabled(rename = "NOTEBOOK")]
    notebook: String,
    #[tabled(rename = "LAST ACTIVITY")]
    last_activity: String,
}

/// Shorten a path for display by replacing home directory with ~
fn shorten_path(path: &std::path::Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(relative) = path.strip_prefix(&home) {
            return format!("~/{}", relative.display());
        }
    }
    path.display().to_string()
}

struct Bridge {
    factory: SessionManagerFactory,
    manager: Arc<SessionManager>,
    remote: bool,
}

impl Bridge {
    async fn open(cli: &Cli) -> Result<Self> {
        let settings = load_settings();
        let policy = Arc::new(SecurityPolicy::new(settings.allow_insecure_connections));
        let negotiator = Arc::new(ConnectionNegotiator::new(
            policy,
            Arc::new(TerminalPrompt),
            Some(Arc::new(TerminalPassword)),
            settings.clone(),
        ));
        let factory = SessionManagerFactory::new(negotiator, settings);

        let (manager, remote) = match &cli.server {
            Some(url) => {
                let connection = ServerConnection::new(url, cli.token.as_deref());
                (factory.create_remote(connection).await?, true)
            }
            None => (factory.create_local(Arc::new(JupyterDataDirSpecs)), false),
        };
        Ok(Self {
            factory,
            manager: Arc::new(manager),
            remote,
        })
    }

    fn finder(&self) -> Box<dyn KernelFinder> {
        if self.remote {
            Box::new(RemoteKernelFinder::new(
                self.manager.clone(),
                None,
                self.factory.restart_events(),
            ))
        } else {
            Box::new(LocalKernelFinder::new(Arc::new(JupyterDataDirSpecs), None))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let bridge = Bridge::open(&cli).await?;
    let result = match cli.command {
        Commands::Specs { json } => list_specs(&bridge, json).await,
        Commands::Ps { json } => list_running(&bridge, json).await,
        Commands::Run { kernel, code } => run_code(&bridge, kernel, code).await,
        Commands::Interrupt { kernel_id } => interrupt_kernel(&bridge, &kernel_id).await,
    };
    bridge.manager.dispose().await;

    match result {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => Err(e),
    }
}

async fn list_specs(bridge: &Bridge, json: bool) -> Result<bool> {
    let kernels = bridge.finder().list_kernels(None).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&kernels)?);
    } else if kernels.is_empty() {
        println!("No kernels found");
    } else {
        let rows: Vec<SpecRow> = kernels.iter().map(SpecRow::from).collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
    }
    Ok(true)
}

async fn list_running(bridge: &Bridge, json: bool) -> Result<bool> {
    if !bridge.remote {
        bail!("`ps` lists kernels on a Jupyter server; pass --server");
    }
    let kernels = bridge.manager.fetch_running_kernels().await?;
    let sessions = bridge.manager.get_running_sessions().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&kernels)?);
        return Ok(true);
    }
    if kernels.is_empty() {
        println!("No running kernels");
        return Ok(true);
    }

    let rows: Vec<RunningRow> = kernels
        .into_iter()
        .map(|kernel| {
            let notebook = sessions
                .iter()
                .find(|s| s.kernel.id == kernel.id)
                .map(|s| shorten_path(&PathBuf::from(&s.path)))
                .unwrap_or_else(|| "-".to_string());
            let state = kernel.status().to_string();
            RunningRow {
                id: kernel.id,
                name: kernel.name,
                state,
                connections: kernel.connections,
                notebook,
                last_activity: kernel
                    .last_activity
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            }
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(true)
}

fn choose_kernel(
    kernels: Vec<KernelConnectionMetadata>,
    wanted: Option<&str>,
) -> Option<KernelConnectionMetadata> {
    match wanted {
        Some(wanted) => kernels.into_iter().find(|k| {
            k.live_kernel_id() == Some(wanted)
                || (k.live_kernel_id().is_none() && k.spec_name() == wanted)
        }),
        None => {
            let python = kernels.iter().position(|k| {
                k.live_kernel_id().is_none()
                    && k.kernel_spec().is_some_and(|s| s.language == "python")
            });
            match python {
                Some(index) => kernels.into_iter().nth(index),
                None => kernels.into_iter().find(|k| k.live_kernel_id().is_none()),
            }
        }
    }
}

fn recovery_hint(error: &KernelError) -> Option<&'static str> {
    match classify(error) {
        RecoveryAction::PromptInstall => Some("install ipykernel into the kernel's environment"),
        RecoveryAction::PromptTrust => Some("set allow_unauthorized_remote_connection in settings"),
        RecoveryAction::OfferRestart => Some("the kernel is unresponsive; restart it"),
        RecoveryAction::Retry => Some("try again"),
        RecoveryAction::ShowMessage | RecoveryAction::Ignore => None,
    }
}

async fn run_code(bridge: &Bridge, kernel: Option<String>, code: Option<String>) -> Result<bool> {
    let code = match code {
        Some(code) => code,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let kernels = bridge.finder().list_kernels(None).await;
    let Some(metadata) = choose_kernel(kernels, kernel.as_deref()) else {
        bail!(
            "No kernel matching {}",
            kernel.as_deref().unwrap_or("a Python kernel")
        );
    };
    debug!("Using {}", metadata.display_name());

    let provider = KernelProvider::new();
    let kernel = provider
        .get_or_create(
            "kbridge",
            KernelOptions {
                metadata,
                resource: None,
                working_dir: std::env::current_dir().ok(),
                starter: bridge.manager.clone(),
                dependency_manager: None,
            },
        )
        .await;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let outcome = match kernel.start(&cancel).await {
        Ok(session) => execute(&session, &code).await,
        Err(KernelError::Cancelled) => Ok(false),
        Err(e) => {
            if let Some(hint) = recovery_hint(&e) {
                eprintln!("hint: {}", hint);
            }
            Err(e.into())
        }
    };
    provider.dispose_all().await;
    outcome
}

/// Run `code` and print its output. Returns whether it succeeded.
async fn execute(session: &KernelSession, code: &str) -> Result<bool> {
    let mut iopub = session.subscribe_iopub();
    let request: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
    let message_id = request.header.msg_id.clone();

    let reply = session.request(request).await?;
    let ok = match &reply.content {
        JupyterMessageContent::ExecuteReply(reply) => reply.status == ReplyStatus::Ok,
        _ => false,
    };

    // Some kernels send ExecuteReply before streaming output, so keep
    // reading until the kernel reports idle for this request.
    let drain = async {
        loop {
            let msg = match iopub.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} output messages", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let is_ours = msg
                .parent_header
                .as_ref()
                .map(|h| h.msg_id.as_str())
                == Some(message_id.as_str());
            if !is_ours {
                continue;
            }
            match &msg.content {
                JupyterMessageContent::StreamContent(stream) => match stream.name {
                    Stdio::Stdout => {
                        print!("{}", stream.text);
                        let _ = io::stdout().flush();
                    }
                    Stdio::Stderr => {
                        eprint!("{}", stream.text);
                        let _ = io::stderr().flush();
                    }
                },
                JupyterMessageContent::ExecuteResult(result) => {
                    for media in &result.data.content {
                        if let MediaType::Plain(text) = media {
                            println!("{}", text);
                            break;
                        }
                    }
                }
                JupyterMessageContent::DisplayData(data) => {
                    for media in &data.data.content {
                        if let MediaType::Plain(text) = media {
                            println!("{}", text);
                            break;
                        }
                    }
                }
                JupyterMessageContent::ErrorOutput(error) => {
                    eprintln!("{}: {}", error.ename, error.evalue);
                    for line in &error.traceback {
                        eprintln!("{}", line);
                    }
                }
                JupyterMessageContent::Status(Status { execution_state }) => {
                    if *execution_state == ExecutionState::Idle {
                        break;
                    }
                }
                _ => {}
            }
        }
    };
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("Kernel did not report idle; output may be incomplete");
    }

    Ok(ok)
}

async fn interrupt_kernel(bridge: &Bridge, kernel_id: &str) -> Result<bool> {
    if !bridge.remote {
        bail!("`interrupt` targets a kernel on a Jupyter server; pass --server");
    }
    bridge.manager.api().interrupt_kernel(kernel_id).await?;
    println!("Interrupted {}", kernel_id);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_bridge::{KernelSpec, LiveKernelModel};

    fn spec(name: &str, language: &str) -> KernelSpec {
        KernelSpec {
            name: name.to_string(),
            display_name: name.to_string(),
            language: language.to_string(),
            ..KernelSpec::default_python()
        }
    }

    fn live(id: &str) -> KernelConnectionMetadata {
        KernelConnectionMetadata::live_remote(
            LiveKernelModel {
                id: id.to_string(),
                name: "python3".to_string(),
                last_activity_time: None,
                number_of_connections: 0,
                execution_state: None,
                session_id: None,
                path: None,
            },
            "http://host:8888",
            None,
        )
    }

    #[test]
    fn test_choose_kernel_prefers_python_spec() {
        let kernels = vec![
            live("abc"),
            KernelConnectionMetadata::local_spec(spec("deno", "typescript"), None),
            KernelConnectionMetadata::local_spec(spec("python3", "python"), None),
        ];
        let chosen = choose_kernel(kernels, None).unwrap();
        assert_eq!(chosen.spec_name(), "python3");
        assert!(chosen.live_kernel_id().is_none());
    }

    #[test]
    fn test_choose_kernel_by_name_or_id() {
        let kernels = vec![
            live("abc"),
            KernelConnectionMetadata::local_spec(spec("deno", "typescript"), None),
        ];
        assert_eq!(
            choose_kernel(kernels.clone(), Some("abc"))
                .unwrap()
                .live_kernel_id(),
            Some("abc")
        );
        assert_eq!(
            choose_kernel(kernels.clone(), Some("deno")).unwrap().spec_name(),
            "deno"
        );
        assert!(choose_kernel(kernels, Some("julia")).is_none());
    }
}
