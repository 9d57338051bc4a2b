//! Jupyter server access over REST and the kernel WebSocket.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use jupyter_protocol::{Channel, JupyterMessage};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;

use crate::api::{KernelChannel, KernelModel, ServerApi, SessionModel};
use crate::connection::ConnectSettings;
use crate::error::KernelError;
use crate::events::KernelStatus;
use crate::metadata::{KernelConnectionMetadata, KernelSpec};
use crate::router::MessageRouter;

#[derive(Debug, Deserialize)]
struct KernelSpecsResponse {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    kernelspecs: HashMap<String, KernelSpecEntry>,
}

#[derive(Debug, Deserialize)]
struct KernelSpecEntry {
    name: String,
    spec: KernelSpecBody,
}

#[derive(Debug, Deserialize)]
struct KernelSpecBody {
    #[serde(default)]
    argv: Vec<String>,
    display_name: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    interrupt_mode: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// Specs sorted with the server's default first, then by name.
fn parse_kernel_specs(response: KernelSpecsResponse) -> Vec<KernelSpec> {
    let default = response.default.unwrap_or_default();
    let mut specs: Vec<KernelSpec> = response
        .kernelspecs
        .into_values()
        .map(|entry| KernelSpec {
            name: entry.name,
            display_name: entry.spec.display_name,
            argv: entry.spec.argv,
            language: entry.spec.language,
            env: entry.spec.env,
            interrupt_mode: entry.spec.interrupt_mode,
            metadata: entry.spec.metadata,
        })
        .collect();
    specs.sort_by(|a, b| {
        (a.name != default)
            .cmp(&(b.name != default))
            .then_with(|| a.name.cmp(&b.name))
    });
    specs
}

/// A Jupyter server reached over HTTP.
pub struct RemoteServerApi {
    settings: ConnectSettings,
    host: String,
    tls: Option<Arc<rustls::ClientConfig>>,
    channels: Mutex<Vec<Weak<WebSocketChannel>>>,
}

impl RemoteServerApi {
    pub fn new(settings: ConnectSettings) -> Result<Self, KernelError> {
        let host = url::Url::parse(&settings.base_url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_default();
        let tls = if settings.accept_invalid_certs {
            Some(crate::tls::insecure_client_config()?)
        } else {
            None
        };
        Ok(Self {
            settings,
            host,
            tls,
            channels: Mutex::new(Vec::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url, path)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, KernelError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        match status.as_u16() {
            404 => Err(KernelError::KernelNotFound(url)),
            401 | 403 => Err(KernelError::Connection(format!(
                "{} rejected the credentials (HTTP {})",
                url,
                status.as_u16()
            ))),
            code => Err(KernelError::Connection(format!(
                "{} returned HTTP {}",
                url, code
            ))),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, KernelError> {
        let response = self
            .settings
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| KernelError::from_http(&self.host, e))?;
        self.check(response)
            .await?
            .json()
            .await
            .map_err(|e| KernelError::Protocol(e.to_string()))
    }

    async fn post(&self, path: &str) -> Result<(), KernelError> {
        let response = self
            .settings
            .client
            .post(self.url(path))
            .send()
            .await
            .map_err(|e| KernelError::from_http(&self.host, e))?;
        self.check(response).await.map(|_| ())
    }

    fn channel_url(&self, kernel_id: &str, session_id: &str) -> String {
        format!(
            "{}/api/kernels/{}/channels?session_id={}",
            self.settings.ws_url, kernel_id, session_id
        )
    }
}

#[async_trait]
impl ServerApi for RemoteServerApi {
    fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    async fn ready(&self) -> Result<(), KernelError> {
        let _: serde_json::Value = self.get_json("api/status").await?;
        Ok(())
    }

    async fn kernel_specs(&self) -> Result<Vec<KernelSpec>, KernelError> {
        let response: KernelSpecsResponse = self.get_json("api/kernelspecs").await?;
        Ok(parse_kernel_specs(response))
    }

    async fn running_kernels(&self) -> Result<Vec<KernelModel>, KernelError> {
        self.get_json("api/kernels").await
    }

    async fn running_sessions(&self) -> Result<Vec<SessionModel>, KernelError> {
        self.get_json("api/sessions").await
    }

    async fn kernel(&self, kernel_id: &str) -> Result<KernelModel, KernelError> {
        self.get_json(&format!("api/kernels/{}", kernel_id)).await
    }

    async fn start_kernel(
        &self,
        metadata: &KernelConnectionMetadata,
        working_dir: Option<&Path>,
    ) -> Result<KernelModel, KernelError> {
        let mut body = serde_json::json!({ "name": metadata.spec_name() });
        if let Some(dir) = working_dir {
            body["path"] = serde_json::Value::String(dir.to_string_lossy().into_owned());
        }
        info!(
            "[remote] Starting {} kernel on {}",
            metadata.spec_name(),
            self.settings.base_url
        );
        let response = self
            .settings
            .client
            .post(self.url("api/kernels"))
            .json(&body)
            .send()
            .await
            .map_err(|e| KernelError::from_http(&self.host, e))?;
        self.check(response)
            .await?
            .json()
            .await
            .map_err(|e| KernelError::Protocol(e.to_string()))
    }

    async fn connect_kernel(
        &self,
        kernel: &KernelModel,
    ) -> Result<Arc<dyn KernelChannel>, KernelError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut request = self
            .channel_url(&kernel.id, &session_id)
            .into_client_request()
            .map_err(|e| KernelError::Connection(e.to_string()))?;
        for (name, value) in self.settings.request_headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| KernelError::Connection(e.to_string()))?;
            let value =
                HeaderValue::from_str(&value).map_err(|e| KernelError::Connection(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        let connector = self.tls.clone().map(Connector::Rustls);
        let (stream, _response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await
                .map_err(|e| KernelError::Connection(format!("kernel WebSocket: {}", e)))?;

        let channel = WebSocketChannel::spawn(kernel.id.clone(), stream);
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&channel));
        debug!("[remote] Connected to kernel {} channels", kernel.id);
        Ok(channel)
    }

    async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), KernelError> {
        self.post(&format!("api/kernels/{}/interrupt", kernel_id))
            .await
    }

    async fn restart_kernel(&self, kernel_id: &str) -> Result<(), KernelError> {
        self.post(&format!("api/kernels/{}/restart", kernel_id))
            .await
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), KernelError> {
        let response = self
            .settings
            .client
            .delete(self.url(&format!("api/kernels/{}", kernel_id)))
            .send()
            .await
            .map_err(|e| KernelError::from_http(&self.host, e))?;
        match self.check(response).await {
            Ok(_) | Err(KernelError::KernelNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn dispose(&self) {
        let channels: Vec<Arc<WebSocketChannel>> = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for channel in channels {
            channel.close().await;
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// All kernel channels multiplexed over one WebSocket.
pub struct WebSocketChannel {
    kernel_id: String,
    router: Arc<MessageRouter>,
    outbox: mpsc::Sender<Message>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketChannel {
    fn spawn(kernel_id: String, stream: WsStream) -> Arc<Self> {
        let (mut write, mut read) = stream.split();
        let (outbox, mut outbox_rx) = mpsc::channel::<Message>(100);
        let router = MessageRouter::new();

        let writer_id = kernel_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbox_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    error!("[remote] WebSocket write error for {}: {}", writer_id, e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_router = router.clone();
        let reader_id = kernel_id.clone();
        let reader = tokio::spawn(async move {
            while let Some(result) = read.next().await {
                let decoded = match result {
                    Ok(Message::Text(text)) => jupyter_wire::decode_text(text.as_str()),
                    Ok(Message::Binary(data)) => jupyter_wire::decode_binary(&data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("[remote] WebSocket read error for {}: {}", reader_id, e);
                        break;
                    }
                };
                match decoded {
                    Ok(message) => route(&reader_router, message),
                    Err(e) => warn!("[remote] Dropping undecodable frame: {}", e),
                }
            }
            reader_router.close(
                KernelError::KernelDied(format!("connection to kernel {} closed", reader_id)),
                KernelStatus::Dead,
            );
        });

        Arc::new(Self {
            kernel_id,
            router,
            outbox,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }
}

/// Replies on shell/control go to their waiters; everything else fans out.
pub(crate) fn route(router: &MessageRouter, message: JupyterMessage) {
    match message.channel {
        Some(Channel::Shell) | Some(Channel::Control) => router.route_reply(message),
        _ => router.route_broadcast(message),
    }
}

#[async_trait]
impl KernelChannel for WebSocketChannel {
    fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    async fn request(
        &self,
        channel: Channel,
        message: JupyterMessage,
    ) -> Result<JupyterMessage, KernelError> {
        let pending = self.router.register(&message.header.msg_id)?;
        self.send(channel, message).await?;
        pending.wait().await
    }

    async fn send(&self, channel: Channel, message: JupyterMessage) -> Result<(), KernelError> {
        if let Some(reason) = self.router.closed_reason() {
            return Err(reason);
        }
        let frame = if message.buffers.is_empty() {
            Message::Text(jupyter_wire::encode_text(&message, channel)?.into())
        } else {
            Message::Binary(jupyter_wire::encode_binary(&message, channel)?)
        };
        self.outbox
            .send(frame)
            .await
            .map_err(|_| KernelError::KernelDied(format!("kernel {} channel closed", self.kernel_id)))
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
        let _ = self.outbox.send(Message::Close(None)).await;
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        // Let the writer flush the close frame, the reader may block forever
        for task in tasks {
            if tokio::time::timeout(std::time::Duration::from_millis(500), task)
                .await
                .is_err()
            {
                debug!("[remote] Channel task for {} did not stop in time", self.kernel_id);
            }
        }
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
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
