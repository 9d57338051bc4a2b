//! Turning a [`ServerConnection`] into ready-to-use transport settings.
//!
//! Negotiation order:
//! 1. Insecure check: a tokenless plain-HTTP server that is not on this
//!    machine needs the user's trust decision (cached per host).
//! 2. Password login when the server has no token and prompts are allowed.
//! 3. Certificate policy for HTTPS servers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{info, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::OnceCell;

use crate::error::KernelError;
use crate::host::{AuthHeaderProvider, PasswordProvider, Prompt};
use crate::password;
use crate::settings::BridgeSettings;

pub const INSECURE_YES: &str = "Yes";
pub const INSECURE_NO: &str = "No";
pub const INSECURE_DONT_ASK_AGAIN: &str = "Don't Ask Again";

/// A Jupyter server the user chose to connect to.
#[derive(Clone)]
pub struct ServerConnection {
    pub base_url: String,
    pub token: Option<String>,
    pub host_name: String,
    /// The server was launched on this machine.
    pub local_launch: bool,
    pub display_name: String,
    pub auth_header: Option<Arc<dyn AuthHeaderProvider>>,
    on_dispose: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("base_url", &self.base_url)
            .field("host_name", &self.host_name)
            .field("local_launch", &self.local_launch)
            .field("has_token", &self.token().is_some())
            .field("has_auth_header", &self.auth_header.is_some())
            .finish()
    }
}

impl ServerConnection {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        let host_name = url::Url::parse(&base_url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_default();
        Self {
            display_name: base_url.clone(),
            base_url,
            token: token.map(String::from),
            host_name,
            local_launch: false,
            auth_header: None,
            on_dispose: None,
        }
    }

    pub fn with_auth_header(mut self, provider: Arc<dyn AuthHeaderProvider>) -> Self {
        self.auth_header = Some(provider);
        self
    }

    pub fn with_local_launch(mut self, local_launch: bool) -> Self {
        self.local_launch = local_launch;
        self
    }

    /// Run `hook` when the session manager owning this connection is disposed.
    pub fn with_dispose_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_dispose = Some(Arc::new(hook));
        self
    }

    /// The token, treating `""` and `"null"` as absent.
    pub fn token(&self) -> Option<&str> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty() && *t != "null")
    }

    pub fn is_https(&self) -> bool {
        self.base_url.to_ascii_lowercase().starts_with("https:")
    }

    /// The server runs on this machine, either launched here or on loopback.
    pub fn is_local(&self) -> bool {
        self.local_launch
            || matches!(
                self.host_name.as_str(),
                "localhost" | "127.0.0.1" | "::1" | "[::1]"
            )
    }

    pub(crate) fn run_dispose_hook(&self) {
        if let Some(hook) = &self.on_dispose {
            hook();
        }
    }
}

/// The negotiated transport for one server.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    /// Base URL without a trailing slash.
    pub base_url: String,
    /// `ws://` or `wss://` form of the base URL.
    pub ws_url: String,
    pub token: Option<String>,
    /// Extra headers for every REST and WebSocket request.
    pub headers: HashMap<String, String>,
    pub accept_invalid_certs: bool,
    /// REST client with the headers and certificate policy applied.
    pub client: reqwest::Client,
}

impl ConnectSettings {
    /// Every header a request needs, including the token.
    pub fn request_headers(&self) -> HashMap<String, String> {
        let mut headers = self.headers.clone();
        if let Some(token) = &self.token {
            headers
                .entry("Authorization".to_string())
                .or_insert_with(|| format!("token {}", token));
        }
        headers
    }

    fn build(
        base_url: &str,
        token: Option<String>,
        headers: HashMap<String, String>,
        accept_invalid_certs: bool,
    ) -> Result<Self, KernelError> {
        let ws_url = if let Some(rest) = base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            return Err(KernelError::Connection(format!(
                "unsupported server URL {}",
                base_url
            )));
        };

        let mut settings = ConnectSettings {
            base_url: base_url.to_string(),
            ws_url,
            token,
            headers,
            accept_invalid_certs,
            client: reqwest::Client::new(),
        };

        let mut default_headers = HeaderMap::new();
        for (name, value) in settings.request_headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| KernelError::Connection(format!("bad header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| KernelError::Connection(format!("bad header {}: {}", name, e)))?;
            default_headers.insert(name, value);
        }
        settings.client = reqwest::Client::builder()
            .default_headers(default_headers)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| KernelError::Connection(e.to_string()))?;
        Ok(settings)
    }
}

/// Process-scoped trust decisions for insecure servers.
///
/// Decisions are cached per host; concurrent connects to one host share a
/// single prompt.
#[derive(Debug, Default)]
pub struct SecurityPolicy {
    allow_insecure: AtomicBool,
    decisions: Mutex<HashMap<String, Arc<OnceCell<bool>>>>,
}

impl SecurityPolicy {
    pub fn new(allow_insecure_connections: bool) -> Self {
        Self {
            allow_insecure: AtomicBool::new(allow_insecure_connections),
            decisions: Mutex::new(HashMap::new()),
        }
    }

    /// Forget every per-host decision.
    pub fn clear(&self) {
        self.decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn allows_insecure_connections(&self) -> bool {
        self.allow_insecure.load(Ordering::SeqCst)
    }

    pub fn set_allow_insecure_connections(&self, allow: bool) {
        self.allow_insecure.store(allow, Ordering::SeqCst);
    }

    /// The cached decision for `host`, if one was made.
    pub fn decision(&self, host: &str) -> Option<bool> {
        self.decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .and_then(|cell| cell.get().copied())
    }

    async fn decide<F, Fut>(&self, host: &str, ask: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let cell = self
            .decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host.to_string())
            .or_default()
            .clone();
        *cell.get_or_init(ask).await
    }
}

/// Produces [`ConnectSettings`] for server connections.
pub struct ConnectionNegotiator {
    policy: Arc<SecurityPolicy>,
    prompt: Arc<dyn Prompt>,
    password: Option<Arc<dyn PasswordProvider>>,
    settings: BridgeSettings,
}

impl ConnectionNegotiator {
    pub fn new(
        policy: Arc<SecurityPolicy>,
        prompt: Arc<dyn Prompt>,
        password: Option<Arc<dyn PasswordProvider>>,
        settings: BridgeSettings,
    ) -> Self {
        if settings.allow_insecure_connections {
            policy.set_allow_insecure_connections(true);
        }
        Self {
            policy,
            prompt,
            password,
            settings,
        }
    }

    pub fn policy(&self) -> &Arc<SecurityPolicy> {
        &self.policy
    }

    pub async fn get_server_connect_settings(
        &self,
        connection: &ServerConnection,
    ) -> Result<ConnectSettings, KernelError> {
        let token = connection.token().map(String::from);
        let auth_headers = connection
            .auth_header
            .as_ref()
            .map(|provider| provider.auth_headers())
            .unwrap_or_default();

        if self.needs_trust_decision(connection, token.is_some(), !auth_headers.is_empty()) {
            self.require_trust(&connection.host_name).await?;
        }

        let accept_invalid_certs =
            connection.is_https() && self.settings.allow_unauthorized_remote_connection;
        if accept_invalid_certs {
            warn!(
                "[connection] Certificate validation disabled for {}",
                connection.host_name
            );
        }

        let mut headers = auth_headers;
        if token.is_none()
            && connection.auth_header.is_none()
            && !self.settings.disable_password_prompts
        {
            if let Some(provider) = &self.password {
                if let Some(password) = provider.password(&connection.base_url).await? {
                    let login =
                        password::login(&connection.base_url, &password, accept_invalid_certs)
                            .await?;
                    headers.extend(login);
                }
            }
        }

        ConnectSettings::build(&connection.base_url, token, headers, accept_invalid_certs)
    }

    fn needs_trust_decision(
        &self,
        connection: &ServerConnection,
        has_token: bool,
        has_auth_headers: bool,
    ) -> bool {
        !connection.is_local()
            && !connection.is_https()
            && !has_token
            && !has_auth_headers
            && !self.policy.allows_insecure_connections()
    }

    async fn require_trust(&self, host: &str) -> Result<(), KernelError> {
        let policy = self.policy.clone();
        let prompt = self.prompt.clone();
        let allowed = self
            .policy
            .decide(host, || async move {
                let message = format!(
                    "Connecting over HTTP without a token may be an insecure connection. \
                     Do you want to connect to {}?",
                    host
                );
                let answer = prompt
                    .show_warning_message(
                        &message,
                        &[INSECURE_YES, INSECURE_NO, INSECURE_DONT_ASK_AGAIN],
                    )
                    .await;
                match answer.as_deref() {
                    Some(INSECURE_YES) => true,
                    Some(INSECURE_DONT_ASK_AGAIN) => {
                        policy.set_allow_insecure_connections(true);
                        true
                    }
                    _ => false,
                }
            })
            .await;

        if allowed {
            info!("[connection] Insecure connection to {} allowed", host);
            Ok(())
        } else {
            Err(KernelError::InsecureSessionDenied {
                host: host.to_string(),
            })
        }
    }
}
