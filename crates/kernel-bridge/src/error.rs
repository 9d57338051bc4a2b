//! Error taxonomy and recovery classification.
//!
//! Every failure surfaced by the session layer is a [`KernelError`]. Callers
//! decide what to do with it through [`classify`], which maps each variant to
//! exactly one [`RecoveryAction`]. [`ErrorReporter`] makes sure a given
//! failure is shown to the user at most once.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{info, warn};

use crate::host::Prompt;

/// The operation a [`KernelError::Timeout`] interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOperation {
    /// Waiting for a newly started kernel to answer `kernel_info`.
    Launch,
    /// Waiting for an interrupted kernel to go idle.
    Interrupt,
    /// Refreshing the kernel spec list from a server.
    SpecRefresh,
    /// Any other request/reply round trip.
    Request,
}

impl std::fmt::Display for TimeoutOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutOperation::Launch => write!(f, "kernel launch"),
            TimeoutOperation::Interrupt => write!(f, "kernel interrupt"),
            TimeoutOperation::SpecRefresh => write!(f, "kernel spec refresh"),
            TimeoutOperation::Request => write!(f, "kernel reply"),
        }
    }
}

/// Errors produced by the kernel session layer.
///
/// Payloads are plain strings so the error can be cloned into every waiter
/// of a shared in-flight operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KernelError {
    #[error("Failed to connect to Jupyter server: {0}")]
    Connection(String),

    #[error("Failed to log in to Jupyter server: {0}")]
    Password(String),

    #[error("Connection to insecure server {host} was denied")]
    InsecureSessionDenied { host: String },

    #[error("Certificate for {host} is not trusted: {message}")]
    UntrustedCertificate { host: String, message: String },

    #[error("Session has been disposed")]
    SessionDisposed,

    #[error("Timed out after {}ms waiting for {operation}", .after.as_millis())]
    Timeout {
        operation: TimeoutOperation,
        after: Duration,
    },

    #[error("Module {module} is not installed for {}", .interpreter.display())]
    DependencyMissing { module: String, interpreter: PathBuf },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Kernel process exited{}", .exit_code.map(|c| format!(" with code {}", c)).unwrap_or_default())]
    KernelProcessExited { exit_code: Option<i32> },

    #[error("Kernel died: {0}")]
    KernelDied(String),

    #[error("Kernel ports never opened for kernel {kernel_id}")]
    PortNeverOpened { kernel_id: String },

    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl KernelError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, KernelError::Cancelled)
    }

    /// Map a transport error from `reqwest` onto the taxonomy.
    pub fn from_http(host: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return KernelError::Timeout {
                operation: TimeoutOperation::Request,
                after: Duration::ZERO,
            };
        }
        let chain = error_chain(&err);
        if chain.contains("certificate") || chain.contains("UnknownIssuer") {
            return KernelError::UntrustedCertificate {
                host: host.to_string(),
                message: chain,
            };
        }
        KernelError::Connection(chain)
    }
}

impl From<std::io::Error> for KernelError {
    fn from(err: std::io::Error) -> Self {
        KernelError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        KernelError::Protocol(err.to_string())
    }
}

impl From<jupyter_wire::WireError> for KernelError {
    fn from(err: jupyter_wire::WireError) -> Self {
        KernelError::Protocol(err.to_string())
    }
}

/// Flatten an error and its sources into one line.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// What the host should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Offer to install the missing dependency, then retry the launch.
    PromptInstall,
    /// Ask the user whether to trust the server's certificate.
    PromptTrust,
    /// The kernel is unresponsive; offer a restart.
    OfferRestart,
    /// The kernel is gone; a fresh kernel must be created.
    RecreateKernel,
    /// Transient failure; retrying the same operation may succeed.
    Retry,
    /// Show the error text to the user.
    ShowMessage,
    /// Nothing to show (cancellation, user declined).
    Ignore,
}

/// Classify a failure into the single recovery action it calls for.
pub fn classify(error: &KernelError) -> RecoveryAction {
    match error {
        KernelError::DependencyMissing { .. } => RecoveryAction::PromptInstall,
        KernelError::UntrustedCertificate { .. } => RecoveryAction::PromptTrust,
        KernelError::Timeout { .. } => RecoveryAction::OfferRestart,
        KernelError::KernelProcessExited { .. } | KernelError::KernelDied(_) => {
            RecoveryAction::RecreateKernel
        }
        KernelError::PortNeverOpened { .. } => RecoveryAction::Retry,
        KernelError::Cancelled | KernelError::InsecureSessionDenied { .. } => {
            RecoveryAction::Ignore
        }
        KernelError::Connection(_)
        | KernelError::Password(_)
        | KernelError::SessionDisposed
        | KernelError::KernelNotFound(_)
        | KernelError::Protocol(_)
        | KernelError::Io(_) => RecoveryAction::ShowMessage,
    }
}

/// Shows each distinct failure to the user once.
pub struct ErrorReporter {
    prompt: Arc<dyn Prompt>,
    seen: Mutex<HashSet<String>>,
}

impl ErrorReporter {
    pub fn new(prompt: Arc<dyn Prompt>) -> Self {
        Self {
            prompt,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Report a failure. Returns `true` if a message was shown.
    ///
    /// Cancellations and declined prompts are never shown, and an error whose
    /// text was already reported is skipped.
    pub async fn report(&self, error: &KernelError) -> bool {
        if classify(error) == RecoveryAction::Ignore {
            info!("[errors] Not reporting: {}", error);
            return false;
        }

        let text = error.to_string();
        let first_time = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(text.clone());
        if !first_time {
            return false;
        }

        warn!("[errors] {}", text);
        self.prompt.show_warning_message(&text, &[]).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::ScriptedPrompt;

    #[test]
    fn test_classify_is_distinct_per_failure_kind() {
        let timeout = KernelError::Timeout {
            operation: TimeoutOperation::Launch,
            after: Duration::from_secs(1),
        };
        assert_eq!(classify(&timeout), RecoveryAction::OfferRestart);
        assert_eq!(
            classify(&KernelError::KernelProcessExited { exit_code: Some(1) }),
            RecoveryAction::RecreateKernel
        );
        assert_eq!(
            classify(&KernelError::PortNeverOpened {
                kernel_id: "k".into()
            }),
            RecoveryAction::Retry
        );
        assert_eq!(
            classify(&KernelError::DependencyMissing {
                module: "ipykernel".into(),
                interpreter: PathBuf::from("/usr/bin/python3"),
            }),
            RecoveryAction::PromptInstall
        );
        assert_eq!(classify(&KernelError::Cancelled), RecoveryAction::Ignore);
        assert_eq!(
            classify(&KernelError::SessionDisposed),
            RecoveryAction::ShowMessage
        );
    }

    #[test]
    fn test_error_messages() {
        let err = KernelError::Timeout {
            operation: TimeoutOperation::Interrupt,
            after: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 250ms waiting for kernel interrupt"
        );
        assert_eq!(
            KernelError::KernelProcessExited { exit_code: Some(2) }.to_string(),
            "Kernel process exited with code 2"
        );
        assert_eq!(
            KernelError::KernelProcessExited { exit_code: None }.to_string(),
            "Kernel process exited"
        );
    }

    #[tokio::test]
    async fn test_reporter_shows_each_error_once() {
        let prompt = Arc::new(ScriptedPrompt::new(vec![]));
        let reporter = ErrorReporter::new(prompt.clone());

        let err = KernelError::Connection("refused".into());
        assert!(reporter.report(&err).await);
        assert!(!reporter.report(&err.clone()).await);
        assert!(
            reporter
                .report(&KernelError::Connection("reset".into()))
                .await
        );

        assert_eq!(prompt.shown().len(), 2);
    }

    #[tokio::test]
    async fn test_reporter_never_shows_cancellation() {
        let prompt = Arc::new(ScriptedPrompt::new(vec![]));
        let reporter = ErrorReporter::new(prompt.clone());

        assert!(!reporter.report(&KernelError::Cancelled).await);
        assert!(prompt.shown().is_empty());
    }
}
