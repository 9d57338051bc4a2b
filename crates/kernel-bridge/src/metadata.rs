//! How to reach a kernel: [`KernelConnectionMetadata`] and the types it is
//! built from.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A named template describing how to launch a kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    pub display_name: String,
    pub argv: Vec<String>,
    pub language: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// `"signal"` (default) or `"message"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl KernelSpec {
    /// The spec used when nothing better is known: ipykernel on `python`.
    pub fn default_python() -> Self {
        KernelSpec {
            name: "python3".to_string(),
            display_name: "Python 3 (ipykernel)".to_string(),
            argv: vec![
                "python".to_string(),
                "-m".to_string(),
                "ipykernel_launcher".to_string(),
                "-f".to_string(),
                "{connection_file}".to_string(),
            ],
            language: "python".to_string(),
            env: HashMap::new(),
            interrupt_mode: None,
            metadata: None,
        }
    }

    /// Whether interrupts must go over the control channel instead of a signal.
    pub fn interrupts_by_message(&self) -> bool {
        self.interrupt_mode.as_deref() == Some("message")
    }
}

/// An interpreter executable and the environment it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpreterInfo {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_path: Option<PathBuf>,
}

/// A kernel already running on a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveKernelModel {
    /// Kernel id on the server.
    pub id: String,
    /// Name of the spec the kernel was started from.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub number_of_connections: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
    /// Session attached to the kernel, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Notebook path of the attached session, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Everything needed to start or attach to one kernel.
///
/// Immutable once built; [`KernelConnectionMetadata::id`] is the cache key
/// used for kernel reuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum KernelConnectionMetadata {
    #[serde(rename_all = "camelCase")]
    StartUsingLocalKernelSpec {
        id: String,
        kernel_spec: KernelSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interpreter: Option<InterpreterInfo>,
    },
    #[serde(rename_all = "camelCase")]
    StartUsingPythonInterpreter {
        id: String,
        kernel_spec: KernelSpec,
        interpreter: InterpreterInfo,
    },
    #[serde(rename_all = "camelCase")]
    StartUsingRemoteKernelSpec {
        id: String,
        kernel_spec: KernelSpec,
        base_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interpreter: Option<InterpreterInfo>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectToLiveRemoteKernel {
        id: String,
        kernel_model: LiveKernelModel,
        base_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kernel_spec: Option<KernelSpec>,
    },
}

/// Short stable hash of the identity-bearing parts of a connection.
fn connection_id(kind: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    for part in parts {
        // Length prefix keeps ("ab","c") and ("a","bc") apart
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

fn spec_identity(spec: &KernelSpec) -> String {
    format!("{}\u{1f}{}\u{1f}{}", spec.name, spec.argv.join("\u{1e}"), spec.language)
}

fn interpreter_identity(interpreter: Option<&InterpreterInfo>) -> String {
    interpreter
        .map(|i| i.path.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_lowercase()
}

impl KernelConnectionMetadata {
    pub fn local_spec(kernel_spec: KernelSpec, interpreter: Option<InterpreterInfo>) -> Self {
        let id = connection_id(
            "localSpec",
            &[
                &spec_identity(&kernel_spec),
                &interpreter_identity(interpreter.as_ref()),
            ],
        );
        KernelConnectionMetadata::StartUsingLocalKernelSpec {
            id,
            kernel_spec,
            interpreter,
        }
    }

    /// A kernel launched straight from an interpreter with ipykernel.
    pub fn python_interpreter(interpreter: InterpreterInfo) -> Self {
        let mut kernel_spec = KernelSpec::default_python();
        kernel_spec.argv[0] = interpreter.path.to_string_lossy().into_owned();
        if let Some(name) = &interpreter.display_name {
            kernel_spec.display_name = name.clone();
        }
        let id = connection_id(
            "pythonInterpreter",
            &[&interpreter_identity(Some(&interpreter))],
        );
        KernelConnectionMetadata::StartUsingPythonInterpreter {
            id,
            kernel_spec,
            interpreter,
        }
    }

    pub fn remote_spec(
        kernel_spec: KernelSpec,
        base_url: &str,
        interpreter: Option<InterpreterInfo>,
    ) -> Self {
        let base_url = normalize_base_url(base_url);
        let id = connection_id(
            "remoteSpec",
            &[
                &spec_identity(&kernel_spec),
                &interpreter_identity(interpreter.as_ref()),
                &base_url,
            ],
        );
        KernelConnectionMetadata::StartUsingRemoteKernelSpec {
            id,
            kernel_spec,
            base_url,
            interpreter,
        }
    }

    pub fn live_remote(
        kernel_model: LiveKernelModel,
        base_url: &str,
        kernel_spec: Option<KernelSpec>,
    ) -> Self {
        let base_url = normalize_base_url(base_url);
        let id = connection_id("liveRemote", &[&kernel_model.id, &base_url]);
        KernelConnectionMetadata::ConnectToLiveRemoteKernel {
            id,
            kernel_model,
            base_url,
            kernel_spec,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            KernelConnectionMetadata::StartUsingLocalKernelSpec { id, .. }
            | KernelConnectionMetadata::StartUsingPythonInterpreter { id, .. }
            | KernelConnectionMetadata::StartUsingRemoteKernelSpec { id, .. }
            | KernelConnectionMetadata::ConnectToLiveRemoteKernel { id, .. } => id,
        }
    }

    pub fn kernel_spec(&self) -> Option<&KernelSpec> {
        match self {
            KernelConnectionMetadata::StartUsingLocalKernelSpec { kernel_spec, .. }
            | KernelConnectionMetadata::StartUsingPythonInterpreter { kernel_spec, .. }
            | KernelConnectionMetadata::StartUsingRemoteKernelSpec { kernel_spec, .. } => {
                Some(kernel_spec)
            }
            KernelConnectionMetadata::ConnectToLiveRemoteKernel { kernel_spec, .. } => {
                kernel_spec.as_ref()
            }
        }
    }

    pub fn interpreter(&self) -> Option<&InterpreterInfo> {
        match self {
            KernelConnectionMetadata::StartUsingLocalKernelSpec { interpreter, .. }
            | KernelConnectionMetadata::StartUsingRemoteKernelSpec { interpreter, .. } => {
                interpreter.as_ref()
            }
            KernelConnectionMetadata::StartUsingPythonInterpreter { interpreter, .. } => {
                Some(interpreter)
            }
            KernelConnectionMetadata::ConnectToLiveRemoteKernel { .. } => None,
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        match self {
            KernelConnectionMetadata::StartUsingRemoteKernelSpec { base_url, .. }
            | KernelConnectionMetadata::ConnectToLiveRemoteKernel { base_url, .. } => {
                Some(base_url)
            }
            _ => None,
        }
    }

    /// Name of the spec a fresh kernel for this connection is started from.
    pub fn spec_name(&self) -> &str {
        match self {
            KernelConnectionMetadata::ConnectToLiveRemoteKernel { kernel_model, .. } => {
                &kernel_model.name
            }
            KernelConnectionMetadata::StartUsingLocalKernelSpec { kernel_spec, .. }
            | KernelConnectionMetadata::StartUsingPythonInterpreter { kernel_spec, .. }
            | KernelConnectionMetadata::StartUsingRemoteKernelSpec { kernel_spec, .. } => {
                &kernel_spec.name
            }
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            KernelConnectionMetadata::ConnectToLiveRemoteKernel { kernel_model, kernel_spec, .. } => {
                let name = kernel_spec
                    .as_ref()
                    .map(|s| s.display_name.as_str())
                    .unwrap_or(&kernel_model.name);
                match &kernel_model.path {
                    Some(path) => format!("{} ({})", name, path),
                    None => name.to_string(),
                }
            }
            other => other
                .kernel_spec()
                .map(|s| s.display_name.clone())
                .unwrap_or_default(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.base_url().is_some()
    }

    /// Id of the already-running kernel this connection attaches to.
    pub fn live_kernel_id(&self) -> Option<&str> {
        match self {
            KernelConnectionMetadata::ConnectToLiveRemoteKernel { kernel_model, .. } => {
                Some(&kernel_model.id)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> KernelSpec {
        KernelSpec {
            name: name.to_string(),
            display_name: format!("{} kernel", name),
            argv: vec![name.to_string(), "{connection_file}".to_string()],
            language: "python".to_string(),
            env: HashMap::new(),
            interrupt_mode: None,
            metadata: None,
        }
    }

    fn interpreter(path: &str) -> InterpreterInfo {
        InterpreterInfo {
            path: PathBuf::from(path),
            version: Some("3.12.1".into()),
            display_name: None,
            env_type: None,
            env_name: None,
            env_path: None,
        }
    }

    #[test]
    fn test_id_is_deterministic() {
        let a = KernelConnectionMetadata::remote_spec(spec("python3"), "http://host:8888/", None);
        let b = KernelConnectionMetadata::remote_spec(spec("python3"), "http://host:8888", None);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 32);
    }

    #[test]
    fn test_id_differs_per_triple_member() {
        let base = KernelConnectionMetadata::remote_spec(spec("python3"), "http://a:8888", None);
        let other_spec =
            KernelConnectionMetadata::remote_spec(spec("julia"), "http://a:8888", None);
        let other_server =
            KernelConnectionMetadata::remote_spec(spec("python3"), "http://b:8888", None);
        let other_interpreter = KernelConnectionMetadata::remote_spec(
            spec("python3"),
            "http://a:8888",
            Some(interpreter("/usr/bin/python3")),
        );

        assert_ne!(base.id(), other_spec.id());
        assert_ne!(base.id(), other_server.id());
        assert_ne!(base.id(), other_interpreter.id());
    }

    #[test]
    fn test_local_and_remote_ids_never_collide() {
        let local = KernelConnectionMetadata::local_spec(spec("python3"), None);
        let remote = KernelConnectionMetadata::remote_spec(spec("python3"), "", None);
        assert_ne!(local.id(), remote.id());
    }

    #[test]
    fn test_python_interpreter_uses_interpreter_path() {
        let meta = KernelConnectionMetadata::python_interpreter(interpreter("/opt/venv/bin/python"));
        let spec = meta.kernel_spec().unwrap();
        assert_eq!(spec.argv[0], "/opt/venv/bin/python");
        assert_eq!(
            meta.interpreter().map(|i| i.path.clone()),
            Some(PathBuf::from("/opt/venv/bin/python"))
        );
        assert!(!meta.is_remote());
    }

    #[test]
    fn test_live_kernel_accessors() {
        let model = LiveKernelModel {
            id: "abc".into(),
            name: "python3".into(),
            last_activity_time: None,
            number_of_connections: 2,
            execution_state: Some("idle".into()),
            session_id: None,
            path: Some("work/analysis.ipynb".into()),
        };
        let meta = KernelConnectionMetadata::live_remote(model, "http://host:8888", None);

        assert_eq!(meta.live_kernel_id(), Some("abc"));
        assert_eq!(meta.spec_name(), "python3");
        assert_eq!(meta.display_name(), "python3 (work/analysis.ipynb)");
        assert!(meta.is_remote());
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let meta = KernelConnectionMetadata::local_spec(spec("python3"), None);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["kind"], "startUsingLocalKernelSpec");
        assert_eq!(json["kernelSpec"]["name"], "python3");

        let parsed: KernelConnectionMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, meta);
    }
}
