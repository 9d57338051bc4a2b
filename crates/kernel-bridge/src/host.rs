//! Capabilities the host application provides to the session layer.
//!
//! The session layer never talks to a UI or an environment manager
//! directly. Everything it needs from the outside world goes through one of
//! these traits.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use jupyter_protocol::JupyterKernelspec;

use crate::error::KernelError;
use crate::metadata::{InterpreterInfo, KernelSpec};

/// Interpreter/environment discovery.
#[async_trait]
pub trait InterpreterService: Send + Sync {
    /// The interpreter selected for a resource (notebook path), if any.
    async fn active_interpreter(&self, resource: Option<&Path>) -> Option<InterpreterInfo>;

    /// Details for an interpreter executable, if it is a known interpreter.
    async fn interpreter_details(&self, path: &Path) -> Option<InterpreterInfo>;
}

/// Answer from the dependency manager after a missing-dependency failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallResponse {
    /// Dependencies were installed; the launch can be retried.
    Ok,
    /// The user wants to pick a different kernel.
    SelectAnother,
    /// The user dismissed the install prompt.
    Cancel,
}

#[async_trait]
pub trait DependencyManager: Send + Sync {
    async fn install_missing_dependencies(&self, error: &KernelError) -> InstallResponse;
}

/// Modal warning surface. Returns the chosen option, or `None` if dismissed.
#[async_trait]
pub trait Prompt: Send + Sync {
    async fn show_warning_message(&self, message: &str, options: &[&str]) -> Option<String>;
}

/// Supplies the password for a password-protected server.
///
/// `Ok(None)` means no password is needed; an `Err` aborts the connection.
#[async_trait]
pub trait PasswordProvider: Send + Sync {
    async fn password(&self, base_url: &str) -> Result<Option<String>, KernelError>;
}

/// Supplies extra request headers (e.g. a bearer token from a hub).
pub trait AuthHeaderProvider: Send + Sync {
    fn auth_headers(&self) -> HashMap<String, String>;
}

/// Source of locally installed kernel specs.
#[async_trait]
pub trait KernelSpecSource: Send + Sync {
    async fn kernel_specs(&self) -> Result<Vec<KernelSpec>, KernelError>;
}

/// Kernel specs found in the Jupyter data directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct JupyterDataDirSpecs;

#[async_trait]
impl KernelSpecSource for JupyterDataDirSpecs {
    async fn kernel_specs(&self) -> Result<Vec<KernelSpec>, KernelError> {
        let mut specs: Vec<KernelSpec> = runtimelib::list_kernelspecs()
            .await
            .into_iter()
            .map(|dir| kernel_spec_from(dir.kernel_name, dir.kernelspec))
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(specs)
    }
}

fn kernel_spec_from(name: String, spec: JupyterKernelspec) -> KernelSpec {
    KernelSpec {
        name,
        display_name: spec.display_name,
        argv: spec.argv,
        language: spec.language,
        env: spec.env.unwrap_or_default(),
        interrupt_mode: spec.interrupt_mode,
        metadata: spec
            .metadata
            .map(|m| serde_json::Value::Object(m.into_iter().collect())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernelspec_fields_survive_mapping() {
        let spec = JupyterKernelspec {
            argv: vec!["ir".into(), "{connection_file}".into()],
            display_name: "R".into(),
            language: "R".into(),
            metadata: Some(HashMap::from([(
                "debugger".to_string(),
                serde_json::Value::Bool(true),
            )])),
            interrupt_mode: Some("message".into()),
            env: Some(HashMap::from([("R_LIBS".to_string(), "/opt/r".to_string())])),
        };

        let mapped = kernel_spec_from("ir".into(), spec);

        assert_eq!(mapped.name, "ir");
        assert!(mapped.interrupts_by_message());
        assert_eq!(mapped.env["R_LIBS"], "/opt/r");
        assert_eq!(
            mapped.metadata,
            Some(serde_json::json!({"debugger": true}))
        );
    }
}
