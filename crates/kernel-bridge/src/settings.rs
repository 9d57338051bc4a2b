//! Settings persistence for kernel connection preferences.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/kernel-bridge/settings.json
//! - Linux: ~/.config/kernel-bridge/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\kernel-bridge\settings.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Connection and timeout preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// How long a new kernel has to answer `kernel_info`.
    pub launch_timeout_ms: u64,

    /// How long an interrupted kernel has to go idle.
    pub interrupt_timeout_ms: u64,

    /// Bound on refreshing kernel specs from a server.
    pub spec_refresh_timeout_ms: u64,

    /// Never prompt before connecting to a tokenless plain-HTTP server.
    pub allow_insecure_connections: bool,

    /// Skip certificate validation for HTTPS servers (self-signed certs).
    pub allow_unauthorized_remote_connection: bool,

    /// Never ask for a password when a server has no token.
    pub disable_password_prompts: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            launch_timeout_ms: 60_000,
            interrupt_timeout_ms: 10_000,
            spec_refresh_timeout_ms: 10_000,
            allow_insecure_connections: false,
            allow_unauthorized_remote_connection: false,
            disable_password_prompts: false,
        }
    }
}

impl BridgeSettings {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn spec_refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.spec_refresh_timeout_ms)
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kernel-bridge")
        .join("settings.json")
}

/// Load settings from the default location.
pub fn load_settings() -> BridgeSettings {
    load_settings_from(&settings_path())
}

/// Load settings from disk, returning defaults if the file doesn't exist
/// or can't be parsed.
pub fn load_settings_from(path: &Path) -> BridgeSettings {
    if !path.exists() {
        return BridgeSettings::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("[settings] Ignoring malformed {}: {}", path.display(), e);
            BridgeSettings::default()
        }),
        Err(e) => {
            warn!("[settings] Failed to read {}: {}", path.display(), e);
            BridgeSettings::default()
        }
    }
}

/// Save settings to disk
pub fn save_settings_to(settings: &BridgeSettings, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, format!("{json}\n"))
}
