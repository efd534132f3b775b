//! Hot-reloadable relay configuration, loaded from a JSON file next to the
//! binary (default `RelayConfig.json`, overridable via the first CLI
//! argument). Mirrors the teacher's `GameConfig.json` pattern: load once at
//! startup, and again on demand via `/reload` without restarting the
//! process.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// URL of the upstream agent this relay connects out to as a client.
    pub upstream_url: String,
    /// Address the downstream websocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Operator-facing name for this relay instance, surfaced nowhere on
    /// the wire today but carried for logging and future health fields.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Grace period between a `shutdown/graceful` request and force-close.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// The version this relay advertises as its preferred/suggested one.
    #[serde(default = "default_nr_version")]
    pub nr_version: String,
    /// Every `nr-version` this relay will accept in a handshake.
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<String>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_display_name() -> String {
    "multiplexing-relay".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    protocol::DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

fn default_nr_version() -> String {
    "1".to_string()
}

fn default_supported_versions() -> Vec<String> {
    vec!["1".to_string()]
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            upstream_url: "ws://127.0.0.1:8000/ws".to_string(),
            bind_addr: default_bind_addr(),
            display_name: default_display_name(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            nr_version: default_nr_version(),
            supported_versions: default_supported_versions(),
        }
    }
}

/// Shared, hot-reloadable view of [`RelayConfig`]. The launcher reads it
/// once to build a [`relay_core::RelayControllerConfig`]; later reloads
/// only affect what a future restart would pick up, the same limitation
/// the teacher's `reload_config` has for already-open rooms.
#[derive(Default)]
pub struct AppConfig {
    pub current: RwLock<RelayConfig>,
    pub path: RwLock<String>,
}

pub async fn reload_config(state: &Arc<AppConfig>, path: &str) -> Result<RelayConfig, String> {
    let json_content = fs::read_to_string(path)
        .await
        .map_err(|e| format!("failed to read {path}: {e}"))?;
    let parsed: RelayConfig =
        serde_json::from_str(&json_content).map_err(|e| format!("failed to parse {path}: {e}"))?;

    *state.current.write().await = parsed.clone();
    *state.path.write().await = path.to_string();
    Ok(parsed)
}
