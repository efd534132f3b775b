//! Typed shapes for each command's `data` field. Kept separate from the
//! envelope and command constants so a caller can `use protocol::data::*`
//! without pulling in the command-name strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `nrc-endpoints/startup` request: negotiates the protocol version and,
/// on success, the feature set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VersionHandshakeData {
    #[serde(rename = "nr-version")]
    pub nr_version: String,
}

/// Feature flags a downstream session may declare or be upgraded to.
/// Defaults to all-false — a session that never sends the version handshake
/// stays in the pre-multiplexing, lock-holding mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub multiplexing: bool,
    #[serde(default)]
    pub health: bool,
    #[serde(default)]
    pub custom_routing: bool,
}

/// Reply to a successful version handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupAckData {
    pub id: String,
    #[serde(flatten)]
    pub features: FeatureFlags,
}

/// Reply when the declared `nr-version` is not in the supported list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMismatchData {
    pub error: String,
    pub supported_versions: Vec<String>,
    pub suggested_version: String,
}

/// `nrc-endpoints/health` request: optionally restricts which fields the
/// response carries.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthRequestData {
    #[serde(default)]
    pub include: Option<Vec<String>>,
}

/// One entry in a health response's game listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthGameEntry {
    pub id: String,
    pub display_name: String,
}

/// `nrc-endpoints/health-response` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponseData {
    #[serde(rename = "neuro-backend-connected")]
    pub neuro_backend_connected: bool,
    #[serde(rename = "uptime-seconds")]
    pub uptime_seconds: u64,
    pub games: Vec<HealthGameEntry>,
}

/// `context`: forwarded upstream with the game id prepended to `message`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextData {
    pub message: String,
    #[serde(default)]
    pub silent: bool,
}

/// One action being registered. `schema` is opaque — never interpreted by
/// the relay, only carried through.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionSpecData {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegisterActionsData {
    pub actions: Vec<ActionSpecData>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UnregisterActionsData {
    pub action_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForceActionsData {
    pub query: String,
    pub action_names: Vec<String>,
    #[serde(default)]
    pub ephemeral_context: bool,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub state: Option<Value>,
}

/// `action/result` (downstream->core) and the corresponding upstream reply.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionResultData {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// `action` (both directions): `id`/`name` are the exposed/raw name
/// depending on direction, `data` is an opaque string payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionData {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub data: String,
}

/// `shutdown/graceful` (core->downstream) and `wants_shutdown` toggling
/// (upstream->core, relay-wide).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GracefulShutdownData {
    pub wants_shutdown: bool,
}

/// Generic error payload for `nrelay/locked` and `nrc-endpoints/error`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorData {
    pub error: String,
}

/// `shutdown_game`'s `data.game_id` argument when the agent executes it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownGameArgs {
    pub game_id: String,
}
