//! The wire envelope and command vocabulary shared between the relay core
//! and the websocket transport. Both directions (upstream agent and
//! downstream games) speak the same envelope shape; the command set differs
//! by direction and is documented next to each constant.

pub mod data;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The two-character sequence used to prefix a raw action name with its
/// owning game id when multiplexing is enabled. Fixed, not configurable:
/// the derived id rule in `relay_core::id` guarantees a game id never
/// contains this sequence, since consecutive hyphens are collapsed to one.
pub const ACTION_NAME_SEP: &str = "--";

/// The synthetic action the relay exposes upstream to let the agent ask a
/// specific game to shut down gracefully.
pub const SHUTDOWN_GAME_ACTION: &str = "shutdown_game";

/// Default grace period between a `shutdown/graceful` request and the relay
/// forcing the peer closed.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

// ---------------------------------------------------------------------
// Downstream (game) -> core
// ---------------------------------------------------------------------

/// `game` required. Opens a session.
pub const CMD_STARTUP: &str = "startup";
/// `data["nr-version"]` required. Negotiates protocol feature flags.
pub const CMD_VERSION_HANDSHAKE: &str = "nrc-endpoints/startup";
/// Optional `data.include` array selecting which health fields to return.
pub const CMD_HEALTH: &str = "nrc-endpoints/health";
/// `data.message`, `data.silent`. Forwarded upstream with game attribution.
pub const CMD_CONTEXT: &str = "context";
/// `data.actions`: array of action specs to register.
pub const CMD_REGISTER_ACTIONS: &str = "actions/register";
/// `data.action_names`: array of raw action names to unregister.
pub const CMD_UNREGISTER_ACTIONS: &str = "actions/unregister";
/// Forces the agent to consider a restricted set of actions next turn.
pub const CMD_FORCE_ACTIONS: &str = "actions/force";
/// `data.id`, `data.success`, optional `data.message`. Answers an action.
pub const CMD_ACTION_RESULT: &str = "action/result";
/// No payload. Acknowledges a `shutdown/graceful` request.
pub const CMD_SHUTDOWN_ACK: &str = "shutdown/ready";

// ---------------------------------------------------------------------
// Core -> downstream (game)
// ---------------------------------------------------------------------

/// `data.id`, `data.name` (raw), `data.data` (string payload).
pub const CMD_ACTION: &str = "action";
/// `data.wants_shutdown`. Asks a session to close itself.
pub const CMD_SHUTDOWN_GRACEFUL: &str = "shutdown/graceful";
/// `data.error`. Reply to a `startup` rejected because the relay is locked.
pub const CMD_RELAY_LOCKED: &str = "nrelay/locked";
/// `data.error`. Generic protocol-level error frame.
pub const CMD_ERROR: &str = "nrc-endpoints/error";
/// `data.error`, `data.supported_versions`, `data.suggested_version`.
pub const CMD_VERSION_MISMATCH: &str = "nrc-endpoints/version-mismatch";
/// Reply to a successful `nrc-endpoints/startup` handshake.
pub const CMD_STARTUP_ACK: &str = "nrc-endpoints/startup-ack";
/// Reply to `nrc-endpoints/health`.
pub const CMD_HEALTH_RESPONSE: &str = "nrc-endpoints/health-response";

// ---------------------------------------------------------------------
// Upstream (agent) <-> core. `action`/`shutdown/graceful` are reused verbatim
// as inbound-only commands on this side of the relay.
// ---------------------------------------------------------------------

/// Inbound only. Asks the relay to re-emit a full register for every game.
pub const CMD_REREGISTER_ALL: &str = "actions/reregister_all";

/// The shared envelope for every message in both directions.
///
/// `game` carries operator attribution (which downstream session a message
/// concerns); it is absent on upstream-only commands like
/// `actions/reregister_all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(command: impl Into<String>) -> Self {
        Envelope {
            command: command.into(),
            game: None,
            data: None,
        }
    }

    pub fn with_game(mut self, game: impl Into<String>) -> Self {
        self.game = Some(game.into());
        self
    }

    pub fn with_data(mut self, data: impl Serialize) -> Result<Self, serde_json::Error> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }

    /// Deserializes `data` into `T`, failing if the field is absent.
    pub fn data_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, EnvelopeDataError> {
        let value = self.data.as_ref().ok_or(EnvelopeDataError::Missing)?;
        serde_json::from_value(value.clone()).map_err(EnvelopeDataError::Malformed)
    }
}

/// Raised when a frame's `data` field does not match the shape the command
/// requires. Per spec.md §7, this is a protocol-level failure: callers log
/// and drop the frame, they never propagate it further.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeDataError {
    #[error("missing data field")]
    Missing,
    #[error("malformed data field: {0}")]
    Malformed(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::new(CMD_ACTION)
            .with_game("buckshot-roulette")
            .with_data(serde_json::json!({"id": "r1"}))
            .unwrap();
        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.command, CMD_ACTION);
        assert_eq!(back.game.as_deref(), Some("buckshot-roulette"));
    }

    #[test]
    fn data_as_reports_missing_field() {
        let env = Envelope::new(CMD_SHUTDOWN_ACK);
        let err = env.data_as::<data::ActionResultData>().unwrap_err();
        assert!(matches!(err, EnvelopeDataError::Missing));
    }
}
