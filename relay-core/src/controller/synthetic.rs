//! The synthetic `shutdown_game` action: a single, relay-owned upstream
//! action (never namespaced, never owned by any one game) that lets the
//! agent ask a specific downstream game to shut down gracefully (spec.md
//! §4.6).

use super::RelayController;
use crate::ids::RequestId;
use protocol::data::{
    ActionSpecData, GracefulShutdownData, RegisterActionsData, ShutdownGameArgs,
    UnregisterActionsData,
};
use protocol::{Envelope, SHUTDOWN_GAME_ACTION};
use serde_json::json;
use tracing::warn;

impl RelayController {
    /// Re-sends the `shutdown_game` action spec upstream with a fresh enum
    /// of live game ids, or unregisters it entirely once no game remains.
    /// Called on every open/close and on `actions/reregister_all` — the
    /// enum must always describe *currently* live games, never a stale
    /// snapshot (spec.md §4.6: "dynamically refreshed enum schema").
    pub(super) async fn refresh_shutdown_game_action(&self) {
        let games = self.registry.all().await;

        if games.is_empty() {
            let data = UnregisterActionsData {
                action_names: vec![SHUTDOWN_GAME_ACTION.to_string()],
            };
            match Envelope::new(protocol::CMD_UNREGISTER_ACTIONS).with_data(data) {
                Ok(frame) => self.send_upstream(frame).await,
                Err(err) => warn!(?err, "failed to encode shutdown_game unregister"),
            }
            return;
        }

        let ids: Vec<serde_json::Value> =
            games.iter().map(|(id, _)| json!(id)).collect();
        let schema = json!({
            "type": "object",
            "properties": {
                "game_id": { "type": "string", "enum": ids },
            },
            "required": ["game_id"],
        });

        let spec = ActionSpecData {
            name: SHUTDOWN_GAME_ACTION.to_string(),
            description: "Ask a connected game to shut down gracefully.".to_string(),
            schema: Some(schema),
        };
        let data = RegisterActionsData {
            actions: vec![spec],
        };
        match Envelope::new(protocol::CMD_REGISTER_ACTIONS).with_data(data) {
            Ok(frame) => self.send_upstream(frame).await,
            Err(err) => warn!(?err, "failed to encode shutdown_game register"),
        }
    }

    /// Executes the agent's `shutdown_game` call (spec.md §4.5): a missing
    /// or unparsable `game_id` and an unknown game id both fail upstream
    /// without touching any session; only a resolved, live game gets a
    /// downstream `shutdown/graceful` frame, a grace-period timer, and an
    /// upstream `success=true`.
    pub(super) async fn execute_shutdown_game(&self, request_id: RequestId, raw_data: &str) {
        let Ok(args) = serde_json::from_str::<ShutdownGameArgs>(raw_data) else {
            self.synthesize_failure(request_id, "missing or invalid game_id").await;
            return;
        };

        let Some(session) = self.registry.get_by_id(&args.game_id).await else {
            self.synthesize_failure(request_id, "no such game").await;
            return;
        };

        let frame = Envelope::new(protocol::CMD_SHUTDOWN_GRACEFUL)
            .with_game(session.id.clone())
            .with_data(GracefulShutdownData {
                wants_shutdown: true,
            });
        match frame {
            Ok(frame) => self.send_or_log(session.peer, frame).await,
            Err(err) => warn!(?err, "failed to encode shutdown/graceful"),
        }
        self.timers
            .arm(
                session.id.clone(),
                session.peer,
                self.shutdown_timeout,
                self.transport.clone(),
                self.registry.clone(),
            )
            .await;

        self.synthesize_success(request_id, "shutdown requested").await;
    }

    async fn synthesize_success(&self, request_id: RequestId, message: &str) {
        let data = protocol::data::ActionResultData {
            id: request_id,
            success: true,
            message: Some(message.to_string()),
        };
        match Envelope::new(protocol::CMD_ACTION_RESULT).with_data(data) {
            Ok(frame) => self.send_upstream(frame).await,
            Err(err) => warn!(?err, "failed to encode synthetic success result"),
        }
    }
}
