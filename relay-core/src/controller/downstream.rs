//! The downstream-facing protocol state machine: everything a connected
//! game can send the relay (spec.md §4.1–§4.4, §6.1).

use super::RelayController;
use crate::errors::{OpenError, UpgradeError};
use crate::ids::PeerId;
use crate::session::ActionSpec;
use protocol::data::{
    ActionResultData, ContextData, ErrorData, ForceActionsData, HealthGameEntry,
    HealthRequestData, HealthResponseData, RegisterActionsData, StartupAckData,
    UnregisterActionsData, VersionHandshakeData, VersionMismatchData,
};
use protocol::{Envelope, EnvelopeDataError};
use tracing::{debug, warn};

impl RelayController {
    pub(super) async fn handle_downstream_frame(&self, peer: PeerId, envelope: Envelope) {
        match envelope.command.as_str() {
            protocol::CMD_STARTUP => self.on_startup(peer, envelope).await,
            protocol::CMD_VERSION_HANDSHAKE => self.on_version_handshake(peer, envelope).await,
            protocol::CMD_HEALTH => self.on_health(peer, envelope).await,
            protocol::CMD_CONTEXT => self.on_context(peer, envelope).await,
            protocol::CMD_REGISTER_ACTIONS => self.on_register_actions(peer, envelope).await,
            protocol::CMD_UNREGISTER_ACTIONS => self.on_unregister_actions(peer, envelope).await,
            protocol::CMD_FORCE_ACTIONS => self.on_force_actions(peer, envelope).await,
            protocol::CMD_ACTION_RESULT => self.on_action_result(peer, envelope).await,
            protocol::CMD_SHUTDOWN_ACK => self.on_shutdown_ack(peer, envelope).await,
            other => warn!(%peer, command = other, "unrecognized downstream command"),
        }
    }

    async fn on_startup(&self, peer: PeerId, envelope: Envelope) {
        let Some(display_name) = envelope.game else {
            self.reply_error(peer, "startup requires a game name").await;
            return;
        };

        match self.registry.open(peer, &display_name, Default::default()).await {
            Ok(session) => {
                debug!(%peer, id = %session.id, "session opened");
                self.refresh_shutdown_game_action().await;
            }
            Err(OpenError::Locked) => {
                let frame = Envelope::new(protocol::CMD_RELAY_LOCKED).with_data(ErrorData {
                    error: "relay is locked by a non-multiplexing session".to_string(),
                });
                if let Ok(frame) = frame {
                    self.send_or_log(peer, frame).await;
                }
            }
            Err(err @ (OpenError::EmptyId | OpenError::IdCollision(_))) => {
                self.reply_error(peer, &err.to_string()).await;
            }
        }
    }

    async fn on_version_handshake(&self, peer: PeerId, envelope: Envelope) {
        let data: VersionHandshakeData = match envelope.data_as() {
            Ok(d) => d,
            Err(err) => return self.reply_malformed(peer, err).await,
        };

        if !self.supported_versions.contains(&data.nr_version) {
            let frame = Envelope::new(protocol::CMD_VERSION_MISMATCH).with_data(
                VersionMismatchData {
                    error: format!("unsupported nr-version {:?}", data.nr_version),
                    supported_versions: self.supported_versions.clone(),
                    suggested_version: self.nr_version.clone(),
                },
            );
            if let Ok(frame) = frame {
                self.send_or_log(peer, frame).await;
            }
            return;
        }

        let features = features_for_version(&data.nr_version);
        match self
            .registry
            .upgrade_features(peer, features, data.nr_version.clone())
            .await
        {
            Ok(session) => {
                let ack = Envelope::new(protocol::CMD_STARTUP_ACK).with_data(StartupAckData {
                    id: session.id.clone(),
                    features: session.features,
                });
                if let Ok(ack) = ack {
                    self.send_or_log(peer, ack).await;
                }
            }
            Err(UpgradeError::NoSuchSession(_)) => {
                self.reply_error(peer, "version handshake before startup").await;
            }
            Err(err @ UpgradeError::UnsupportedVersion { .. }) => {
                self.reply_error(peer, &err.to_string()).await;
            }
        }
    }

    async fn on_health(&self, peer: PeerId, envelope: Envelope) {
        let request: HealthRequestData = envelope.data_as().unwrap_or_default();
        let games = self
            .registry
            .all()
            .await
            .into_iter()
            .map(|(id, display_name)| HealthGameEntry { id, display_name })
            .collect();

        let response = HealthResponseData {
            neuro_backend_connected: self.is_upstream_connected(),
            uptime_seconds: self.uptime().as_secs(),
            games,
        };
        let data = match request.include {
            Some(fields) => filter_health_fields(&response, &fields),
            None => serde_json::to_value(response),
        };
        match data {
            Ok(data) => {
                let frame = Envelope::new(protocol::CMD_HEALTH_RESPONSE);
                self.send_or_log(peer, Envelope { data: Some(data), ..frame }).await;
            }
            Err(err) => warn!(?err, "failed to encode health response"),
        }
    }

    async fn on_context(&self, peer: PeerId, envelope: Envelope) {
        let Some(session) = self.registry.get(peer).await else {
            return self.reply_error(peer, "context before startup").await;
        };
        let data: ContextData = match envelope.data_as() {
            Ok(d) => d,
            Err(err) => return self.reply_malformed(peer, err).await,
        };
        let prefixed = ContextData {
            message: format!("[{}] {}", session.id, data.message),
            silent: data.silent,
        };
        if let Ok(frame) = Envelope::new(protocol::CMD_CONTEXT)
            .with_game(session.id.clone())
            .with_data(prefixed)
        {
            self.send_upstream(frame).await;
        }
    }

    async fn on_register_actions(&self, peer: PeerId, envelope: Envelope) {
        let Some(session) = self.registry.get(peer).await else {
            return self.reply_error(peer, "actions/register before startup").await;
        };
        let data: RegisterActionsData = match envelope.data_as() {
            Ok(d) => d,
            Err(err) => return self.reply_malformed(peer, err).await,
        };

        let specs: Vec<ActionSpec> = data
            .actions
            .iter()
            .map(|a| ActionSpec {
                name: a.name.clone(),
                description: a.description.clone(),
                schema: a.schema.clone(),
            })
            .collect();
        self.registry.register_raw_actions(peer, specs).await;

        let mut exposed = Vec::with_capacity(data.actions.len());
        for action in data.actions {
            match self
                .router
                .register(&session.id, &action.name, session.features.multiplexing)
                .await
            {
                Ok(name) => exposed.push(protocol::data::ActionSpecData {
                    name,
                    description: action.description,
                    schema: action.schema,
                }),
                Err(err) => warn!(%peer, ?err, "action name conflict, dropping registration"),
            }
        }
        if exposed.is_empty() {
            return;
        }
        if let Ok(frame) = Envelope::new(protocol::CMD_REGISTER_ACTIONS)
            .with_data(RegisterActionsData { actions: exposed })
        {
            self.send_upstream(frame).await;
        }
    }

    async fn on_unregister_actions(&self, peer: PeerId, envelope: Envelope) {
        let Some(session) = self.registry.get(peer).await else {
            return self.reply_error(peer, "actions/unregister before startup").await;
        };
        let data: UnregisterActionsData = match envelope.data_as() {
            Ok(d) => d,
            Err(err) => return self.reply_malformed(peer, err).await,
        };

        let (_, removed) = self
            .registry
            .unregister_raw_actions(peer, &data.action_names)
            .await
            .unwrap_or_default();

        let mut exposed_names = Vec::with_capacity(removed.len());
        for raw_name in removed {
            if let Some(exposed) = self
                .router
                .unregister(&session.id, &raw_name, session.features.multiplexing)
                .await
            {
                exposed_names.push(exposed);
            }
        }
        if exposed_names.is_empty() {
            return;
        }
        if let Ok(frame) = Envelope::new(protocol::CMD_UNREGISTER_ACTIONS).with_data(
            UnregisterActionsData {
                action_names: exposed_names,
            },
        ) {
            self.send_upstream(frame).await;
        }
    }

    async fn on_force_actions(&self, peer: PeerId, envelope: Envelope) {
        let Some(session) = self.registry.get(peer).await else {
            return self.reply_error(peer, "actions/force before startup").await;
        };
        let data: ForceActionsData = match envelope.data_as() {
            Ok(d) => d,
            Err(err) => return self.reply_malformed(peer, err).await,
        };

        let action_names = data
            .action_names
            .iter()
            .map(|raw| crate::router::exposed_name(&session.id, raw, session.features.multiplexing))
            .collect();
        let forced = ForceActionsData {
            action_names,
            ..data
        };
        if let Ok(frame) = Envelope::new(protocol::CMD_FORCE_ACTIONS).with_data(forced) {
            self.send_upstream(frame).await;
        }
    }

    async fn on_action_result(&self, peer: PeerId, envelope: Envelope) {
        let data: ActionResultData = match envelope.data_as() {
            Ok(d) => d,
            Err(err) => return self.reply_malformed(peer, err).await,
        };

        // The request may already have been released by a session purge
        // racing this reply (spec.md §7 kind 3) — that's not an error, the
        // agent simply already got its synthetic failure.
        if self.router.release(&data.id).await.is_none() {
            debug!(%peer, request_id = %data.id, "action/result for an unknown or already-released request");
            return;
        }
        if let Ok(frame) = Envelope::new(protocol::CMD_ACTION_RESULT).with_data(data) {
            self.send_upstream(frame).await;
        }
    }

    async fn on_shutdown_ack(&self, peer: PeerId, _envelope: Envelope) {
        if let Some(session) = self.registry.get(peer).await {
            self.timers.cancel(&session.id).await;
        }
    }

    pub(super) async fn handle_downstream_closed(&self, peer: PeerId) {
        let Some(session) = self.registry.close(peer).await else {
            return;
        };
        debug!(id = %session.id, "session closed");

        let released = self.router.purge_session(&session.id).await;
        for request_id in released {
            self.synthesize_failure(request_id, "session terminated").await;
        }
        self.timers.cancel(&session.id).await;
        self.refresh_shutdown_game_action().await;
    }

    async fn reply_error(&self, peer: PeerId, message: &str) {
        if let Ok(frame) = Envelope::new(protocol::CMD_ERROR).with_data(ErrorData {
            error: message.to_string(),
        }) {
            self.send_or_log(peer, frame).await;
        }
    }

    async fn reply_malformed(&self, peer: PeerId, err: EnvelopeDataError) {
        warn!(%peer, ?err, "malformed downstream frame");
        self.reply_error(peer, &err.to_string()).await;
    }
}

/// Restricts a health response to only the top-level fields named in
/// `data.include` (spec.md §6.1). An unrecognized field name is silently
/// dropped rather than erroring — the response is still well-formed, just
/// narrower than asked.
fn filter_health_fields(
    response: &HealthResponseData,
    fields: &[String],
) -> Result<serde_json::Value, serde_json::Error> {
    let full = serde_json::to_value(response)?;
    let serde_json::Value::Object(full) = full else {
        unreachable!("HealthResponseData always serializes to a JSON object");
    };
    let filtered: serde_json::Map<String, serde_json::Value> = fields
        .iter()
        .filter_map(|name| full.get(name.as_str()).map(|v| (name.clone(), v.clone())))
        .collect();
    Ok(serde_json::Value::Object(filtered))
}

/// The fixed feature set a version handshake unlocks. Only one version is
/// supported today, so this is a single arm rather than a table — grows
/// into one if the protocol ever gains a second version (spec.md §9.2).
fn features_for_version(version: &str) -> protocol::data::FeatureFlags {
    match version {
        "1" => protocol::data::FeatureFlags {
            multiplexing: true,
            health: true,
            custom_routing: true,
        },
        _ => protocol::data::FeatureFlags::default(),
    }
}
