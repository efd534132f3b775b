//! The upstream-facing protocol state machine: everything the agent can
//! send the relay (spec.md §4.4, §4.6, §6.1).

use super::RelayController;
use crate::errors::BindError;
use protocol::data::{ActionData, GracefulShutdownData, RegisterActionsData};
use protocol::{Envelope, SHUTDOWN_GAME_ACTION};
use std::sync::atomic::Ordering;
use tracing::{info, warn};

impl RelayController {
    pub(super) async fn handle_upstream_frame(&self, envelope: Envelope) {
        match envelope.command.as_str() {
            protocol::CMD_ACTION => self.on_upstream_action(envelope).await,
            protocol::CMD_SHUTDOWN_GRACEFUL => self.on_upstream_shutdown(envelope).await,
            protocol::CMD_REREGISTER_ALL => self.on_reregister_all().await,
            other => warn!(command = other, "unrecognized upstream command"),
        }
    }

    async fn on_upstream_action(&self, envelope: Envelope) {
        let data: ActionData = match envelope.data_as() {
            Ok(d) => d,
            Err(err) => {
                warn!(?err, "malformed action frame from upstream");
                return;
            }
        };

        if data.name == SHUTDOWN_GAME_ACTION {
            return self.execute_shutdown_game(data.id, &data.data).await;
        }

        let Some((game_id, raw_name)) = self.router.resolve_raw(&data.name).await else {
            self.synthesize_failure(data.id, "unknown action").await;
            return;
        };
        let Some(session) = self.registry.get_by_id(&game_id).await else {
            self.synthesize_failure(data.id, "game disconnected").await;
            return;
        };

        match self.router.bind(&data.id, game_id.clone()).await {
            Ok(()) => {}
            Err(BindError::DuplicateRequest(_)) => {
                self.synthesize_failure(data.id.clone(), "duplicate request").await;
                return;
            }
        }

        let forwarded = Envelope::new(protocol::CMD_ACTION)
            .with_game(game_id.clone())
            .with_data(ActionData {
                id: data.id.clone(),
                name: raw_name,
                data: data.data,
            });
        match forwarded {
            Ok(frame) => {
                if self.transport.send(session.peer, frame).await.is_err()
                    && self.router.release(&data.id).await.is_some()
                {
                    // Only synthesize if we actually owned the correlation — a
                    // concurrent `Closed` on the same peer may have already
                    // released it via `purge_session` and replied upstream
                    // itself, and exactly one result may ever be sent per id.
                    self.synthesize_failure(data.id.clone(), "game disconnected unexpectedly")
                        .await;
                }
            }
            Err(err) => {
                self.router.release(&data.id).await;
                warn!(?err, "failed to encode forwarded action");
            }
        }
    }

    /// A relay-wide graceful shutdown request from the agent — distinct
    /// from the per-game `shutdown_game` action. Every live session is told
    /// to shut down and gets its own grace-period timer; the relay signals
    /// termination once the last one closes (spec.md §4.6, §6.2).
    async fn on_upstream_shutdown(&self, envelope: Envelope) {
        let data: GracefulShutdownData = match envelope.data_as() {
            Ok(d) => d,
            Err(err) => {
                warn!(?err, "malformed shutdown/graceful frame from upstream");
                return;
            }
        };
        if !data.wants_shutdown {
            return;
        }

        info!("relay-wide graceful shutdown requested by upstream");
        for (game_id, _) in self.registry.all().await {
            let Some(session) = self.registry.get_by_id(&game_id).await else {
                continue;
            };
            let frame = Envelope::new(protocol::CMD_SHUTDOWN_GRACEFUL)
                .with_game(game_id.clone())
                .with_data(GracefulShutdownData {
                    wants_shutdown: true,
                });
            if let Ok(frame) = frame {
                self.send_or_log(session.peer, frame).await;
            }
            self.timers
                .arm(
                    game_id,
                    session.peer,
                    self.shutdown_timeout,
                    self.transport.clone(),
                    self.registry.clone(),
                )
                .await;
        }
    }

    /// Rebuilds the agent's entire exposed-action view from scratch, purely
    /// from each session's raw catalog — never from the router's own
    /// mapping table, which is the thing being rebuilt (spec.md §4.4).
    async fn on_reregister_all(&self) {
        let mut all_specs = Vec::new();
        for (game_id, _display_name) in self.registry.all().await {
            let Some(session) = self.registry.get_by_id(&game_id).await else {
                continue;
            };
            for action in session.actions.values() {
                match self
                    .router
                    .register(&game_id, &action.name, session.features.multiplexing)
                    .await
                {
                    Ok(exposed) => all_specs.push(protocol::data::ActionSpecData {
                        name: exposed,
                        description: action.description.clone(),
                        schema: action.schema.clone(),
                    }),
                    Err(err) => warn!(?err, "conflict while rebuilding action table"),
                }
            }
        }

        if !all_specs.is_empty()
            && let Ok(frame) = Envelope::new(protocol::CMD_REGISTER_ACTIONS)
                .with_data(RegisterActionsData { actions: all_specs })
        {
            self.send_upstream(frame).await;
        }
        self.refresh_shutdown_game_action().await;
    }

    pub(super) async fn handle_upstream_opened(&self) {
        self.upstream_connected.store(true, Ordering::Release);
        info!("upstream connected");
        self.on_reregister_all().await;
    }

    /// Upstream going away doesn't tear down any downstream session
    /// (spec.md §4.6, §7: "preserve session list until upstream returns").
    /// In-flight correlations can never be answered, but there's no
    /// recipient left to synthesize a failure *to* — they're simply
    /// dropped, and a reconnect re-syncs state via
    /// [`Self::handle_upstream_opened`].
    pub(super) async fn handle_upstream_closed(&self) {
        self.upstream_connected.store(false, Ordering::Release);
        let dropped = self.router.clear_correlations().await;
        warn!(dropped, "upstream disconnected, preserving downstream sessions and action names");
    }
}
