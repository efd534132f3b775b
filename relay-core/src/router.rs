//! The Namespace Router (NR) — bijective action-name rewriting and request
//! correlation (spec.md §4.2).

use crate::errors::{BindError, RegisterError};
use crate::ids::{GameId, RequestId};
use protocol::ACTION_NAME_SEP;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};

/// Builds the exposed name for a raw action under the given game, per
/// spec.md §3: prefixed with `<gameId><SEP>` when multiplexing is enabled
/// for the session, identical to the raw name otherwise.
pub fn exposed_name(game_id: &str, raw_name: &str, multiplexing: bool) -> String {
    if multiplexing {
        format!("{game_id}{ACTION_NAME_SEP}{raw_name}")
    } else {
        raw_name.to_string()
    }
}

#[derive(Clone)]
struct NameEntry {
    game_id: GameId,
    raw_name: String,
}

/// Bijective name mapping and request correlation tables.
pub struct NamespaceRouter {
    names: RwLock<HashMap<String, NameEntry>>,
    correlations: Mutex<HashMap<RequestId, GameId>>,
}

impl Default for NamespaceRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceRouter {
    pub fn new() -> Self {
        NamespaceRouter {
            names: RwLock::new(HashMap::new()),
            correlations: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `raw_name` under `game_id`, returning the exposed form.
    /// Rejects with [`RegisterError::NameConflict`] if the exposed name is
    /// already owned by a *different* game (spec.md §9.5: reject the second
    /// registrant). Re-registering the same raw name for the same game that
    /// already owns it is a harmless no-op that returns the same exposed
    /// name.
    pub async fn register(
        &self,
        game_id: &str,
        raw_name: &str,
        multiplexing: bool,
    ) -> Result<String, RegisterError> {
        let exposed = exposed_name(game_id, raw_name, multiplexing);
        let mut names = self.names.write().await;
        if let Some(existing) = names.get(&exposed)
            && existing.game_id != game_id
        {
            return Err(RegisterError::NameConflict {
                exposed,
                owner: existing.game_id.clone(),
            });
        }
        names.insert(
            exposed.clone(),
            NameEntry {
                game_id: game_id.to_string(),
                raw_name: raw_name.to_string(),
            },
        );
        Ok(exposed)
    }

    /// Removes the mapping for `raw_name` under `game_id` if it exists and
    /// is owned by that game, returning the exposed name that was removed.
    pub async fn unregister(
        &self,
        game_id: &str,
        raw_name: &str,
        multiplexing: bool,
    ) -> Option<String> {
        let exposed = exposed_name(game_id, raw_name, multiplexing);
        let mut names = self.names.write().await;
        match names.get(&exposed) {
            Some(entry) if entry.game_id == game_id => {
                names.remove(&exposed);
                Some(exposed)
            }
            _ => None,
        }
    }

    /// Reverse lookup: which game currently owns this exposed name.
    pub async fn resolve(&self, exposed_name: &str) -> Option<GameId> {
        let names = self.names.read().await;
        names.get(exposed_name).map(|e| e.game_id.clone())
    }

    /// Reverse lookup including the owning game's raw name for the action,
    /// used by the upstream-facing state machine to find what to send
    /// downstream.
    pub async fn resolve_raw(&self, exposed_name: &str) -> Option<(GameId, String)> {
        let names = self.names.read().await;
        names
            .get(exposed_name)
            .map(|e| (e.game_id.clone(), e.raw_name.clone()))
    }

    /// Records that `request_id` is in flight to `game_id`. Rejects a
    /// duplicate in-flight id rather than overwriting it, so the original
    /// request's eventual result still resolves correctly.
    pub async fn bind(&self, request_id: &str, game_id: GameId) -> Result<(), BindError> {
        let mut correlations = self.correlations.lock().await;
        if correlations.contains_key(request_id) {
            return Err(BindError::DuplicateRequest(request_id.to_string()));
        }
        correlations.insert(request_id.to_string(), game_id);
        Ok(())
    }

    /// Removes and returns the correlation for `request_id`, if any.
    pub async fn release(&self, request_id: &str) -> Option<GameId> {
        let mut correlations = self.correlations.lock().await;
        correlations.remove(request_id)
    }

    /// Drops every in-flight request correlation, regardless of owning
    /// game, and returns how many were dropped. Used when the upstream
    /// connection itself disappears (spec.md §4.6): there is no recipient
    /// left to synthesize a failure to, so the entries are simply cleared
    /// rather than released one at a time. Action name mappings are left
    /// untouched — the downstream sessions that own them are still alive.
    pub async fn clear_correlations(&self) -> usize {
        let mut correlations = self.correlations.lock().await;
        let count = correlations.len();
        correlations.clear();
        count
    }

    /// Removes every `ActionNameMap` entry owned by `game_id` and every
    /// `RequestCorrelation` entry pointing at it. Returns the released
    /// request ids so the caller (the Relay Controller) can synthesize an
    /// upstream failure result for each — NR itself never sends traffic.
    pub async fn purge_session(&self, game_id: &str) -> Vec<RequestId> {
        {
            let mut names = self.names.write().await;
            names.retain(|_, entry| entry.game_id != game_id);
        }
        let mut correlations = self.correlations.lock().await;
        let released: Vec<RequestId> = correlations
            .iter()
            .filter(|(_, g)| g.as_str() == game_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &released {
            correlations.remove(id);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposed_name_prefixes_only_when_multiplexing() {
        assert_eq!(exposed_name("game-a", "buy_books", true), "game-a--buy_books");
        assert_eq!(exposed_name("game-a", "buy_books", false), "buy_books");
    }

    #[tokio::test]
    async fn register_then_resolve_always_succeeds() {
        let nr = NamespaceRouter::new();
        let exposed = nr.register("game-a", "buy_books", true).await.unwrap();
        assert_eq!(nr.resolve(&exposed).await, Some("game-a".to_string()));
    }

    #[tokio::test]
    async fn unregister_then_resolve_always_misses() {
        let nr = NamespaceRouter::new();
        let exposed = nr.register("game-a", "buy_books", true).await.unwrap();
        nr.unregister("game-a", "buy_books", true).await;
        assert_eq!(nr.resolve(&exposed).await, None);
    }

    #[tokio::test]
    async fn second_registrant_conflict_is_rejected() {
        let nr = NamespaceRouter::new();
        nr.register("game-a", "shared_name", false).await.unwrap();
        let err = nr.register("game-b", "shared_name", false).await.unwrap_err();
        assert!(matches!(err, RegisterError::NameConflict { .. }));
    }

    #[tokio::test]
    async fn duplicate_request_id_is_rejected_without_disturbing_the_original() {
        let nr = NamespaceRouter::new();
        nr.bind("r2", "game-a".to_string()).await.unwrap();
        let err = nr.bind("r2", "game-b".to_string()).await.unwrap_err();
        assert!(matches!(err, BindError::DuplicateRequest(id) if id == "r2"));
        assert_eq!(nr.resolve_raw("r2").await, None); // resolve_raw is for names, not correlations
        assert_eq!(nr.release("r2").await, Some("game-a".to_string()));
    }

    #[tokio::test]
    async fn purge_session_drops_names_and_returns_released_requests() {
        let nr = NamespaceRouter::new();
        let exposed = nr.register("game-a", "buy_books", true).await.unwrap();
        nr.bind("r1", "game-a".to_string()).await.unwrap();
        nr.bind("r2", "game-b".to_string()).await.unwrap();

        let released = nr.purge_session("game-a").await;
        assert_eq!(released, vec!["r1".to_string()]);
        assert_eq!(nr.resolve(&exposed).await, None);
        assert_eq!(nr.release("r2").await, Some("game-b".to_string()));
    }
}
