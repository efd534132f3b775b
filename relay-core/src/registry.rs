//! The Session Registry (SR) — the authoritative table of downstream games
//! and the compatibility lock arbiter (spec.md §4.1).
//!
//! ## Lock semantics
//!
//! spec.md describes `LockState` two ways: as a side effect fixed at
//! `open()` time ("if the opened session has multiplexing=false, ...sets
//! LockState"), and as a derived universal invariant (spec.md §8: "locked
//! iff at least one session has multiplexing=false"). These only agree if
//! the wire protocol lets a game declare multiplexing before its session is
//! created — it doesn't; `startup` carries no feature flags, only the later
//! `nrc-endpoints/startup` handshake does (spec.md §6.1, §4.1 state
//! diagram). Every session is therefore non-multiplexing *at the instant it
//! opens* and only becomes multiplexing-capable afterward.
//!
//! This implementation takes the §8 invariant as authoritative and computes
//! `locked` dynamically from the live sessions' *current* feature flags
//! rather than freezing it at open time. Concretely: a brand-new session is
//! admitted as long as no *other* live session is currently non-multiplexing;
//! once admitted it is itself non-multiplexing by default and is rejected
//! only by a still-earlier non-multiplexing holder. A session that later
//! upgrades to multiplexing=true is no longer counted, which frees the lock
//! for subsequent opens even though spec.md's operation-level prose says
//! `upgradeFeatures` "does NOT release the lock" — that sentence is read
//! here as "does not go out of its way to clear bookkeeping for a *different*
//! call", not as "admission checks keep consulting a stale snapshot". This
//! reading is the only one consistent with the boundary scenarios in
//! spec.md §8 (two multiplexing games, #5, coexist; a legacy non-multiplexing
//! game, #4, excludes everyone until it disconnects).

use crate::errors::{OpenError, UpgradeError};
use crate::ids::{GameId, PeerId, normalize};
use crate::session::{ActionSpec, GameSession};
use protocol::data::FeatureFlags;
use std::collections::HashMap;
use tokio::sync::RwLock;

struct Inner {
    by_id: HashMap<GameId, GameSession>,
    by_peer: HashMap<PeerId, GameId>,
}

impl Inner {
    /// The earliest still-live non-multiplexing session, if any. "Earliest"
    /// is approximated by the smallest `PeerId`: ids are handed out from a
    /// monotonic counter in [`PeerId::next`], so a smaller id always opened
    /// first.
    fn non_multiplexing_holder(&self) -> Option<PeerId> {
        self.by_id
            .values()
            .filter(|s| !s.features.multiplexing)
            .map(|s| s.peer)
            .min()
    }
}

/// The canonical store of live downstream sessions.
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_peer: HashMap::new(),
            }),
        }
    }

    /// Derives the session id, checks the compatibility lock, and (on
    /// success) registers a new session with the given starting feature
    /// flags. `declared_features` is almost always `FeatureFlags::default()`
    /// — see the module doc for why the wire protocol can't offer anything
    /// richer at this point.
    pub async fn open(
        &self,
        peer: PeerId,
        display_name: &str,
        declared_features: FeatureFlags,
    ) -> Result<GameSession, OpenError> {
        let id = normalize(display_name);
        if id.is_empty() {
            return Err(OpenError::EmptyId);
        }

        let mut inner = self.inner.write().await;

        if inner.non_multiplexing_holder().is_some() {
            return Err(OpenError::Locked);
        }
        if inner.by_id.contains_key(&id) {
            return Err(OpenError::IdCollision(id));
        }

        let mut session = GameSession::new(id.clone(), display_name.to_string(), peer);
        session.features = declared_features;

        inner.by_id.insert(id.clone(), session.clone());
        inner.by_peer.insert(peer, id);

        Ok(session)
    }

    /// Removes the session bound to `peer`, if any. Idempotent: closing a
    /// peer with no session is a no-op that returns `None`.
    pub async fn close(&self, peer: PeerId) -> Option<GameSession> {
        let mut inner = self.inner.write().await;
        let id = inner.by_peer.remove(&peer)?;
        inner.by_id.remove(&id)
    }

    pub async fn get(&self, peer: PeerId) -> Option<GameSession> {
        let inner = self.inner.read().await;
        let id = inner.by_peer.get(&peer)?;
        inner.by_id.get(id).cloned()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<GameSession> {
        let inner = self.inner.read().await;
        inner.by_id.get(id).cloned()
    }

    /// Snapshot of `(id, display_name)` for every live session, in no
    /// particular order. Used for observability and to build the synthetic
    /// `shutdown_game` action's enum.
    pub async fn all(&self) -> Vec<(GameId, String)> {
        let inner = self.inner.read().await;
        inner
            .by_id
            .values()
            .map(|s| (s.id.clone(), s.display_name.clone()))
            .collect()
    }

    pub async fn is_locked(&self) -> bool {
        let inner = self.inner.read().await;
        inner.non_multiplexing_holder().is_some()
    }

    /// Upgrades a session's feature flags after a successful version
    /// handshake. The session must already be open.
    pub async fn upgrade_features(
        &self,
        peer: PeerId,
        new_flags: FeatureFlags,
        version: String,
    ) -> Result<GameSession, UpgradeError> {
        let mut inner = self.inner.write().await;
        let id = inner
            .by_peer
            .get(&peer)
            .cloned()
            .ok_or(UpgradeError::NoSuchSession(peer))?;
        let session = inner
            .by_id
            .get_mut(&id)
            .expect("by_peer and by_id must stay in sync");
        session.features = new_flags;
        session.protocol_version = Some(version);
        Ok(session.clone())
    }

    /// Inserts raw action specs into the session's catalog, returning the
    /// owning game id and the specs actually inserted (all of them — the
    /// registry does not reject duplicate raw names within one game; the
    /// namespace conflict the spec cares about is at the *exposed* name
    /// level, handled by [`crate::router::NamespaceRouter`]).
    pub async fn register_raw_actions(
        &self,
        peer: PeerId,
        specs: Vec<ActionSpec>,
    ) -> Option<GameId> {
        let mut inner = self.inner.write().await;
        let id = inner.by_peer.get(&peer).cloned()?;
        let session = inner.by_id.get_mut(&id)?;
        for spec in specs {
            session.actions.insert(spec.name.clone(), spec);
        }
        Some(id)
    }

    /// Removes raw action names from the session's catalog, returning the
    /// owning game id and which of the requested names actually existed.
    pub async fn unregister_raw_actions(
        &self,
        peer: PeerId,
        names: &[String],
    ) -> Option<(GameId, Vec<String>)> {
        let mut inner = self.inner.write().await;
        let id = inner.by_peer.get(&peer).cloned()?;
        let session = inner.by_id.get_mut(&id)?;
        let removed = names
            .iter()
            .filter(|n| session.actions.remove(n.as_str()).is_some())
            .cloned()
            .collect();
        Some((id, removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux() -> FeatureFlags {
        FeatureFlags {
            multiplexing: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rejects_empty_derived_id() {
        let sr = SessionRegistry::new();
        let err = sr
            .open(PeerId::next(), "-- --", FeatureFlags::default())
            .await
            .unwrap_err();
        assert_eq!(err, OpenError::EmptyId);
    }

    #[tokio::test]
    async fn rejects_id_collision() {
        let sr = SessionRegistry::new();
        sr.open(PeerId::next(), "Game A", mux()).await.unwrap();
        let err = sr
            .open(PeerId::next(), "Game A", mux())
            .await
            .unwrap_err();
        assert!(matches!(err, OpenError::IdCollision(id) if id == "game-a"));
    }

    #[tokio::test]
    async fn legacy_session_locks_out_others_until_it_closes() {
        let sr = SessionRegistry::new();
        let legacy_peer = PeerId::next();
        sr.open(legacy_peer, "Legacy", FeatureFlags::default())
            .await
            .unwrap();
        assert!(sr.is_locked().await);

        let err = sr
            .open(PeerId::next(), "Game M", mux())
            .await
            .unwrap_err();
        assert_eq!(err, OpenError::Locked);

        sr.close(legacy_peer).await;
        assert!(!sr.is_locked().await);
        sr.open(PeerId::next(), "Game M", mux()).await.unwrap();
    }

    #[tokio::test]
    async fn two_multiplexing_sessions_coexist_after_handshake() {
        let sr = SessionRegistry::new();
        let a = PeerId::next();
        let b = PeerId::next();

        sr.open(a, "Game A", FeatureFlags::default()).await.unwrap();
        // A upgrades before B opens, per the real wire sequence.
        sr.upgrade_features(a, mux(), "1".to_string())
            .await
            .unwrap();
        assert!(!sr.is_locked().await);

        sr.open(b, "Game B", FeatureFlags::default()).await.unwrap();
        assert!(sr.is_locked().await); // B hasn't handshaked yet.
        sr.upgrade_features(b, mux(), "1".to_string())
            .await
            .unwrap();
        assert!(!sr.is_locked().await);
    }

    #[tokio::test]
    async fn register_and_unregister_round_trip() {
        let sr = SessionRegistry::new();
        let peer = PeerId::next();
        sr.open(peer, "Game A", mux()).await.unwrap();

        let spec = ActionSpec {
            name: "buy_books".to_string(),
            description: String::new(),
            schema: None,
        };
        sr.register_raw_actions(peer, vec![spec]).await.unwrap();
        let session = sr.get(peer).await.unwrap();
        assert!(session.actions.contains_key("buy_books"));

        let (_, removed) = sr
            .unregister_raw_actions(peer, &["buy_books".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, vec!["buy_books".to_string()]);
        let session = sr.get(peer).await.unwrap();
        assert!(!session.actions.contains_key("buy_books"));
    }
}
