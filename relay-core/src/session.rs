//! Per-downstream-peer state (spec.md §3 `GameSession` / `ActionSpec`).

use crate::ids::{GameId, PeerId};
use protocol::data::FeatureFlags;
use std::collections::HashMap;

/// A raw (unprefixed) action as registered by a downstream game.
/// Immutable once registered: a replacement is unregister+register, never
/// an in-place mutation (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    pub schema: Option<serde_json::Value>,
}

/// Everything the registry knows about one connected game.
#[derive(Debug, Clone)]
pub struct GameSession {
    pub id: GameId,
    pub display_name: String,
    pub peer: PeerId,
    pub features: FeatureFlags,
    pub protocol_version: Option<String>,
    /// Keyed by raw (unprefixed) action name.
    pub actions: HashMap<String, ActionSpec>,
}

impl GameSession {
    pub(crate) fn new(id: GameId, display_name: String, peer: PeerId) -> Self {
        GameSession {
            id,
            display_name,
            peer,
            features: FeatureFlags::default(),
            protocol_version: None,
            actions: HashMap::new(),
        }
    }
}
