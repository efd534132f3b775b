//! Typed error taxonomy (spec.md §7). Each kind maps to exactly one admission
//! or routing failure path; transport-level and invariant failures are
//! handled inline where they occur rather than threaded through `Result`
//! (see `relay-core::transport::TransportError` for the former).

use crate::ids::{GameId, PeerId, RequestId};
use thiserror::Error;

/// Failures from [`crate::registry::SessionRegistry::open`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OpenError {
    /// The derived id normalized to the empty string.
    #[error("display name normalized to an empty session id")]
    EmptyId,
    /// Another, non-multiplexing session already holds the relay lock.
    #[error("relay is locked by another session")]
    Locked,
    /// A live session already has this derived id.
    #[error("a session with id {0:?} already exists")]
    IdCollision(GameId),
}

/// Failures from [`crate::registry::SessionRegistry::upgrade_features`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpgradeError {
    /// The peer has no open session to upgrade.
    #[error("no open session for {0}")]
    NoSuchSession(PeerId),
    /// The declared `nr-version` is not one this relay understands.
    #[error("unsupported protocol version {requested:?}")]
    UnsupportedVersion {
        requested: String,
        supported: Vec<String>,
        suggested: String,
    },
}

/// Failures from [`crate::router::NamespaceRouter::register`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// The exposed name is already owned by a different game.
    #[error("exposed action name {exposed:?} already registered to {owner:?}")]
    NameConflict { exposed: String, owner: GameId },
}

/// Failures from [`crate::router::NamespaceRouter::bind`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BindError {
    /// Another live request is already using this id.
    #[error("request id {0:?} is already bound")]
    DuplicateRequest(RequestId),
}
