//! The Transport Abstraction (TA) — the thin interface the core requires
//! from whatever moves bytes (spec.md §2, §6.1's "out of scope" transport
//! layer). The relay binary's websocket wiring is the concrete
//! implementation; the core only ever sees this trait and
//! [`TransportEvent`].

use crate::ids::PeerId;
use futures_util::future::BoxFuture;
use protocol::Envelope;
use thiserror::Error;

/// Transport-level failures (spec.md §7, kind 1): always recoverable by the
/// caller, which synthesizes a result and moves on.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    PeerClosed(PeerId),
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// What the Relay Controller observes from a transport: a peer connecting,
/// a peer disconnecting, or an inbound frame. Delivery within one peer's
/// stream of events is ordered; no ordering is implied across peers
/// (spec.md §5).
#[derive(Debug)]
pub enum TransportEvent {
    Opened(PeerId),
    Closed(PeerId),
    Frame(PeerId, Envelope),
}

/// The seam between `relay-core` and whatever moves bytes on the wire.
///
/// Implementations must serialize concurrent `send` calls for the *same*
/// peer themselves if their underlying sink isn't safe for concurrent
/// writers (spec.md §5) — the core calls `send` from at most one task per
/// peer at a time for downstream peers, but the single upstream peer may be
/// written to concurrently from several logical call sites (a forwarded
/// action result, a re-register, a synthetic failure), so upstream
/// implementations in particular must serialize internally.
pub trait Transport: Send + Sync {
    fn send(&self, peer: PeerId, frame: Envelope) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Forcibly closes a peer. Used for the shutdown-timer deadline and for
    /// upstream-triggered teardown. Never fails observably — a transport
    /// that can't close a peer should just drop the event, the caller only
    /// cares that no further frames arrive from it.
    fn close(&self, peer: PeerId) -> BoxFuture<'_, ()>;
}
