//! The transport-agnostic relay core: Session Registry, Namespace Router,
//! Relay Controller, and the Transport Abstraction they're built against
//! (spec.md §2). Nothing in this crate knows about websockets, axum, or
//! process lifetime — that's `relay-server`'s job.

pub mod controller;
pub mod errors;
pub mod ids;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;

pub use controller::{RelayController, RelayControllerConfig};
pub use ids::{GameId, PeerId, RequestId};
pub use registry::SessionRegistry;
pub use router::NamespaceRouter;
pub use session::{ActionSpec, GameSession};
pub use transport::{Transport, TransportError, TransportEvent};
