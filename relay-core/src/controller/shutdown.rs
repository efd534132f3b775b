//! Per-game grace-period timers for the `shutdown_game` sub-protocol
//! (spec.md §4.6): arm one when a `shutdown/graceful` request goes out,
//! cancel it if the game acks in time, otherwise force-close the peer.

use crate::ids::{GameId, PeerId};
use crate::registry::SessionRegistry;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tracing::info;

pub(crate) struct ShutdownTimers {
    active: Mutex<HashMap<GameId, oneshot::Sender<()>>>,
}

impl ShutdownTimers {
    pub fn new() -> Self {
        ShutdownTimers {
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Starts (or restarts) the grace-period countdown for `game_id`. If the
    /// timer fires before [`cancel`](Self::cancel) is called, the peer is
    /// force-closed — but only if it's still the same live session, so a
    /// disconnect-then-reconnect under the same id within the window can't
    /// get its new connection killed by a stale timer (spec.md §4.6 edge
    /// case).
    pub async fn arm(
        &self,
        game_id: GameId,
        peer: PeerId,
        duration: Duration,
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
    ) {
        let (tx, rx) = oneshot::channel();
        {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.insert(game_id.clone(), tx) {
                let _ = previous.send(());
            }
        }

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    if let Some(session) = registry.get(peer).await
                        && session.id == game_id
                    {
                        info!(%game_id, %peer, "shutdown grace period elapsed, closing peer");
                        transport.close(peer).await;
                    }
                }
                _ = rx => {
                    info!(%game_id, "shutdown acknowledged, timer cancelled");
                }
            }
        });
    }

    /// Cancels the timer for `game_id`, if one is running. Returns whether
    /// a timer was actually found (used to ignore stray `shutdown/ready`
    /// acks with no matching request).
    pub async fn cancel(&self, game_id: &str) -> bool {
        let mut active = self.active.lock().await;
        match active.remove(game_id) {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use futures_util::future::BoxFuture;
    use protocol::Envelope;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTransport {
        closes: AtomicUsize,
    }

    impl Transport for CountingTransport {
        fn send(&self, _peer: PeerId, _frame: Envelope) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }
        fn close(&self, _peer: PeerId) -> BoxFuture<'_, ()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn fires_close_after_duration_elapses() {
        let timers = ShutdownTimers::new();
        let registry = Arc::new(SessionRegistry::new());
        let peer = PeerId::next();
        registry
            .open(peer, "Game A", Default::default())
            .await
            .unwrap();
        let transport = Arc::new(CountingTransport {
            closes: AtomicUsize::new(0),
        });

        timers
            .arm(
                "game-a".to_string(),
                peer,
                Duration::from_millis(10),
                transport.clone(),
                registry,
            )
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_prevents_close() {
        let timers = ShutdownTimers::new();
        let registry = Arc::new(SessionRegistry::new());
        let peer = PeerId::next();
        registry
            .open(peer, "Game A", Default::default())
            .await
            .unwrap();
        let transport = Arc::new(CountingTransport {
            closes: AtomicUsize::new(0),
        });

        timers
            .arm(
                "game-a".to_string(),
                peer,
                Duration::from_millis(30),
                transport.clone(),
                registry,
            )
            .await;
        assert!(timers.cancel("game-a").await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_on_unknown_game_returns_false() {
        let timers = ShutdownTimers::new();
        assert!(!timers.cancel("no-such-game").await);
    }
}
