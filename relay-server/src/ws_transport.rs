//! The concrete [`relay_core::Transport`]: downstream peers are axum
//! websocket connections, the single upstream peer is an outbound
//! `tokio-tungstenite` client connection. Both sides speak the same JSON
//! [`protocol::Envelope`] as text frames.

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use protocol::Envelope;
use relay_core::{PeerId, Transport, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

type DownstreamSink = Arc<AsyncMutex<SplitSink<WebSocket, AxumMessage>>>;
type UpstreamSink =
    Arc<AsyncMutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, TungsteniteMessage>>>;

/// Holds whichever sinks are currently live. Downstream peers come and go
/// per-connection; the upstream slot is replaced wholesale on reconnect.
pub struct WsTransport {
    downstream: RwLock<HashMap<PeerId, DownstreamSink>>,
    upstream: RwLock<Option<UpstreamSink>>,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WsTransport {
    pub fn new() -> Self {
        WsTransport {
            downstream: RwLock::new(HashMap::new()),
            upstream: RwLock::new(None),
        }
    }

    pub async fn register_downstream(&self, peer: PeerId, sink: DownstreamSink) {
        self.downstream.write().await.insert(peer, sink);
    }

    pub async fn remove_downstream(&self, peer: PeerId) {
        self.downstream.write().await.remove(&peer);
    }

    pub async fn set_upstream(&self, sink: UpstreamSink) {
        *self.upstream.write().await = Some(sink);
    }

    pub async fn clear_upstream(&self) {
        *self.upstream.write().await = None;
    }
}

impl Transport for WsTransport {
    fn send(
        &self,
        peer: PeerId,
        frame: Envelope,
    ) -> futures_util::future::BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let text = serde_json::to_string(&frame)
                .map_err(|e| TransportError::Io(e.to_string()))?;

            if peer == PeerId::UPSTREAM {
                let guard = self.upstream.read().await;
                let sink = guard.as_ref().ok_or(TransportError::PeerClosed(peer))?;
                let mut sink = sink.lock().await;
                sink.send(TungsteniteMessage::Text(text.into()))
                    .await
                    .map_err(|e| TransportError::Io(e.to_string()))
            } else {
                let guard = self.downstream.read().await;
                let sink = guard.get(&peer).ok_or(TransportError::PeerClosed(peer))?;
                let mut sink = sink.lock().await;
                sink.send(AxumMessage::Text(text.into()))
                    .await
                    .map_err(|e| TransportError::Io(e.to_string()))
            }
        })
    }

    fn close(&self, peer: PeerId) -> futures_util::future::BoxFuture<'_, ()> {
        Box::pin(async move {
            if peer == PeerId::UPSTREAM {
                if let Some(sink) = self.upstream.read().await.as_ref() {
                    let _ = sink.lock().await.close().await;
                }
            } else if let Some(sink) = self.downstream.read().await.get(&peer) {
                let _ = sink.lock().await.close().await;
            }
        })
    }
}
