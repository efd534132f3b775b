//! The Relay Controller (RC) — single coordinator that owns the upstream
//! peer, the Session Registry, and the Namespace Router; implements both
//! protocol state machines, the synthetic `shutdown_game` action, and
//! graceful-shutdown timeouts (spec.md §2, §4.3–§4.6).
//!
//! Split across files by direction, the way the teacher's `relay-server`
//! splits host-side and client-side handling into paired functions within
//! one module: [`downstream`] implements the state machine driven by game
//! peers, [`upstream`] the one driven by the agent, [`shutdown`] the
//! per-game grace-period timers, [`synthetic`] the `shutdown_game` action
//! itself.

mod downstream;
mod shutdown;
mod synthetic;
mod upstream;

use crate::ids::RequestId;
use crate::registry::SessionRegistry;
use crate::router::NamespaceRouter;
use crate::transport::{Transport, TransportEvent};
use protocol::Envelope;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{error, warn};

pub(crate) use shutdown::ShutdownTimers;

/// Tunables the launcher reads from [`RelayConfig`](crate::config) — kept
/// here rather than as loose constructor parameters since the list is
/// expected to grow (e.g. per-version feature tables).
pub struct RelayControllerConfig {
    pub shutdown_timeout: Duration,
    pub nr_version: String,
    pub supported_versions: Vec<String>,
}

impl Default for RelayControllerConfig {
    fn default() -> Self {
        RelayControllerConfig {
            shutdown_timeout: Duration::from_secs(protocol::DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            nr_version: "1".to_string(),
            supported_versions: vec!["1".to_string()],
        }
    }
}

pub struct RelayController {
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    router: NamespaceRouter,
    timers: ShutdownTimers,
    shutdown_timeout: Duration,
    nr_version: String,
    supported_versions: Vec<String>,
    upstream_connected: AtomicBool,
    start_time: Instant,
    terminated: watch::Sender<bool>,
}

impl RelayController {
    pub fn new(transport: Arc<dyn Transport>, config: RelayControllerConfig) -> Arc<Self> {
        let (terminated, _) = watch::channel(false);
        Arc::new(RelayController {
            transport,
            registry: Arc::new(SessionRegistry::new()),
            router: NamespaceRouter::new(),
            timers: ShutdownTimers::new(),
            shutdown_timeout: config.shutdown_timeout,
            nr_version: config.nr_version,
            supported_versions: config.supported_versions,
            upstream_connected: AtomicBool::new(false),
            start_time: Instant::now(),
            terminated,
        })
    }

    /// Fires once when the relay has finished tearing down, for the host
    /// process to observe (spec.md §6.2: "surfaces a relay-terminated event
    /// to its host" rather than calling `process::exit` itself).
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }

    pub fn is_upstream_connected(&self) -> bool {
        self.upstream_connected.load(Ordering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Builds the same payload the wire `nrc-endpoints/health-response`
    /// would, for an operator-facing `/health` route outside the agent
    /// protocol (spec.md §6.2).
    pub async fn health_snapshot(&self) -> protocol::data::HealthResponseData {
        let games = self
            .registry
            .all()
            .await
            .into_iter()
            .map(|(id, display_name)| protocol::data::HealthGameEntry { id, display_name })
            .collect();
        protocol::data::HealthResponseData {
            neuro_backend_connected: self.is_upstream_connected(),
            uptime_seconds: self.uptime().as_secs(),
            games,
        }
    }

    /// Drives both protocol state machines to completion. Returns once
    /// both event streams have closed (the transport layer is gone for
    /// good); the host should treat that as process-lifetime-ending.
    pub async fn run(
        self: Arc<Self>,
        downstream_events: mpsc::Receiver<TransportEvent>,
        upstream_events: mpsc::Receiver<TransportEvent>,
    ) {
        let downstream_task = {
            let this = self.clone();
            tokio::spawn(async move { this.run_downstream(downstream_events).await })
        };
        let upstream_task = {
            let this = self.clone();
            tokio::spawn(async move { this.run_upstream(upstream_events).await })
        };

        let (d, u) = tokio::join!(downstream_task, upstream_task);
        if let Err(err) = d {
            error!(?err, "downstream event loop panicked");
        }
        if let Err(err) = u {
            error!(?err, "upstream event loop panicked");
        }
        let _ = self.terminated.send(true);
    }

    async fn run_downstream(&self, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Opened(_peer) => {
                    // A session isn't created until `startup` arrives; the
                    // raw connect event needs no action.
                }
                TransportEvent::Closed(peer) => self.handle_downstream_closed(peer).await,
                TransportEvent::Frame(peer, envelope) => {
                    self.handle_downstream_frame(peer, envelope).await
                }
            }
        }
    }

    async fn run_upstream(&self, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Opened(_peer) => self.handle_upstream_opened().await,
                TransportEvent::Closed(_peer) => self.handle_upstream_closed().await,
                TransportEvent::Frame(_peer, envelope) => {
                    self.handle_upstream_frame(envelope).await
                }
            }
        }
    }

    /// Sends `frame` to `peer`, logging (never panicking) on failure — the
    /// core treats a transport error as informational, per spec.md §7: the
    /// caller already decided what synthetic follow-up, if any, is needed.
    async fn send_or_log(&self, peer: crate::ids::PeerId, frame: Envelope) {
        if let Err(err) = self.transport.send(peer, frame).await {
            warn!(%peer, ?err, "failed to deliver frame");
        }
    }

    async fn send_upstream(&self, frame: Envelope) {
        self.send_or_log(crate::ids::PeerId::UPSTREAM, frame).await;
    }

    /// Synthesizes an `action/result` reply upstream for a request that
    /// will never get a real answer (spec.md §4.4's correlation invariant).
    async fn synthesize_failure(&self, request_id: RequestId, message: &str) {
        let data = protocol::data::ActionResultData {
            id: request_id,
            success: false,
            message: Some(message.to_string()),
        };
        match Envelope::new(protocol::CMD_ACTION_RESULT).with_data(data) {
            Ok(frame) => self.send_upstream(frame).await,
            Err(err) => error!(?err, "failed to encode synthetic failure result"),
        }
    }
}
