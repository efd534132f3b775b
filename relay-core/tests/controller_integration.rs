//! End-to-end tests for [`relay_core::RelayController`] driven entirely
//! through its public event-channel interface and a mock [`Transport`],
//! covering the boundary scenarios in spec.md §8.

use futures_util::future::BoxFuture;
use protocol::data::{
    ActionData, ActionResultData, ActionSpecData, HealthResponseData, RegisterActionsData,
    ShutdownGameArgs, VersionHandshakeData,
};
use protocol::{
    CMD_ACTION, CMD_ACTION_RESULT, CMD_HEALTH, CMD_HEALTH_RESPONSE, CMD_REGISTER_ACTIONS,
    CMD_RELAY_LOCKED, CMD_SHUTDOWN_ACK, CMD_SHUTDOWN_GRACEFUL, CMD_STARTUP, CMD_VERSION_HANDSHAKE,
    Envelope, SHUTDOWN_GAME_ACTION,
};
use relay_core::{PeerId, RelayController, RelayControllerConfig, Transport, TransportError, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

struct MockTransport {
    sent: Mutex<Vec<(PeerId, Envelope)>>,
    closed: Mutex<Vec<PeerId>>,
    fail_sends_to: Mutex<Vec<PeerId>>,
}

impl MockTransport {
    fn new() -> Self {
        MockTransport {
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            fail_sends_to: Mutex::new(Vec::new()),
        }
    }

    async fn sent_matching(&self, peer: PeerId, command: &str) -> Vec<Envelope> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(p, e)| *p == peer && e.command == command)
            .map(|(_, e)| e.clone())
            .collect()
    }

    async fn was_closed(&self, peer: PeerId) -> bool {
        self.closed.lock().await.contains(&peer)
    }

    /// Makes every future `send` to `peer` fail, to simulate a peer that
    /// disconnected out from under an in-flight forward.
    async fn fail_sends_to(&self, peer: PeerId) {
        self.fail_sends_to.lock().await.push(peer);
    }
}

impl Transport for MockTransport {
    fn send(&self, peer: PeerId, frame: Envelope) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.fail_sends_to.lock().await.contains(&peer) {
                return Err(TransportError::PeerClosed(peer));
            }
            self.sent.lock().await.push((peer, frame));
            Ok(())
        })
    }

    fn close(&self, peer: PeerId) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.lock().await.push(peer);
        })
    }
}

/// Gives the controller's two event-loop tasks a chance to drain whatever
/// was just sent before the test inspects the mock transport.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

fn harness(
    shutdown_timeout: Duration,
) -> (
    Arc<RelayController>,
    Arc<MockTransport>,
    mpsc::Sender<TransportEvent>,
    mpsc::Sender<TransportEvent>,
) {
    let transport = Arc::new(MockTransport::new());
    let (down_tx, down_rx) = mpsc::channel(64);
    let (up_tx, up_rx) = mpsc::channel(64);
    let controller = RelayController::new(
        transport.clone() as Arc<dyn Transport>,
        RelayControllerConfig {
            shutdown_timeout,
            ..Default::default()
        },
    );
    tokio::spawn(controller.clone().run(down_rx, up_rx));
    (controller, transport, down_tx, up_tx)
}

async fn open_and_handshake(down_tx: &mpsc::Sender<TransportEvent>, peer: PeerId, display_name: &str) {
    down_tx
        .send(TransportEvent::Frame(
            peer,
            Envelope::new(CMD_STARTUP).with_game(display_name),
        ))
        .await
        .unwrap();
    settle().await;
    down_tx
        .send(TransportEvent::Frame(
            peer,
            Envelope::new(CMD_VERSION_HANDSHAKE)
                .with_data(VersionHandshakeData {
                    nr_version: "1".to_string(),
                })
                .unwrap(),
        ))
        .await
        .unwrap();
    settle().await;
}

async fn register_action(down_tx: &mpsc::Sender<TransportEvent>, peer: PeerId, raw_name: &str) {
    down_tx
        .send(TransportEvent::Frame(
            peer,
            Envelope::new(CMD_REGISTER_ACTIONS)
                .with_data(RegisterActionsData {
                    actions: vec![ActionSpecData {
                        name: raw_name.to_string(),
                        description: String::new(),
                        schema: None,
                    }],
                })
                .unwrap(),
        ))
        .await
        .unwrap();
    settle().await;
}

fn upstream_action(id: &str, name: &str, data: &str) -> Envelope {
    Envelope::new(CMD_ACTION)
        .with_data(ActionData {
            id: id.to_string(),
            name: name.to_string(),
            data: data.to_string(),
        })
        .unwrap()
}

#[tokio::test]
async fn multiplex_register_and_execute_round_trips() {
    let (_controller, transport, down_tx, up_tx) = harness(Duration::from_secs(5));
    let peer_a = PeerId::next();

    open_and_handshake(&down_tx, peer_a, "Game A").await;
    register_action(&down_tx, peer_a, "buy_books").await;

    up_tx.send(TransportEvent::Opened(PeerId::UPSTREAM)).await.unwrap();
    settle().await;

    up_tx
        .send(TransportEvent::Frame(
            PeerId::UPSTREAM,
            upstream_action("r1", "game-a--buy_books", "{\"n\":2}"),
        ))
        .await
        .unwrap();
    settle().await;

    let to_a = transport.sent_matching(peer_a, CMD_ACTION).await;
    let received: ActionData = to_a.last().expect("A should receive the action").data_as().unwrap();
    assert_eq!(received.id, "r1");
    assert_eq!(received.name, "buy_books");
    assert_eq!(received.data, "{\"n\":2}");

    down_tx
        .send(TransportEvent::Frame(
            peer_a,
            Envelope::new(CMD_ACTION_RESULT)
                .with_data(ActionResultData {
                    id: "r1".to_string(),
                    success: true,
                    message: None,
                })
                .unwrap(),
        ))
        .await
        .unwrap();
    settle().await;

    let to_upstream = transport.sent_matching(PeerId::UPSTREAM, CMD_ACTION_RESULT).await;
    let result: ActionResultData = to_upstream
        .iter()
        .find_map(|e| {
            let d: ActionResultData = e.data_as().ok()?;
            (d.id == "r1").then_some(d)
        })
        .expect("upstream should see exactly one result for r1");
    assert!(result.success);
}

#[tokio::test]
async fn mid_request_disconnect_synthesizes_session_terminated_once() {
    let (_controller, transport, down_tx, up_tx) = harness(Duration::from_secs(5));
    let peer_a = PeerId::next();

    open_and_handshake(&down_tx, peer_a, "Game A").await;
    register_action(&down_tx, peer_a, "buy_books").await;

    up_tx.send(TransportEvent::Opened(PeerId::UPSTREAM)).await.unwrap();
    settle().await;
    up_tx
        .send(TransportEvent::Frame(
            PeerId::UPSTREAM,
            upstream_action("r1", "game-a--buy_books", "{}"),
        ))
        .await
        .unwrap();
    settle().await;

    down_tx.send(TransportEvent::Closed(peer_a)).await.unwrap();
    settle().await;

    let to_upstream = transport.sent_matching(PeerId::UPSTREAM, CMD_ACTION_RESULT).await;
    let matching: Vec<ActionResultData> = to_upstream
        .iter()
        .filter_map(|e| e.data_as::<ActionResultData>().ok())
        .filter(|d| d.id == "r1")
        .collect();
    assert_eq!(matching.len(), 1, "exactly one result for r1, never zero or two");
    assert!(!matching[0].success);
    assert_eq!(matching[0].message.as_deref(), Some("session terminated"));

    // A straggler result from the now-closed peer must not produce a second reply.
    down_tx
        .send(TransportEvent::Frame(
            peer_a,
            Envelope::new(CMD_ACTION_RESULT)
                .with_data(ActionResultData {
                    id: "r1".to_string(),
                    success: true,
                    message: None,
                })
                .unwrap(),
        ))
        .await
        .unwrap();
    settle().await;

    let after = transport.sent_matching(PeerId::UPSTREAM, CMD_ACTION_RESULT).await;
    let still_matching: Vec<ActionResultData> = after
        .iter()
        .filter_map(|e| e.data_as::<ActionResultData>().ok())
        .filter(|d| d.id == "r1")
        .collect();
    assert_eq!(still_matching.len(), 1, "late straggler must not duplicate the result");
}

/// A forward whose `transport.send` fails races the downstream `Closed`
/// handler for the same peer — both paths call `router.release` on the same
/// `request_id`, and only one of them may win and synthesize a failure.
#[tokio::test]
async fn forward_send_failure_racing_peer_close_synthesizes_exactly_one_result() {
    let (_controller, transport, down_tx, up_tx) = harness(Duration::from_secs(5));
    let peer_a = PeerId::next();

    open_and_handshake(&down_tx, peer_a, "Game A").await;
    register_action(&down_tx, peer_a, "buy_books").await;

    up_tx.send(TransportEvent::Opened(PeerId::UPSTREAM)).await.unwrap();
    settle().await;

    // From this point on, any attempt to forward to peer_a fails — simulating
    // a peer that dropped its connection right as a send was in flight.
    transport.fail_sends_to(peer_a).await;

    up_tx
        .send(TransportEvent::Frame(
            PeerId::UPSTREAM,
            upstream_action("r1", "game-a--buy_books", "{}"),
        ))
        .await
        .unwrap();
    down_tx.send(TransportEvent::Closed(peer_a)).await.unwrap();
    settle().await;

    let to_upstream = transport.sent_matching(PeerId::UPSTREAM, CMD_ACTION_RESULT).await;
    let matching: Vec<ActionResultData> = to_upstream
        .iter()
        .filter_map(|e| e.data_as::<ActionResultData>().ok())
        .filter(|d| d.id == "r1")
        .collect();
    assert_eq!(
        matching.len(),
        1,
        "a failing forward racing a session close must synthesize exactly one result"
    );
    assert!(!matching[0].success);
}

#[tokio::test]
async fn duplicate_upstream_request_id_is_rejected_without_disturbing_the_original() {
    let (_controller, transport, down_tx, up_tx) = harness(Duration::from_secs(5));
    let peer_a = PeerId::next();
    let peer_b = PeerId::next();

    open_and_handshake(&down_tx, peer_a, "Game A").await;
    register_action(&down_tx, peer_a, "act_a").await;
    open_and_handshake(&down_tx, peer_b, "Game B").await;
    register_action(&down_tx, peer_b, "act_b").await;

    up_tx.send(TransportEvent::Opened(PeerId::UPSTREAM)).await.unwrap();
    settle().await;

    up_tx
        .send(TransportEvent::Frame(
            PeerId::UPSTREAM,
            upstream_action("r2", "game-a--act_a", ""),
        ))
        .await
        .unwrap();
    settle().await;
    up_tx
        .send(TransportEvent::Frame(
            PeerId::UPSTREAM,
            upstream_action("r2", "game-b--act_b", ""),
        ))
        .await
        .unwrap();
    settle().await;

    assert_eq!(transport.sent_matching(peer_a, CMD_ACTION).await.len(), 1);
    assert_eq!(
        transport.sent_matching(peer_b, CMD_ACTION).await.len(),
        0,
        "the duplicate id must never reach B"
    );

    let failures = transport.sent_matching(PeerId::UPSTREAM, CMD_ACTION_RESULT).await;
    let duplicate = failures
        .iter()
        .filter_map(|e| e.data_as::<ActionResultData>().ok())
        .find(|d| d.id == "r2" && !d.success)
        .expect("upstream sees a failure for the duplicate r2");
    assert_eq!(duplicate.message.as_deref(), Some("duplicate request"));
}

#[tokio::test]
async fn unknown_action_name_fails_upstream_without_downstream_traffic() {
    let (_controller, transport, _down_tx, up_tx) = harness(Duration::from_secs(5));

    up_tx.send(TransportEvent::Opened(PeerId::UPSTREAM)).await.unwrap();
    settle().await;
    up_tx
        .send(TransportEvent::Frame(
            PeerId::UPSTREAM,
            upstream_action("r9", "nobody--owns_this", ""),
        ))
        .await
        .unwrap();
    settle().await;

    let failures = transport.sent_matching(PeerId::UPSTREAM, CMD_ACTION_RESULT).await;
    let failure = failures
        .iter()
        .filter_map(|e| e.data_as::<ActionResultData>().ok())
        .find(|d| d.id == "r9")
        .expect("an unresolvable action name still gets exactly one reply");
    assert!(!failure.success);
    assert_eq!(failure.message.as_deref(), Some("unknown action"));
}

#[tokio::test]
async fn synthetic_shutdown_game_enum_tracks_live_games_and_grace_timer_force_closes() {
    let (_controller, transport, down_tx, up_tx) = harness(Duration::from_millis(50));
    let peer_a = PeerId::next();
    let peer_b = PeerId::next();

    open_and_handshake(&down_tx, peer_a, "Game A").await;
    open_and_handshake(&down_tx, peer_b, "Game B").await;

    up_tx.send(TransportEvent::Opened(PeerId::UPSTREAM)).await.unwrap();
    settle().await;

    let registers = transport.sent_matching(PeerId::UPSTREAM, CMD_REGISTER_ACTIONS).await;
    let shutdown_spec = registers
        .iter()
        .rev()
        .find_map(|e| {
            let d: RegisterActionsData = e.data_as().ok()?;
            d.actions.into_iter().find(|a| a.name == SHUTDOWN_GAME_ACTION)
        })
        .expect("shutdown_game is registered upstream once games are open");
    let schema = shutdown_spec.schema.expect("shutdown_game carries an enum schema");
    let enum_ids: Vec<String> = schema["properties"]["game_id"]["enum"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(enum_ids.contains(&"game-a".to_string()));
    assert!(enum_ids.contains(&"game-b".to_string()));

    up_tx
        .send(TransportEvent::Frame(
            PeerId::UPSTREAM,
            upstream_action(
                "s1",
                SHUTDOWN_GAME_ACTION,
                &serde_json::to_string(&ShutdownGameArgs {
                    game_id: "game-a".to_string(),
                })
                .unwrap(),
            ),
        ))
        .await
        .unwrap();
    settle().await;

    assert_eq!(transport.sent_matching(peer_a, CMD_SHUTDOWN_GRACEFUL).await.len(), 1);
    let s1_result = transport
        .sent_matching(PeerId::UPSTREAM, CMD_ACTION_RESULT)
        .await
        .iter()
        .filter_map(|e| e.data_as::<ActionResultData>().ok())
        .find(|d| d.id == "s1")
        .expect("shutdown_game always replies immediately");
    assert!(s1_result.success);

    // A never acks; the grace period elapses and the relay force-closes it.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(transport.was_closed(peer_a).await);

    down_tx.send(TransportEvent::Closed(peer_a)).await.unwrap();
    settle().await;

    let registers_after = transport.sent_matching(PeerId::UPSTREAM, CMD_REGISTER_ACTIONS).await;
    let refreshed = registers_after
        .iter()
        .rev()
        .find_map(|e| {
            let d: RegisterActionsData = e.data_as().ok()?;
            d.actions.into_iter().find(|a| a.name == SHUTDOWN_GAME_ACTION)
        })
        .expect("enum is refreshed again on close");
    let ids_after: Vec<String> = refreshed.schema.unwrap()["properties"]["game_id"]["enum"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(!ids_after.contains(&"game-a".to_string()));
    assert!(ids_after.contains(&"game-b".to_string()));
}

#[tokio::test]
async fn shutdown_ack_cancels_the_grace_timer() {
    let (_controller, transport, down_tx, up_tx) = harness(Duration::from_millis(50));
    let peer_a = PeerId::next();

    open_and_handshake(&down_tx, peer_a, "Game A").await;
    up_tx.send(TransportEvent::Opened(PeerId::UPSTREAM)).await.unwrap();
    settle().await;

    up_tx
        .send(TransportEvent::Frame(
            PeerId::UPSTREAM,
            upstream_action(
                "s2",
                SHUTDOWN_GAME_ACTION,
                &serde_json::to_string(&ShutdownGameArgs {
                    game_id: "game-a".to_string(),
                })
                .unwrap(),
            ),
        ))
        .await
        .unwrap();
    settle().await;

    down_tx
        .send(TransportEvent::Frame(peer_a, Envelope::new(CMD_SHUTDOWN_ACK)))
        .await
        .unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        !transport.was_closed(peer_a).await,
        "an acknowledged shutdown must not be force-closed"
    );
}

#[tokio::test]
async fn shutdown_game_for_unknown_id_fails_upstream_and_touches_no_session() {
    let (_controller, transport, down_tx, up_tx) = harness(Duration::from_secs(5));
    let peer_a = PeerId::next();
    open_and_handshake(&down_tx, peer_a, "Game A").await;

    up_tx.send(TransportEvent::Opened(PeerId::UPSTREAM)).await.unwrap();
    settle().await;
    up_tx
        .send(TransportEvent::Frame(
            PeerId::UPSTREAM,
            upstream_action(
                "s3",
                SHUTDOWN_GAME_ACTION,
                &serde_json::to_string(&ShutdownGameArgs {
                    game_id: "no-such-game".to_string(),
                })
                .unwrap(),
            ),
        ))
        .await
        .unwrap();
    settle().await;

    assert_eq!(transport.sent_matching(peer_a, CMD_SHUTDOWN_GRACEFUL).await.len(), 0);
    let result = transport
        .sent_matching(PeerId::UPSTREAM, CMD_ACTION_RESULT)
        .await
        .iter()
        .filter_map(|e| e.data_as::<ActionResultData>().ok())
        .find(|d| d.id == "s3")
        .expect("unknown game still gets a reply");
    assert!(!result.success);
    assert_eq!(result.message.as_deref(), Some("no such game"));
}

#[tokio::test]
async fn lock_admission_end_to_end() {
    let (_controller, transport, down_tx, _up_tx) = harness(Duration::from_secs(5));
    let peer_l = PeerId::next();
    let peer_m = PeerId::next();

    down_tx
        .send(TransportEvent::Frame(peer_l, Envelope::new(CMD_STARTUP).with_game("Legacy")))
        .await
        .unwrap();
    settle().await;

    down_tx
        .send(TransportEvent::Frame(peer_m, Envelope::new(CMD_STARTUP).with_game("Game M")))
        .await
        .unwrap();
    settle().await;
    assert_eq!(transport.sent_matching(peer_m, CMD_RELAY_LOCKED).await.len(), 1);

    down_tx.send(TransportEvent::Closed(peer_l)).await.unwrap();
    settle().await;

    down_tx
        .send(TransportEvent::Frame(peer_m, Envelope::new(CMD_STARTUP).with_game("Game M")))
        .await
        .unwrap();
    settle().await;
    // Still exactly one rejection ever — the retry after L leaves succeeds.
    assert_eq!(transport.sent_matching(peer_m, CMD_RELAY_LOCKED).await.len(), 1);

    down_tx
        .send(TransportEvent::Frame(peer_m, Envelope::new(CMD_HEALTH)))
        .await
        .unwrap();
    settle().await;
    let health = transport.sent_matching(peer_m, CMD_HEALTH_RESPONSE).await;
    let response: HealthResponseData = health.last().unwrap().data_as().unwrap();
    assert!(response.games.iter().any(|g| g.id == "game-m"));
}

#[tokio::test]
async fn health_include_narrows_the_response_to_the_requested_fields() {
    let (_controller, transport, down_tx, _up_tx) = harness(Duration::from_secs(5));
    let peer_a = PeerId::next();
    open_and_handshake(&down_tx, peer_a, "Game A").await;

    down_tx
        .send(TransportEvent::Frame(
            peer_a,
            Envelope::new(CMD_HEALTH)
                .with_data(serde_json::json!({"include": ["games"]}))
                .unwrap(),
        ))
        .await
        .unwrap();
    settle().await;

    let health = transport.sent_matching(peer_a, CMD_HEALTH_RESPONSE).await;
    let raw = health.last().unwrap().data.clone().unwrap();
    let obj = raw.as_object().unwrap();
    assert!(obj.contains_key("games"));
    assert!(!obj.contains_key("neuro-backend-connected"));
    assert!(!obj.contains_key("uptime-seconds"));
}
