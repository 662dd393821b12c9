use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use warp::ws::Message;

use chat_relay::auth::{TokenManager, TokenVerifier};
use chat_relay::core::{ConnectionId, ConnectionRoomEngine, Directive, PresenceTracker};

const TEST_SECRET: &str = "engine-test-secret";

fn build_engine(heartbeat_timeout: Duration) -> (Arc<ConnectionRoomEngine>, Arc<PresenceTracker>) {
    let presence = Arc::new(PresenceTracker::new());
    let tokens: Arc<dyn TokenVerifier + Send + Sync> = Arc::new(TokenManager::new(TEST_SECRET));
    let engine = Arc::new(ConnectionRoomEngine::new(
        presence.clone(),
        tokens,
        heartbeat_timeout,
    ));
    (engine, presence)
}

/// A fake client: the engine-facing half of a connection, with the outbound
/// frames captured on a channel.
struct TestClient {
    conn: ConnectionId,
    rx: UnboundedReceiver<Message>,
}

impl TestClient {
    fn connect(engine: &ConnectionRoomEngine) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnectionId::new();
        engine.register_connection(conn, tx).unwrap();
        Self { conn, rx }
    }

    fn next_frame(&mut self) -> Message {
        self.rx.try_recv().expect("expected a pending frame")
    }

    fn next_json(&mut self) -> Value {
        let frame = self.next_frame();
        let text = frame.to_str().expect("expected a text frame");
        serde_json::from_str(text).unwrap()
    }

    fn assert_no_pending(&mut self) {
        assert!(self.rx.try_recv().is_err(), "unexpected pending frame");
    }
}

fn login(engine: &ConnectionRoomEngine, client: &mut TestClient, user: &str) {
    let token = TokenManager::new(TEST_SECRET).issue(user, 3600).unwrap();
    let frame = json!({"type": "auth", "user_id": user, "token": token}).to_string();
    let directive = engine.handle_message(client.conn, &frame).unwrap();
    assert_eq!(directive, Directive::Continue);
    let reply = client.next_json();
    assert_eq!(reply["type"], "auth_success");
    assert_eq!(reply["user_id"], user);
}

fn join(engine: &ConnectionRoomEngine, client: &mut TestClient, room: &str) {
    let frame = json!({"type": "join_room", "room_id": room}).to_string();
    assert_eq!(
        engine.handle_message(client.conn, &frame).unwrap(),
        Directive::Continue
    );
    let reply = client.next_json();
    assert_eq!(reply["type"], "room_joined");
    assert_eq!(reply["room_id"], room);
}

#[test]
fn test_auth_rejects_bad_token() {
    let (engine, presence) = build_engine(Duration::from_secs(30));
    let mut client = TestClient::connect(&engine);

    let frame = json!({"type": "auth", "user_id": "alice", "token": "garbage"}).to_string();
    assert_eq!(
        engine.handle_message(client.conn, &frame).unwrap(),
        Directive::Close
    );
    let reply = client.next_json();
    assert_eq!(reply["type"], "auth_error");
    assert!(!presence.is_online("alice").unwrap());
}

#[test]
fn test_auth_rejects_mismatched_subject() {
    let (engine, presence) = build_engine(Duration::from_secs(30));
    let mut client = TestClient::connect(&engine);

    // A valid token for bob must not authenticate alice
    let token = TokenManager::new(TEST_SECRET).issue("bob", 3600).unwrap();
    let frame = json!({"type": "auth", "user_id": "alice", "token": token}).to_string();
    assert_eq!(
        engine.handle_message(client.conn, &frame).unwrap(),
        Directive::Close
    );
    let reply = client.next_json();
    assert_eq!(reply["type"], "auth_error");
    assert!(!presence.is_online("alice").unwrap());
    assert!(!presence.is_online("bob").unwrap());
}

#[test]
fn test_message_before_auth_closes_connection() {
    let (engine, _) = build_engine(Duration::from_secs(30));
    let mut client = TestClient::connect(&engine);

    let frame = json!({"type": "chat_message", "content": "hi"}).to_string();
    assert_eq!(
        engine.handle_message(client.conn, &frame).unwrap(),
        Directive::Close
    );
    let reply = client.next_json();
    assert_eq!(reply["type"], "auth_error");
}

#[test]
fn test_second_auth_is_recoverable_error() {
    let (engine, _) = build_engine(Duration::from_secs(30));
    let mut client = TestClient::connect(&engine);
    login(&engine, &mut client, "alice");

    let token = TokenManager::new(TEST_SECRET).issue("alice", 3600).unwrap();
    let frame = json!({"type": "auth", "user_id": "alice", "token": token}).to_string();
    assert_eq!(
        engine.handle_message(client.conn, &frame).unwrap(),
        Directive::Continue
    );
    let reply = client.next_json();
    assert_eq!(reply["type"], "error");
}

#[test]
fn test_join_announces_to_other_members_only() {
    let (engine, _) = build_engine(Duration::from_secs(30));
    let mut alice = TestClient::connect(&engine);
    let mut bob = TestClient::connect(&engine);
    login(&engine, &mut alice, "alice");
    login(&engine, &mut bob, "bob");

    join(&engine, &mut alice, "lobby");
    alice.assert_no_pending();

    join(&engine, &mut bob, "lobby");
    // The joiner gets only its confirmation, existing members the announcement
    bob.assert_no_pending();
    let notice = alice.next_json();
    assert_eq!(notice["type"], "user_joined");
    assert_eq!(notice["user_id"], "bob");
    assert_eq!(notice["room_id"], "lobby");
}

#[test]
fn test_join_new_room_implicitly_leaves_old() {
    let (engine, _) = build_engine(Duration::from_secs(30));
    let mut alice = TestClient::connect(&engine);
    let mut bob = TestClient::connect(&engine);
    login(&engine, &mut alice, "alice");
    login(&engine, &mut bob, "bob");
    join(&engine, &mut alice, "lobby");
    join(&engine, &mut bob, "lobby");
    alice.next_json(); // bob's join announcement

    join(&engine, &mut bob, "games");
    let notice = alice.next_json();
    assert_eq!(notice["type"], "user_left");
    assert_eq!(notice["user_id"], "bob");
    assert_eq!(notice["room_id"], "lobby");

    assert_eq!(engine.room_of("bob").unwrap(), Some("games".to_string()));
    let members = engine.online_users_in_room("lobby").unwrap();
    assert_eq!(members, vec!["alice".to_string()]);
}

#[test]
fn test_chat_broadcast_includes_sender_and_stays_in_room() {
    let (engine, _) = build_engine(Duration::from_secs(30));
    let mut alice = TestClient::connect(&engine);
    let mut bob = TestClient::connect(&engine);
    let mut carol = TestClient::connect(&engine);
    login(&engine, &mut alice, "alice");
    login(&engine, &mut bob, "bob");
    login(&engine, &mut carol, "carol");
    join(&engine, &mut alice, "lobby");
    join(&engine, &mut bob, "lobby");
    join(&engine, &mut carol, "games");
    alice.next_json(); // bob's join announcement

    let frame = json!({"type": "chat_message", "content": "hello room"}).to_string();
    assert_eq!(
        engine.handle_message(alice.conn, &frame).unwrap(),
        Directive::Continue
    );

    for client in [&mut alice, &mut bob] {
        let msg = client.next_json();
        assert_eq!(msg["type"], "chat_message");
        assert_eq!(msg["user_id"], "alice");
        assert_eq!(msg["room_id"], "lobby");
        assert_eq!(msg["content"], "hello room");
        assert!(msg["timestamp"].as_i64().unwrap() > 0);
    }
    carol.assert_no_pending();
}

#[test]
fn test_chat_without_room_is_recoverable_error() {
    let (engine, _) = build_engine(Duration::from_secs(30));
    let mut alice = TestClient::connect(&engine);
    login(&engine, &mut alice, "alice");

    let frame = json!({"type": "chat_message", "content": "into the void"}).to_string();
    assert_eq!(
        engine.handle_message(alice.conn, &frame).unwrap(),
        Directive::Continue
    );
    assert_eq!(alice.next_json()["type"], "error");
}

#[test]
fn test_failed_delivery_does_not_block_others() {
    let (engine, _) = build_engine(Duration::from_secs(30));
    let mut alice = TestClient::connect(&engine);
    let mut bob = TestClient::connect(&engine);
    let mut carol = TestClient::connect(&engine);
    login(&engine, &mut alice, "alice");
    login(&engine, &mut bob, "bob");
    login(&engine, &mut carol, "carol");
    join(&engine, &mut alice, "lobby");
    join(&engine, &mut bob, "lobby");
    join(&engine, &mut carol, "lobby");
    alice.next_json();
    alice.next_json();
    bob.next_json();

    // bob's outbound channel dies without the engine learning of it
    drop(bob.rx);

    let frame = json!({"type": "chat_message", "content": "still here"}).to_string();
    assert_eq!(
        engine.handle_message(alice.conn, &frame).unwrap(),
        Directive::Continue
    );
    assert_eq!(alice.next_json()["content"], "still here");
    assert_eq!(carol.next_json()["content"], "still here");
}

#[test]
fn test_leave_room_notifies_and_leave_again_errors() {
    let (engine, _) = build_engine(Duration::from_secs(30));
    let mut alice = TestClient::connect(&engine);
    let mut bob = TestClient::connect(&engine);
    login(&engine, &mut alice, "alice");
    login(&engine, &mut bob, "bob");
    join(&engine, &mut alice, "lobby");
    join(&engine, &mut bob, "lobby");
    alice.next_json();

    let frame = json!({"type": "leave_room"}).to_string();
    assert_eq!(
        engine.handle_message(bob.conn, &frame).unwrap(),
        Directive::Continue
    );
    let reply = bob.next_json();
    assert_eq!(reply["type"], "room_left");
    assert_eq!(reply["room_id"], "lobby");
    let notice = alice.next_json();
    assert_eq!(notice["type"], "user_left");
    assert_eq!(notice["user_id"], "bob");

    // Not in a room any more; the error keeps the connection open
    assert_eq!(
        engine.handle_message(bob.conn, &frame).unwrap(),
        Directive::Continue
    );
    assert_eq!(bob.next_json()["type"], "error");
    assert_eq!(engine.room_of("bob").unwrap(), None);
    assert_eq!(engine.members_of("lobby").unwrap(), vec!["alice".to_string()]);
}

#[test]
fn test_relogin_displaces_old_connection() {
    let (engine, presence) = build_engine(Duration::from_secs(30));
    let mut first = TestClient::connect(&engine);
    login(&engine, &mut first, "alice");
    join(&engine, &mut first, "lobby");

    let mut second = TestClient::connect(&engine);
    login(&engine, &mut second, "alice");

    // The old connection is told why and closed
    let notice = first.next_json();
    assert_eq!(notice["type"], "error");
    assert!(first.next_frame().is_close());

    // The old socket's close notification must not evict the new session
    engine.handle_disconnect(first.conn).unwrap();
    assert!(presence.is_online("alice").unwrap());
    assert_eq!(engine.connection_count().unwrap(), 1);

    // The new connection is fully functional
    join(&engine, &mut second, "games");
}

#[test]
fn test_concurrent_auth_keeps_index_and_presence_consistent() {
    for _ in 0..100 {
        let (engine, presence) = build_engine(Duration::from_secs(30));
        let mut a = TestClient::connect(&engine);
        let mut b = TestClient::connect(&engine);
        let token = TokenManager::new(TEST_SECRET).issue("alice", 3600).unwrap();
        let frame = json!({"type": "auth", "user_id": "alice", "token": token}).to_string();

        // Two handshakes for the same user race on different connections
        let racers: Vec<_> = [a.conn, b.conn]
            .into_iter()
            .map(|conn| {
                let engine = Arc::clone(&engine);
                let frame = frame.clone();
                thread::spawn(move || engine.handle_message(conn, &frame))
            })
            .collect();
        for racer in racers {
            racer.join().unwrap().unwrap();
        }

        // Whichever connection won the session must still be reachable
        // through the broadcast path
        let winner_conn = presence
            .session_of("alice")
            .unwrap()
            .expect("alice online after both handshakes")
            .connection
            .expect("websocket session has a connection");

        let mut carol = TestClient::connect(&engine);
        login(&engine, &mut carol, "carol");
        join(&engine, &mut carol, "lobby");

        let join_frame = json!({"type": "join_room", "room_id": "lobby"}).to_string();
        assert_eq!(
            engine.handle_message(winner_conn, &join_frame).unwrap(),
            Directive::Continue
        );
        assert_eq!(carol.next_json()["type"], "user_joined");

        let chat = json!({"type": "chat_message", "content": "hello"}).to_string();
        assert_eq!(
            engine.handle_message(carol.conn, &chat).unwrap(),
            Directive::Continue
        );
        assert_eq!(carol.next_json()["type"], "chat_message");

        let winner = if winner_conn == a.conn { &mut a } else { &mut b };
        loop {
            let frame = winner.next_frame();
            let Ok(text) = frame.to_str() else {
                continue;
            };
            let msg: Value = serde_json::from_str(text).unwrap();
            if msg["type"] == "chat_message" {
                break;
            }
        }
    }
}

#[test]
fn test_auth_after_shutdown_leaves_no_session() {
    let (engine, presence) = build_engine(Duration::from_secs(30));
    let client = TestClient::connect(&engine);
    engine.shutdown().unwrap();

    let token = TokenManager::new(TEST_SECRET).issue("alice", 3600).unwrap();
    let frame = json!({"type": "auth", "user_id": "alice", "token": token}).to_string();
    assert_eq!(
        engine.handle_message(client.conn, &frame).unwrap(),
        Directive::Close
    );
    assert!(!presence.is_online("alice").unwrap());
    assert!(presence.online_users().unwrap().is_empty());
}

#[test]
fn test_ping_refreshes_heartbeat_and_pongs() {
    let (engine, _) = build_engine(Duration::from_millis(80));
    let mut alice = TestClient::connect(&engine);
    login(&engine, &mut alice, "alice");

    thread::sleep(Duration::from_millis(50));
    let frame = json!({"type": "ping"}).to_string();
    assert_eq!(
        engine.handle_message(alice.conn, &frame).unwrap(),
        Directive::Continue
    );
    let reply = alice.next_json();
    assert_eq!(reply["type"], "pong");
    assert!(reply["timestamp"].as_i64().unwrap() > 0);

    // The ping reset the clock, so the sweep finds nothing yet
    thread::sleep(Duration::from_millis(50));
    assert_eq!(engine.sweep_stale().unwrap(), 0);
    assert!(engine.online_users().unwrap().contains(&"alice".to_string()));
}

#[test]
fn test_sweep_evicts_stale_session_and_notifies_room() {
    let (engine, presence) = build_engine(Duration::from_millis(60));
    let mut alice = TestClient::connect(&engine);
    let mut bob = TestClient::connect(&engine);
    login(&engine, &mut alice, "alice");
    login(&engine, &mut bob, "bob");
    join(&engine, &mut alice, "lobby");
    join(&engine, &mut bob, "lobby");
    alice.next_json();

    thread::sleep(Duration::from_millis(100));
    presence.heartbeat("alice").unwrap();

    assert_eq!(engine.sweep_stale().unwrap(), 1);
    assert!(!presence.is_online("bob").unwrap());
    assert!(presence.is_online("alice").unwrap());

    let notice = alice.next_json();
    assert_eq!(notice["type"], "user_left");
    assert_eq!(notice["user_id"], "bob");
    assert!(bob.next_frame().is_close());
    assert_eq!(engine.connection_count().unwrap(), 1);
}

#[test]
fn test_disconnect_notifies_room_and_is_idempotent() {
    let (engine, presence) = build_engine(Duration::from_secs(30));
    let mut alice = TestClient::connect(&engine);
    let mut bob = TestClient::connect(&engine);
    login(&engine, &mut alice, "alice");
    login(&engine, &mut bob, "bob");
    join(&engine, &mut alice, "lobby");
    join(&engine, &mut bob, "lobby");
    alice.next_json();

    engine.handle_disconnect(bob.conn).unwrap();
    assert!(!presence.is_online("bob").unwrap());
    let notice = alice.next_json();
    assert_eq!(notice["type"], "user_left");
    assert_eq!(notice["user_id"], "bob");

    // A duplicate close notification is a no-op
    engine.handle_disconnect(bob.conn).unwrap();
    alice.assert_no_pending();
}

#[test]
fn test_disconnect_before_auth_is_silent() {
    let (engine, _) = build_engine(Duration::from_secs(30));
    let client = TestClient::connect(&engine);
    engine.handle_disconnect(client.conn).unwrap();
    assert_eq!(engine.connection_count().unwrap(), 0);
}

#[test]
fn test_shutdown_closes_all_and_rejects_new_connections() {
    let (engine, presence) = build_engine(Duration::from_secs(30));
    let mut alice = TestClient::connect(&engine);
    let mut bob = TestClient::connect(&engine);
    login(&engine, &mut alice, "alice");
    login(&engine, &mut bob, "bob");
    join(&engine, &mut alice, "lobby");

    engine.shutdown().unwrap();
    assert!(alice.next_frame().is_close());
    assert!(bob.next_frame().is_close());
    assert_eq!(engine.connection_count().unwrap(), 0);
    assert!(presence.online_users().unwrap().is_empty());

    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(engine.register_connection(ConnectionId::new(), tx).is_err());

    // Shutdown twice is a no-op
    engine.shutdown().unwrap();
}

#[test]
fn test_malformed_message_after_auth_keeps_connection() {
    let (engine, _) = build_engine(Duration::from_secs(30));
    let mut alice = TestClient::connect(&engine);
    login(&engine, &mut alice, "alice");

    assert_eq!(
        engine.handle_message(alice.conn, "not json at all").unwrap(),
        Directive::Continue
    );
    assert_eq!(alice.next_json()["type"], "error");
}

#[test]
fn test_stats_reflect_online_sessions() {
    let (engine, _) = build_engine(Duration::from_secs(30));
    let mut alice = TestClient::connect(&engine);
    let mut bob = TestClient::connect(&engine);
    login(&engine, &mut alice, "alice");
    login(&engine, &mut bob, "bob");

    let stats = engine.stats().unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.websocket, 2);
    let mut online = engine.online_users().unwrap();
    online.sort();
    assert_eq!(online, vec!["alice", "bob"]);
}
