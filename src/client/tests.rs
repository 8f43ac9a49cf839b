use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use super::*;
use crate::audio::CaptureSink;
use crate::auth::tests::payload_expiring_in;
use crate::auth::MockCredentialExchange;
use crate::transport::mock::{mock_connector, MockConnector, MockServer, Plan};
use crate::types::{ClientFrame, MessageRole};

fn network() -> ClientError {
    ClientError::Network("connection refused".into())
}

fn config() -> Config {
    Config::builder().with_jitter(0.0).with_max_attempts(3).build()
}

fn client_with(connector: Arc<MockConnector>, config: Config) -> Client {
    let client = Client::builder().with_config(config).with_connector(connector).build();
    client.initialize_from_payload(payload_expiring_in(3600, "a")).unwrap();
    client
}

async fn accept(servers: &mut mpsc::UnboundedReceiver<MockServer>) -> MockServer {
    let mut server = servers.recv().await.expect("no connection attempt");
    server.handshake().await;
    server
}

async fn ready_client() -> (Client, MockServer, Arc<MockConnector>, mpsc::UnboundedReceiver<MockServer>) {
    let (connector, mut servers) = mock_connector();
    let client = client_with(connector.clone(), config());
    let (result, server) = tokio::join!(client.connect(), accept(&mut servers));
    result.unwrap();
    (client, server, connector, servers)
}

async fn wait_for_state(client: &Client, state: ConnectionState) {
    client
        .watch_connection_state()
        .wait_for(|s| *s == state)
        .await
        .unwrap();
}

fn drain(events: &mut EventRx) -> Vec<ClientEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

fn client_with_exchange(
    connector: Arc<MockConnector>,
    exchange: MockCredentialExchange,
    config: Config,
    payload: CredentialPayload,
) -> Client {
    let client = Client::builder()
        .with_config(config)
        .with_connector(connector)
        .with_credential_exchange(Arc::new(exchange))
        .build();
    client.initialize_from_payload(payload).unwrap();
    client
}

/// Completes the handshake by hand and returns the token the client logged in with.
async fn accept_with_token(servers: &mut mpsc::UnboundedReceiver<MockServer>) -> (MockServer, String) {
    let mut server = servers.recv().await.expect("no connection attempt");
    let token = match server.recv().await {
        Some(ClientFrame::Login(event)) => event.access_token().to_string(),
        other => panic!("expected login, got {:?}", other),
    };
    server.send(json!({"type": "authenticated", "user_id": "u-1"}));
    server.send(json!({"type": "session_list", "sessions": [{"session_id": "s-1"}], "current_session_id": "s-1"}));
    (server, token)
}

#[tokio::test(start_paused = true)]
async fn connect_reaches_ready_with_session_list() {
    let (connector, mut servers) = mock_connector();
    let client = client_with(connector.clone(), config());
    let mut events = client.subscribe();

    let (result, _server) = tokio::join!(client.connect(), accept(&mut servers));
    assert_eq!(result, Ok(()));
    assert_eq!(client.connection_state(), ConnectionState::Ready);

    let current = client.current_session().unwrap();
    assert_eq!(current.session_id(), "s-1");
    assert_eq!(current.name(), Some("First"));

    let events = drain(&mut events);
    assert_eq!(events[0], ClientEvent::Ready);
    assert!(matches!(&events[1], ClientEvent::Frame(ServerFrame::SessionList(_))));
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_attempt() {
    let (connector, mut servers) = mock_connector();
    let client = client_with(connector.clone(), config());

    let (first, second, _server) = tokio::join!(client.connect(), client.connect(), accept(&mut servers));
    assert_eq!(first, Ok(()));
    assert_eq!(second, Ok(()));
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_ready() {
    let (connector, mut servers) = mock_connector();
    connector.plan(Plan::Refuse(network()));
    connector.plan(Plan::Refuse(network()));
    let client = client_with(connector.clone(), config());
    let mut events = client.subscribe();

    let (result, _server) = tokio::join!(client.connect(), accept(&mut servers));
    assert_eq!(result, Ok(()));
    assert_eq!(connector.opens(), 3);
    assert_eq!(client.reconnection_state().attempt_count, 0);

    let events = drain(&mut events);
    assert_eq!(
        &events[..3],
        &[
            ClientEvent::Reconnecting { attempt: 1, delay: Duration::from_secs(1) },
            ClientEvent::Reconnecting { attempt: 2, delay: Duration::from_secs(2) },
            ClientEvent::Ready,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_terminal() {
    let (connector, _servers) = mock_connector();
    for _ in 0..3 {
        connector.plan(Plan::Refuse(network()));
    }
    let client = client_with(connector.clone(), config());
    let mut events = client.subscribe();

    match client.connect().await {
        Err(ClientError::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(client.connection_state(), ConnectionState::Error);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.opens(), 3);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, ClientEvent::Fatal(ClientError::ReconnectExhausted { .. }))));
}

#[tokio::test(start_paused = true)]
async fn partial_text_is_discarded_across_reconnect() {
    let (client, server, _connector, mut servers) = ready_client().await;
    let mut sessions = client.watch_sessions();

    server.send(json!({"type": "text_delta", "session_id": "s-1", "delta": "Hel"}));
    sessions.wait_for(|s| s.streaming_text.is_some()).await.unwrap();

    drop(server);
    wait_for_state(&client, ConnectionState::Reconnecting).await;
    assert_eq!(client.streaming_text(), None);

    let server = accept(&mut servers).await;
    wait_for_state(&client, ConnectionState::Ready).await;
    assert!(client.current_session().unwrap().messages().is_empty());
    assert_eq!(client.stats().reconnects(), 1);

    server.send(json!({"type": "text_complete", "session_id": "s-1", "text": "Hi there"}));
    sessions.wait_for(|s| !s.current().unwrap().messages().is_empty()).await.unwrap();
    let session = client.current_session().unwrap();
    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].content(), "Hi there");
}

#[tokio::test(start_paused = true)]
async fn send_message_while_connecting_is_not_ready() {
    let (connector, _servers) = mock_connector();
    connector.plan(Plan::Hang);
    let client = Arc::new(client_with(connector, config()));

    let connecting = client.clone();
    tokio::spawn(async move { connecting.connect().await });
    wait_for_state(&client, ConnectionState::Connecting).await;

    assert_eq!(
        client.send_message("hello").await,
        Err(ClientError::NotReady(ConnectionState::Connecting))
    );
    assert!(client.sessions().is_empty());
    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn send_message_appends_locally_and_sends() {
    let (client, mut server, _connector, _servers) = ready_client().await;

    client.send_message("hello").await.unwrap();
    match server.recv_control().await {
        Some(ClientFrame::SendText(event)) => {
            assert_eq!(event.text(), "hello");
            assert_eq!(event.session_id(), Some("s-1"));
        }
        other => panic!("unexpected frame: {:?}", other),
    }
    let messages = client.current_session().unwrap().messages().to_vec();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role(), MessageRole::User);
}

#[tokio::test(start_paused = true)]
async fn close_twice_is_fine() {
    let (client, mut server, connector, _servers) = ready_client().await;

    assert_eq!(client.close().await, Ok(()));
    assert_eq!(client.close().await, Ok(()));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(server.recv().await, None);

    assert_eq!(client.connect().await, Err(ClientError::Closed));
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_frames_are_dropped_and_counted() {
    let (client, server, _connector, _servers) = ready_client().await;
    let mut turn = client.watch_turn();

    server.send(json!({"type": "weather_report", "sky": "blue"}));
    server.send(json!({"type": "turn_start", "holder": "agent"}));
    turn.wait_for(|t| t.state == TurnState::AgentTurn).await.unwrap();

    assert_eq!(client.connection_state(), ConnectionState::Ready);
    assert_eq!(client.stats().unknown_frames(), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_frame_resets_the_connection() {
    let (client, server, connector, mut servers) = ready_client().await;

    server.send_raw("{not json");
    wait_for_state(&client, ConnectionState::Reconnecting).await;

    let _server = accept(&mut servers).await;
    wait_for_state(&client, ConnectionState::Ready).await;
    assert_eq!(connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_during_handshake_is_not_retried() {
    let (connector, mut servers) = mock_connector();
    let client = client_with(connector.clone(), config());

    let server = async {
        let mut server = servers.recv().await.unwrap();
        server.recv().await;
        server.send(json!({"type": "error", "code": "auth_failed", "message": "bad token"}));
        server
    };
    let (result, _server) = tokio::join!(client.connect(), server);
    assert_eq!(result, Err(ClientError::AuthRejected("bad token".into())));
    assert_eq!(client.connection_state(), ConnectionState::Error);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_after_ready_is_terminal() {
    let (client, server, connector, _servers) = ready_client().await;
    let mut events = client.subscribe();

    server.send(json!({"type": "error", "code": "token_expired", "message": "expired"}));
    wait_for_state(&client, ConnectionState::Error).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.opens(), 1);
    let events = drain(&mut events);
    assert!(events.contains(&ClientEvent::Fatal(ClientError::AuthRejected("expired".into()))));
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_reported_without_disconnecting() {
    let (client, server, _connector, _servers) = ready_client().await;
    let mut events = client.subscribe();

    server.send(json!({"type": "error", "code": "rate_limited", "message": "slow down"}));
    server.send(json!({"type": "turn_start", "holder": "user"}));
    client.watch_turn().wait_for(|t| t.state == TurnState::UserTurn).await.unwrap();

    assert_eq!(client.connection_state(), ConnectionState::Ready);
    let events = drain(&mut events);
    assert!(events.contains(&ClientEvent::Error(ClientError::Server {
        code: Some("rate_limited".into()),
        message: "slow down".into(),
    })));
}

#[tokio::test(start_paused = true)]
async fn new_session_resolves_on_session_started() {
    let (client, mut server, _connector, _servers) = ready_client().await;
    let client = Arc::new(client);

    let requesting = client.clone();
    let pending = tokio::spawn(async move { requesting.new_session(Some("tutor")).await });

    let request_id = match server.recv_control().await {
        Some(ClientFrame::NewSession(event)) => {
            assert_eq!(event.agent_key(), Some("tutor"));
            event.request_id().to_string()
        }
        other => panic!("unexpected frame: {:?}", other),
    };
    server.send(json!({
        "type": "session_started",
        "request_id": request_id,
        "session_id": "s-2",
        "name": "Second"
    }));

    let session = pending.await.unwrap().unwrap();
    assert_eq!(session.session_id(), "s-2");
    assert_eq!(client.current_session().unwrap().session_id(), "s-2");
    assert_eq!(client.sessions().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn user_turn_request_waits_for_confirmation() {
    let (client, mut server, _connector, _servers) = ready_client().await;

    client.request_user_turn().unwrap();
    assert!(matches!(server.recv_control().await, Some(ClientFrame::RequestUserTurn(_))));
    assert_eq!(client.turn_state(), TurnState::Idle);

    server.send(json!({"type": "turn_start", "holder": "user"}));
    client.watch_turn().wait_for(|t| t.state == TurnState::UserTurn).await.unwrap();
    assert_eq!(client.turn_history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn avatar_start_and_end() {
    let (client, mut server, _connector, _servers) = ready_client().await;
    let client = Arc::new(client);

    let starting = client.clone();
    let pending = tokio::spawn(async move { starting.start_avatar_session("anna").await });
    assert!(matches!(server.recv_control().await, Some(ClientFrame::StartAvatar(_))));
    server.send(json!({"type": "avatar_ready", "avatar_id": "anna", "session_id": "av-1"}));

    let state = pending.await.unwrap().unwrap();
    assert!(state.is_active());
    assert_eq!(client.avatar_state(), state);

    client.end_avatar_session().await.unwrap();
    assert_eq!(client.avatar_state(), AvatarState::Idle);
    match server.recv_control().await {
        Some(ClientFrame::StopAvatar(event)) => assert_eq!(event.avatar_id(), Some("anna")),
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[derive(Default)]
struct HandleCapture {
    sink: Mutex<Option<CaptureSink>>,
}

#[async_trait]
impl AudioCapture for HandleCapture {
    async fn start(&self, sink: CaptureSink) -> Result<(), ClientError> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    async fn stop(&self) {
        self.sink.lock().unwrap().take();
    }
}

#[tokio::test(start_paused = true)]
async fn audio_flows_only_during_the_user_turn() {
    let (connector, mut servers) = mock_connector();
    let capture = Arc::new(HandleCapture::default());
    let client = Client::builder()
        .with_config(config())
        .with_connector(connector)
        .with_capture(capture.clone())
        .build();
    client.initialize_from_payload(payload_expiring_in(3600, "a")).unwrap();
    let (result, mut server) = tokio::join!(client.connect(), accept(&mut servers));
    result.unwrap();

    client.start_capture().await.unwrap();
    let sink = capture.sink.lock().unwrap().clone().unwrap();
    assert!(!client.arm_streaming());

    server.send(json!({"type": "turn_start", "holder": "user"}));
    client.watch_turn().wait_for(|t| t.state == TurnState::UserTurn).await.unwrap();
    assert!(client.arm_streaming());
    sink.push(0, vec![100; 480]);

    assert!(matches!(server.recv().await, Some(ClientFrame::StartAudioStream(_))));
    match server.recv().await {
        Some(ClientFrame::AudioChunk(event)) => assert_eq!(event.sequence(), 0),
        other => panic!("unexpected frame: {:?}", other),
    }

    server.send(json!({"type": "turn_end", "holder": "user"}));
    assert!(matches!(server.recv().await, Some(ClientFrame::StopAudioStream(_))));
    assert!(!client.audio_state().is_streaming);

    sink.push(20, vec![100; 480]);
    client.close().await.unwrap();
    assert_eq!(server.recv().await, None);
    assert_eq!(client.stats().audio_frames_forwarded(), 1);
}

#[tokio::test(start_paused = true)]
async fn expiring_token_is_refreshed_before_retry() {
    let (connector, mut servers) = mock_connector();
    let mut exchange = MockCredentialExchange::new();
    let mut calls = 0;
    exchange
        .expect_refresh()
        .withf(|token| token == "refresh-old")
        .times(2)
        .returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(network())
            } else {
                Ok(payload_expiring_in(3600, "fresh"))
            }
        });
    let client = client_with_exchange(connector.clone(), exchange, config(), payload_expiring_in(30, "old"));
    let mut events = client.subscribe();

    let (result, (_server, token)) = tokio::join!(client.connect(), accept_with_token(&mut servers));
    assert_eq!(result, Ok(()));
    assert_eq!(token, "access-fresh");
    assert_eq!(connector.opens(), 1);
    assert_eq!(
        drain(&mut events)[0],
        ClientEvent::Reconnecting { attempt: 1, delay: Duration::from_secs(1) }
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_refresh_connects_with_still_valid_token() {
    let (connector, mut servers) = mock_connector();
    let mut exchange = MockCredentialExchange::new();
    exchange
        .expect_refresh()
        .times(1)
        .returning(|_| Err(ClientError::Auth("refresh token revoked".into())));
    let config = Config::builder()
        .with_jitter(0.0)
        .with_max_attempts(3)
        .with_token_check_interval(Duration::from_secs(3600))
        .build();
    let client = client_with_exchange(connector.clone(), exchange, config, payload_expiring_in(30, "old"));

    let (result, (_server, token)) = tokio::join!(client.connect(), accept_with_token(&mut servers));
    assert_eq!(result, Ok(()));
    assert_eq!(token, "access-old");
    assert_eq!(client.connection_state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn rejected_refresh_with_expired_token_is_terminal() {
    let (connector, _servers) = mock_connector();
    let mut exchange = MockCredentialExchange::new();
    exchange
        .expect_refresh()
        .times(1)
        .returning(|_| Err(ClientError::Auth("refresh token revoked".into())));
    let client = client_with_exchange(connector.clone(), exchange, config(), payload_expiring_in(-10, "old"));

    let result = client.connect().await;
    assert!(matches!(result, Err(ref e) if e.is_auth()), "unexpected result: {:?}", result);
    assert_eq!(client.connection_state(), ConnectionState::Error);
    assert_eq!(connector.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn background_refresh_sends_token_and_keeps_the_turn() {
    let (connector, mut servers) = mock_connector();
    let mut exchange = MockCredentialExchange::new();
    exchange
        .expect_refresh()
        .withf(|token| token == "refresh-soon")
        .times(1)
        .returning(|_| Ok(payload_expiring_in(3600, "fresh")));
    let config = Config::builder()
        .with_jitter(0.0)
        .with_token_check_interval(Duration::from_secs(1))
        .build();
    let client = client_with_exchange(connector, exchange, config, payload_expiring_in(3600, "a"));
    let (result, (mut server, _)) = tokio::join!(client.connect(), accept_with_token(&mut servers));
    result.unwrap();

    server.send(json!({"type": "turn_start", "holder": "agent"}));
    client.watch_turn().wait_for(|t| t.state == TurnState::AgentTurn).await.unwrap();

    client.initialize_from_payload(payload_expiring_in(30, "soon")).unwrap();
    match server.recv_control().await {
        Some(ClientFrame::Refresh(event)) => assert_eq!(event.access_token(), "access-fresh"),
        other => panic!("unexpected frame: {:?}", other),
    }
    assert_eq!(client.turn_state(), TurnState::AgentTurn);
    assert_eq!(client.turn_history().len(), 1);
    assert_eq!(client.connection_state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn rejected_background_refresh_is_reported() {
    let (connector, mut servers) = mock_connector();
    let mut exchange = MockCredentialExchange::new();
    exchange
        .expect_refresh()
        .returning(|_| Err(ClientError::Auth("refresh token revoked".into())));
    let config = Config::builder()
        .with_jitter(0.0)
        .with_token_check_interval(Duration::from_secs(1))
        .build();
    let client = client_with_exchange(connector, exchange, config, payload_expiring_in(3600, "a"));
    let (result, (_server, _)) = tokio::join!(client.connect(), accept_with_token(&mut servers));
    result.unwrap();
    let mut events = client.subscribe();

    client.initialize_from_payload(payload_expiring_in(30, "soon")).unwrap();
    match events.recv().await.unwrap() {
        ClientEvent::Error(e) => assert!(e.is_auth()),
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(client.connection_state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn silent_initialization_is_a_protocol_failure() {
    let (connector, mut servers) = mock_connector();
    let config = Config::builder()
        .with_jitter(0.0)
        .with_max_attempts(5)
        .with_init_timeout(Duration::from_secs(2))
        .build();
    let client = client_with(connector.clone(), config);
    let mut events = client.subscribe();

    // Authenticates but never sends the session listing, twice.
    let stalling = async {
        let mut stalled = Vec::new();
        for _ in 0..2 {
            let mut server = servers.recv().await.unwrap();
            server.recv().await;
            server.send(json!({"type": "authenticated", "user_id": "u-1"}));
            stalled.push(server);
        }
        stalled
    };
    let (result, _stalled) = tokio::join!(client.connect(), stalling);
    assert!(matches!(result, Err(ClientError::Protocol(_))), "unexpected result: {:?}", result);
    assert_eq!(client.connection_state(), ConnectionState::Error);
    assert_eq!(connector.opens(), 2);
    assert_eq!(
        drain(&mut events)[0],
        ClientEvent::Reconnecting { attempt: 1, delay: Duration::from_secs(1) }
    );
}

#[tokio::test(start_paused = true)]
async fn stream_error_after_ready_reconnects() {
    let (client, server, connector, mut servers) = ready_client().await;
    let mut events = client.subscribe();

    server.fail(network());
    wait_for_state(&client, ConnectionState::Reconnecting).await;

    let _server = accept(&mut servers).await;
    wait_for_state(&client, ConnectionState::Ready).await;
    assert_eq!(connector.opens(), 2);
    assert_eq!(client.stats().reconnects(), 1);

    let events = drain(&mut events);
    assert_eq!(events[0], ClientEvent::Disconnected);
    assert!(events.contains(&ClientEvent::Reconnecting { attempt: 1, delay: Duration::from_secs(1) }));
}

#[tokio::test(start_paused = true)]
async fn zero_token_check_interval_builds() {
    let (connector, mut servers) = mock_connector();
    let config = Config::builder().with_token_check_interval(Duration::ZERO).build();
    let client = client_with(connector, config);
    let (result, _server) = tokio::join!(client.connect(), accept(&mut servers));
    assert_eq!(result, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn lagging_subscriber_is_told_what_it_missed() {
    let (connector, mut servers) = mock_connector();
    let config = Config::builder().with_jitter(0.0).with_event_capacity(2).build();
    let client = client_with(connector, config);
    let (result, server) = tokio::join!(client.connect(), accept(&mut servers));
    result.unwrap();
    let mut events = client.subscribe();

    for i in 0..5 {
        server.send(json!({"type": "text_delta", "session_id": "s-1", "delta": i.to_string()}));
    }
    let mut sessions = client.watch_sessions();
    sessions.wait_for(|s| s.streaming_text.as_deref() == Some("01234")).await.unwrap();

    assert_eq!(events.recv().await, Err(broadcast::error::RecvError::Lagged(3)));
    assert!(matches!(events.recv().await, Ok(ClientEvent::Frame(ServerFrame::TextDelta(_)))));
    assert_eq!(client.streaming_text().as_deref(), Some("01234"));
}
