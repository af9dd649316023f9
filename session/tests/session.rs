mod support;

use std::time::Duration;

use serde_json::json;
use support::{recv_json, send_json, test_config, MockExchange, TestHooks};
use tokio::time::{sleep, timeout, Instant};
use tracing_test::traced_test;
use ws_session::{Session, SessionError, SessionHooks, SessionState};

async fn wait_for_state<H: SessionHooks>(session: &Session<H>, state: SessionState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.state() != state {
        assert!(Instant::now() < deadline, "stuck in {}", session.state());
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_pending<H: SessionHooks>(session: &Session<H>, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.pending_len() != n {
        assert!(Instant::now() < deadline, "pending stuck at {}", session.pending_len());
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn request_resolves_with_matching_response() {
    let mut mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    let mut server = mock.next_conn().await;

    let client = session.clone();
    let call = tokio::spawn(async move {
        client
            .send_request(json!({"id": "R1", "op": "order.place"}))
            .await
    });
    let req = recv_json(&mut server).await;
    assert_eq!(req["id"], "R1");
    send_json(&mut server, json!({"id": "R1", "result": {"ok": true}})).await;

    let resp = call.await.unwrap().unwrap();
    assert_eq!(resp["result"]["ok"], true);
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test]
async fn embedded_error_is_reported_as_api_error() {
    let mut mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.connect().await.unwrap();
    let mut server = mock.next_conn().await;

    let client = session.clone();
    let call = tokio::spawn(async move { client.send_request(json!({"id": "R1"})).await });
    recv_json(&mut server).await;
    send_json(
        &mut server,
        json!({"id": "R1", "error": {"code": 400, "msg": "bad"}}),
    )
    .await;

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.api_code(), Some(400));
    assert!(!err.is_ambiguous());
}

#[tokio::test]
async fn assigns_id_when_request_has_none() {
    let mut mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.connect().await.unwrap();
    let mut server = mock.next_conn().await;

    let client = session.clone();
    let call = tokio::spawn(async move { client.send_request(json!({"op": "time"})).await });
    let req = recv_json(&mut server).await;
    let id = req["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("req-"));
    send_json(&mut server, json!({"id": id, "result": {}})).await;
    call.await.unwrap().unwrap();
}

#[tokio::test]
async fn push_without_id_leaves_request_pending() {
    let mut mock = MockExchange::start().await;
    let (hooks, mut pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.connect().await.unwrap();
    let mut server = mock.next_conn().await;

    let client = session.clone();
    let call = tokio::spawn(async move { client.send_request(json!({"id": "R1"})).await });
    recv_json(&mut server).await;
    send_json(&mut server, json!({"e": "executionReport", "s": "BTCUSDT"})).await;

    let push = timeout(Duration::from_secs(2), pushes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(push["e"], "executionReport");
    assert_eq!(session.pending_len(), 1);
    assert!(!call.is_finished());

    send_json(&mut server, json!({"id": "R1", "result": {}})).await;
    call.await.unwrap().unwrap();
}

#[tokio::test]
async fn interleaved_frames_are_dispatched_in_arrival_order() {
    let mut mock = MockExchange::start().await;
    let (hooks, mut pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.connect().await.unwrap();
    let mut server = mock.next_conn().await;

    let client = session.clone();
    let call = tokio::spawn(async move { client.send_request(json!({"id": "B"})).await });
    recv_json(&mut server).await;
    send_json(&mut server, json!({"e": "A"})).await;
    send_json(&mut server, json!({"id": "B", "result": {}})).await;
    send_json(&mut server, json!({"e": "C"})).await;

    call.await.unwrap().unwrap();
    // A was handed to the push handler before B resolved.
    assert_eq!(pushes.try_recv().unwrap()["e"], "A");
    let c = timeout(Duration::from_secs(2), pushes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(c["e"], "C");
}

#[tokio::test]
async fn late_response_after_connection_loss_is_not_delivered_twice() {
    let mut mock = MockExchange::start().await;
    let (hooks, mut pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.connect().await.unwrap();
    let mut first = mock.next_conn().await;

    let client = session.clone();
    let call = tokio::spawn(async move { client.send_request(json!({"id": "R1"})).await });
    recv_json(&mut first).await;

    session.reconnect().await.unwrap();
    assert!(matches!(
        call.await.unwrap(),
        Err(SessionError::ConnectionLost(_))
    ));
    assert_eq!(session.pending_len(), 0);

    let mut second = mock.next_conn().await;
    send_json(&mut second, json!({"id": "R1", "result": {}})).await;
    let push = timeout(Duration::from_secs(2), pushes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(push["id"], "R1");
}

#[tokio::test]
#[traced_test]
async fn connection_loss_fails_every_pending_request_then_recovers() {
    let mut mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.connect().await.unwrap();
    let mut server = mock.next_conn().await;

    let calls: Vec<_> = (0..5)
        .map(|i| {
            let client = session.clone();
            tokio::spawn(async move { client.send_request(json!({"id": format!("R{i}")})).await })
        })
        .collect();
    for _ in 0..5 {
        recv_json(&mut server).await;
    }
    assert_eq!(session.pending_len(), 5);

    drop(server);
    for call in calls {
        let err = timeout(Duration::from_secs(2), call)
            .await
            .expect("pending request was not failed promptly")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SessionError::ConnectionLost(_)));
        assert!(err.is_ambiguous());
    }

    let mut server = mock.next_conn().await;
    wait_for_state(&session, SessionState::Ready).await;
    assert_eq!(mock.accepted(), 2);
    assert!(logs_contain("connection lost"));

    let client = session.clone();
    let call = tokio::spawn(async move { client.send_request(json!({"id": "R0"})).await });
    recv_json(&mut server).await;
    send_json(&mut server, json!({"id": "R0", "result": {}})).await;
    call.await.unwrap().unwrap();
}

#[tokio::test]
async fn duplicate_in_flight_id_is_rejected() {
    let mut mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.connect().await.unwrap();
    let mut server = mock.next_conn().await;

    let client = session.clone();
    let first = tokio::spawn(async move { client.send_request(json!({"id": "R1"})).await });
    recv_json(&mut server).await;

    match session.send_request(json!({"id": "R1"})).await {
        Err(SessionError::DuplicateId(id)) => assert_eq!(id, "R1"),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(session.pending_len(), 1);

    send_json(&mut server, json!({"id": "R1", "result": {}})).await;
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn timed_out_request_stays_registered_until_late_response() {
    let mut mock = MockExchange::start().await;
    let (hooks, mut pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.connect().await.unwrap();
    let mut server = mock.next_conn().await;

    let err = session
        .send_request_timeout(json!({"id": "R1"}), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Timeout(_)));
    assert_eq!(session.pending_len(), 1);

    recv_json(&mut server).await;
    send_json(&mut server, json!({"id": "R1", "result": {}})).await;
    wait_for_pending(&session, 0).await;
    assert!(pushes.try_recv().is_err());
}

#[tokio::test]
async fn pending_ttl_expires_unanswered_requests() {
    let mut mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let mut cfg = test_config(&mock.url);
    cfg.ping_interval = Duration::from_millis(50);
    cfg.pending_ttl = Some(Duration::from_millis(100));
    let session = Session::new(cfg, hooks);
    session.connect().await.unwrap();
    let _server = mock.next_conn().await;

    let err = timeout(
        Duration::from_secs(2),
        session.send_request(json!({"id": "R1"})),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, SessionError::Timeout(_)));
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test]
async fn request_before_connect_fails_fast() {
    let mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    let err = session.send_request(json!({"id": "R1"})).await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));
    assert!(err.is_retryable());
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test]
async fn auth_rejection_leaves_session_disconnected() {
    let mock = MockExchange::rejecting().await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    match session.connect().await {
        Err(SessionError::Auth(msg)) => assert_eq!(msg, "invalid key"),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(mock.accepted(), 0);
}

#[tokio::test]
async fn dial_failure_reports_dial_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let url = url::Url::parse(&format!("ws://{addr}/ws")).unwrap();
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&url), hooks);

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::Dial(_)));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn dropped_connect_during_dial_leaves_session_disconnected() {
    // Accepts TCP but never completes the WebSocket handshake.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = url::Url::parse(&format!("ws://{}/ws", listener.local_addr().unwrap())).unwrap();
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&url), hooks);

    assert!(timeout(Duration::from_millis(200), session.connect())
        .await
        .is_err());
    assert_eq!(session.state(), SessionState::Disconnected);

    // A second attempt gets past the state check and dials again.
    assert!(timeout(Duration::from_millis(200), session.connect())
        .await
        .is_err());
    assert_eq!(session.state(), SessionState::Disconnected);
    drop(listener);
}

#[tokio::test]
async fn dropped_connect_during_after_connect_can_be_retried() {
    let mut mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::with_setup();
    let session = Session::new(test_config(&mock.url), hooks);

    // The setup request is never answered.
    let (attempt, mut stale) = tokio::join!(
        timeout(Duration::from_millis(300), session.connect()),
        mock.next_conn()
    );
    assert!(attempt.is_err());
    assert_eq!(recv_json(&mut stale).await["id"], "setup-1");
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(session.pending_len(), 0);

    let client = session.clone();
    let connecting = tokio::spawn(async move { client.connect().await });
    let mut server = mock.next_conn().await;
    let setup = recv_json(&mut server).await;
    assert_eq!(setup["id"], "setup-2");
    send_json(&mut server, json!({"id": setup["id"], "result": {}})).await;
    connecting.await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn connect_while_ready_is_invalid() {
    let mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.connect().await.unwrap();
    assert!(matches!(
        session.connect().await,
        Err(SessionError::InvalidState(SessionState::Ready))
    ));
}

#[tokio::test]
async fn reports_clock_offset_from_auth_reply() {
    let mock = MockExchange::skewed(1_000).await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    let offset = session.connect().await.unwrap();
    assert!((1_000..1_500).contains(&offset), "offset {offset}");
    assert_eq!(session.clock_offset_ms(), offset);
}

#[tokio::test]
async fn close_fails_outstanding_requests_and_is_idempotent() {
    let mut mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.connect().await.unwrap();
    let mut server = mock.next_conn().await;

    let client = session.clone();
    let call = tokio::spawn(async move { client.send_request(json!({"id": "R1"})).await });
    recv_json(&mut server).await;

    session.close().await.unwrap();
    assert!(matches!(call.await.unwrap(), Err(SessionError::Closed)));
    assert_eq!(session.state(), SessionState::Closed);

    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.send_request(json!({"id": "R2"})).await,
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(
        session.reconnect().await,
        Err(SessionError::InvalidState(SessionState::Closed))
    ));
}

#[tokio::test]
async fn close_before_connect_moves_to_closed() {
    let mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn connect_after_close_starts_fresh() {
    let mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    session.connect().await.unwrap();
    session.close().await.unwrap();
    session.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(mock.accepted(), 2);
}

#[tokio::test]
async fn reconnect_before_first_connect_is_rejected() {
    let mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let session = Session::new(test_config(&mock.url), hooks);
    assert!(matches!(
        session.reconnect().await,
        Err(SessionError::NotConnected)
    ));
}

#[tokio::test]
async fn after_connect_runs_on_every_connection() {
    let mut mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::with_setup();
    let session = Session::new(test_config(&mock.url), hooks);
    // Server sockets stay open so only the explicit reconnect replaces them.
    let mut servers = Vec::new();

    for round in 1..=2 {
        let client = session.clone();
        let connecting = tokio::spawn(async move {
            if round == 1 {
                client.connect().await.map(|_| ())
            } else {
                client.reconnect().await
            }
        });
        let mut server = mock.next_conn().await;
        let setup = recv_json(&mut server).await;
        assert_eq!(setup["op"], "subscribe");
        assert_eq!(setup["id"], format!("setup-{round}"));
        send_json(&mut server, json!({"id": setup["id"], "result": {}})).await;
        connecting.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(
            session
                .hooks()
                .after_connect_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            round
        );
        servers.push(server);
    }
}

#[tokio::test]
async fn after_connect_failure_aborts_connect() {
    let mut mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::with_setup();
    let session = Session::new(test_config(&mock.url), hooks);

    let client = session.clone();
    let connecting = tokio::spawn(async move { client.connect().await });
    let mut server = mock.next_conn().await;
    let setup = recv_json(&mut server).await;
    send_json(
        &mut server,
        json!({"id": setup["id"], "error": {"code": -1, "msg": "no such stream"}}),
    )
    .await;

    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::AfterConnect(_)));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test]
async fn session_refreshes_before_lifetime_expires() {
    let mut mock = MockExchange::start().await;
    let (hooks, _pushes) = TestHooks::new();
    let cfg = test_config(&mock.url)
        .with_lifetime(Duration::from_millis(600), Duration::from_millis(300));
    let session = Session::new(cfg, hooks);
    session.connect().await.unwrap();
    let _first = mock.next_conn().await;

    let _second = mock.next_conn().await;
    wait_for_state(&session, SessionState::Ready).await;
    assert!(mock.accepted() >= 2);
    session.close().await.unwrap();
}
