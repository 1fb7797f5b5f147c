//! OKX 스트림 수명주기 통합 테스트
//!
//! 로컬 WebSocket 서버로 로그인 → 구독 에코 → 푸시 수신, 재연결, 무응답 감시,
//! 인증 실패 처리를 검증합니다.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use rust_decimal_macros::dec;
use serde_json::Value;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use trader_exchange::{
    connector::okx::{ConnectionState, Credentials, Session, Venue},
    ChannelArg, ExchangeError, OkxStream, StreamConfig, StreamEvent,
};

// ============================================================================
// 테스트 서버
// ============================================================================

type ServerSocket = WebSocketStream<tokio::net::TcpStream>;

/// 연결마다 `script(연결 순번, 소켓)`을 실행하는 로컬 서버.
async fn spawn_server<F, Fut>(script: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(usize, ServerSocket) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            if let Ok(ws) = accept_async(stream).await {
                tokio::spawn(script(index, ws));
            }
        }
    });

    (format!("ws://{}", addr), connections)
}

/// 다음 텍스트 프레임 (keepalive `ping`은 건너뜀).
async fn next_json(ws: &mut ServerSocket) -> Option<Value> {
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            if text == "ping" {
                continue;
            }
            return serde_json::from_str(&text).ok();
        }
    }
    None
}

/// 구독 요청의 모든 인자를 에코.
async fn echo_subscriptions(ws: &mut ServerSocket) {
    let request = next_json(ws).await.unwrap();
    assert_eq!(request["op"], "subscribe");
    for arg in request["args"].as_array().unwrap() {
        let echo = serde_json::json!({ "event": "subscribe", "arg": arg, "connId": "c0" });
        ws.send(Message::Text(echo.to_string())).await.unwrap();
    }
}

fn fast_config() -> StreamConfig {
    StreamConfig {
        reconnect_base_ms: 10,
        reconnect_cap_ms: 50,
        max_reconnect_attempts: 5,
        stale_after_ms: 2_000,
        ping_interval_ms: 500,
        handshake_timeout_ms: 2_000,
    }
}

fn session() -> Session {
    Session::new(
        Credentials::new("test-key", "test-secret", "test-pass"),
        Venue::Simulated,
    )
}

fn spawn_stream(
    stream: OkxStream,
    token: &CancellationToken,
) -> JoinHandle<Result<(), ExchangeError>> {
    tokio::spawn(stream.run(token.clone()))
}

/// 조건을 만족하는 이벤트까지 수집 (시간 제한).
async fn collect_until<P>(rx: &mut mpsc::Receiver<StreamEvent>, mut done: P) -> Vec<StreamEvent>
where
    P: FnMut(&StreamEvent) -> bool,
{
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                return;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "이벤트 대기 시간 초과: {:?}", seen);
    seen
}

fn states(events: &[StreamEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::State { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

// ============================================================================
// 테스트
// ============================================================================

#[tokio::test]
async fn test_private_login_subscribe_and_position_push() {
    let (url, _) = spawn_server(|_, mut ws| async move {
        let login = next_json(&mut ws).await.unwrap();
        assert_eq!(login["op"], "login");
        let ts = login["args"][0]["timestamp"].as_str().unwrap().to_string();
        assert!(ts.contains('.'), "로그인 타임스탬프는 epoch 초.소수: {}", ts);
        ws.send(Message::Text(r#"{"event":"login","code":"0","msg":""}"#.into()))
            .await
            .unwrap();

        echo_subscriptions(&mut ws).await;

        let push = r#"{"arg":{"channel":"positions","instType":"SWAP"},"data":[{"instId":"BTC-USDT-SWAP","pos":"0.54","avgPx":"65000","lever":"5","posSide":"net","mgnMode":"cross"}]}"#;
        ws.send(Message::Text(push.into())).await.unwrap();
        while ws.next().await.is_some() {}
    })
    .await;

    let (tx, mut rx) = mpsc::channel(64);
    let token = CancellationToken::new();
    let stream = OkxStream::private(
        url,
        session(),
        vec![ChannelArg::positions(), ChannelArg::orders()],
        fast_config(),
        tx,
    );
    let handle = spawn_stream(stream, &token);

    let events = collect_until(&mut rx, |e| matches!(e, StreamEvent::Position(_))).await;

    let seen = states(&events);
    assert!(seen.contains(&ConnectionState::Authenticating));
    assert!(seen.contains(&ConnectionState::Subscribed));
    let Some(StreamEvent::Position(snap)) = events.last() else {
        panic!("position event expected");
    };
    assert_eq!(snap.quantity, dec!(0.54));

    token.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_reconnects_after_drop_and_restores_subscriptions() {
    let (url, connections) = spawn_server(|index, mut ws| async move {
        if index == 0 {
            // 첫 연결은 바로 끊음
            let _ = ws.close(None).await;
            return;
        }
        echo_subscriptions(&mut ws).await;
        let push = r#"{"arg":{"channel":"tickers","instId":"BTC-USDT-SWAP"},"data":[{"instId":"BTC-USDT-SWAP","bidPx":"64999.9","askPx":"65000","last":"65000","ts":"1704067200000"}]}"#;
        ws.send(Message::Text(push.into())).await.unwrap();
        while ws.next().await.is_some() {}
    })
    .await;

    let (tx, mut rx) = mpsc::channel(64);
    let token = CancellationToken::new();
    let stream = OkxStream::public(
        url,
        vec![ChannelArg::tickers("BTC-USDT-SWAP")],
        fast_config(),
        tx,
    );
    let handle = spawn_stream(stream, &token);

    let events = collect_until(&mut rx, |e| matches!(e, StreamEvent::Ticker(_))).await;

    assert!(connections.load(Ordering::SeqCst) >= 2);
    let seen = states(&events);
    let dropped = seen
        .iter()
        .position(|s| *s == ConnectionState::Disconnected)
        .expect("끊김 상태가 보고되어야 함");
    assert!(seen[dropped..].contains(&ConnectionState::Subscribed));

    token.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_silent_connection_is_recycled_by_watchdog() {
    let (url, connections) = spawn_server(|_, mut ws| async move {
        echo_subscriptions(&mut ws).await;
        // 이후 아무 응답도 하지 않음 (ping 무시)
        while ws.next().await.is_some() {}
    })
    .await;

    let (tx, mut rx) = mpsc::channel(64);
    let token = CancellationToken::new();
    let config = StreamConfig {
        stale_after_ms: 200,
        ping_interval_ms: 10_000,
        ..fast_config()
    };
    let stream = OkxStream::public(url, vec![ChannelArg::tickers("ETH-USDT-SWAP")], config, tx);
    let handle = spawn_stream(stream, &token);

    // 구독 → 무응답 → 끊김 → 재구독
    let mut subscribed = 0;
    collect_until(&mut rx, |e| {
        if matches!(
            e,
            StreamEvent::State {
                state: ConnectionState::Subscribed,
                ..
            }
        ) {
            subscribed += 1;
        }
        subscribed >= 2
    })
    .await;

    assert!(connections.load(Ordering::SeqCst) >= 2);
    token.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_login_failure_is_fatal() {
    let (url, connections) = spawn_server(|_, mut ws| async move {
        let _login = next_json(&mut ws).await;
        ws.send(Message::Text(
            r#"{"event":"error","code":"60009","msg":"Login failed."}"#.into(),
        ))
        .await
        .unwrap();
        while ws.next().await.is_some() {}
    })
    .await;

    let (tx, mut rx) = mpsc::channel(64);
    let token = CancellationToken::new();
    let stream = OkxStream::private(
        url,
        session(),
        vec![ChannelArg::positions()],
        fast_config(),
        tx,
    );
    let handle = spawn_stream(stream, &token);

    let events = collect_until(&mut rx, |e| matches!(e, StreamEvent::Fatal { .. })).await;
    let Some(StreamEvent::Fatal { error, .. }) = events.last() else {
        panic!("fatal event expected");
    };
    assert!(matches!(error, ExchangeError::Authentication(_)));

    let result = handle.await.unwrap();
    assert!(result.unwrap_err().is_fatal());
    // 인증 실패는 재연결하지 않음
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}
