//! 실행 엔진 시나리오 테스트
//!
//! 일시정지된 tokio 시계로 조정 주기, 종료 순서, 치명적 에러 전파를 검증합니다.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trader_core::{IntentOrigin, OrderKind, OrderStatus, Side};
use trader_exchange::{ExchangeError, StreamEvent, StreamKind};
use trader_execution::{
    Engine, EngineConfig, EngineHandle, ExecutionError, LedgerConfig, OrderConfig,
};
use trader_risk::SizingConfig;

use common::{order_update, quote, snapshot, MockGateway, BTC};

// ============================================================================
// 테스트 헬퍼 함수
// ============================================================================

struct Harness {
    gateway: Arc<MockGateway>,
    engine: Engine,
    handle: EngineHandle,
    events: mpsc::Sender<StreamEvent>,
    stream_token: CancellationToken,
}

fn harness(gateway: MockGateway) -> Harness {
    let gateway = Arc::new(gateway);
    let (events_tx, events_rx) = mpsc::channel(64);
    let stream_token = CancellationToken::new();
    *gateway.stream_token.lock().unwrap() = Some(stream_token.clone());

    let (engine, handle) = Engine::new(
        EngineConfig {
            symbols: vec![BTC.to_string()],
            ..EngineConfig::default()
        },
        LedgerConfig::default(),
        OrderConfig::default(),
        SizingConfig::default(),
        gateway.clone(),
        events_rx,
        stream_token.clone(),
    );

    Harness {
        gateway,
        engine,
        handle,
        events: events_tx,
        stream_token,
    }
}

// ============================================================================
// 조정
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_missing_fill_triggers_single_resync() {
    let gateway = MockGateway::new();
    // 54 × 0.01 / (|100 − 99| × 1) = 0.54
    *gateway.equity.lock().unwrap() = dec!(54);
    let h = harness(gateway);

    h.handle
        .open(BTC, Side::Buy, dec!(100), dec!(99), OrderKind::Market)
        .await
        .unwrap();
    let task = tokio::spawn(h.engine.run());

    // 체결 푸시 없이 락 타임아웃(5초) 경과 후 두 번째 조정 주기: 실제 0.00, 목표 0.54
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.gateway.placed_with(IntentOrigin::Resync).is_empty());
    tokio::time::sleep(Duration::from_secs(20)).await;

    let opens = h.gateway.placed_with(IntentOrigin::StrategyOpen);
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].quantity, dec!(0.54));

    let resyncs = h.gateway.placed_with(IntentOrigin::Resync);
    assert_eq!(resyncs.len(), 1);
    assert_eq!(resyncs[0].signed_quantity(), dec!(0.54));

    // 실제 포지션이 목표와 일치하면 이후 조정은 아무것도 만들지 않음
    *h.gateway.positions.lock().unwrap() = vec![snapshot(BTC, dec!(0.54))];
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(h.gateway.placed_with(IntentOrigin::Resync).len(), 1);

    h.handle.shutdown().await.unwrap();
    let summary = task.await.unwrap().unwrap();
    assert!(summary.reconcile_ticks >= 4);
    assert_eq!(summary.commands_processed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fill_pushed_before_reconcile_needs_no_resync() {
    let gateway = MockGateway::new();
    *gateway.equity.lock().unwrap() = dec!(54);
    let h = harness(gateway);

    h.handle
        .open(BTC, Side::Buy, dec!(100), dec!(99), OrderKind::Market)
        .await
        .unwrap();
    let task = tokio::spawn(h.engine.run());
    tokio::time::sleep(Duration::from_secs(1)).await;

    h.events
        .send(StreamEvent::Order(order_update(
            "ord-1",
            Side::Buy,
            OrderStatus::Filled,
            dec!(0.54),
        )))
        .await
        .unwrap();
    h.events
        .send(StreamEvent::Position(snapshot(BTC, dec!(0.54))))
        .await
        .unwrap();
    *h.gateway.positions.lock().unwrap() = vec![snapshot(BTC, dec!(0.54))];

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(h.gateway.placed_with(IntentOrigin::StrategyOpen).len(), 1);
    assert!(h.gateway.placed_with(IntentOrigin::Resync).is_empty());

    h.handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_open_with_position_blocked_before_sizing() {
    let gateway = MockGateway::new();
    *gateway.positions.lock().unwrap() = vec![snapshot(BTC, dec!(1))];
    let h = harness(gateway);

    h.handle
        .open(BTC, Side::Sell, dec!(100), dec!(101), OrderKind::Market)
        .await
        .unwrap();
    h.handle.shutdown().await.unwrap();
    h.engine.run().await.unwrap();

    assert!(h.gateway.placed_with(IntentOrigin::StrategyOpen).is_empty());
    assert_eq!(h.gateway.equity_calls.load(Ordering::SeqCst), 0);
}

// ============================================================================
// 종료
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_orders_before_closing_streams() {
    let gateway = MockGateway::new();
    *gateway.open_orders.lock().unwrap() = vec![order_update(
        "manual-1",
        Side::Sell,
        OrderStatus::Live,
        dec!(0),
    )];
    let h = harness(gateway);

    h.events
        .send(StreamEvent::Ticker(quote(dec!(100), dec!(100.1))))
        .await
        .unwrap();
    h.handle
        .open(BTC, Side::Buy, dec!(100), dec!(99), OrderKind::Maker)
        .await
        .unwrap();
    let task = tokio::spawn(h.engine.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.gateway.placed().len(), 1);
    assert!(!h.stream_token.is_cancelled());

    h.handle.shutdown().await.unwrap();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary.cancelled_orders, 2);
    assert!(!h.gateway.cancel_saw_closed_stream.load(Ordering::SeqCst));
    assert!(h.stream_token.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_external_shutdown_token() {
    let h = harness(MockGateway::new());
    let shutdown = h.engine.shutdown_token();
    let task = tokio::spawn(h.engine.run());

    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();

    assert!(task.await.unwrap().is_ok());
    assert!(h.stream_token.is_cancelled());
}

// ============================================================================
// 치명적 에러
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fatal_stream_event_stops_engine_after_cleanup() {
    let h = harness(MockGateway::new());
    let task = tokio::spawn(h.engine.run());

    h.events
        .send(StreamEvent::Fatal {
            kind: StreamKind::Private,
            error: ExchangeError::ReconnectExhausted { attempts: 10 },
        })
        .await
        .unwrap();

    let result = task.await.unwrap();
    assert_eq!(
        result.unwrap_err(),
        ExecutionError::Fatal(ExchangeError::ReconnectExhausted { attempts: 10 })
    );
    assert!(h.stream_token.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_missing_instrument_aborts_startup() {
    let gateway = MockGateway::new();
    gateway.instruments.lock().unwrap().clear();
    let h = harness(gateway);

    let result = h.engine.run().await;
    assert!(matches!(result, Err(ExecutionError::Startup(_))));
    assert!(h.stream_token.is_cancelled());
}
