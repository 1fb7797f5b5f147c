//! 실행 계층 테스트 공용 모의 거래소.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;
use trader_core::{
    InstrumentSpec, IntentOrigin, OrderIntent, OrderStatus, OrderUpdate, PositionSnapshot,
    PositionSource, Quote, Side,
};
use trader_exchange::{ExchangeError, ExchangeGateway, OrderAck};

pub const BTC: &str = "BTC-USDT-SWAP";

// ============================================================================
// 테스트 헬퍼 함수
// ============================================================================

pub fn btc_spec() -> InstrumentSpec {
    InstrumentSpec {
        symbol: BTC.to_string(),
        contract_value: dec!(1),
        lot_size: dec!(0.01),
        min_size: dec!(0.01),
        tick_size: dec!(0.1),
    }
}

pub fn snapshot(symbol: &str, quantity: Decimal) -> PositionSnapshot {
    PositionSnapshot {
        quantity,
        ..PositionSnapshot::flat(symbol, PositionSource::Push)
    }
}

pub fn quote(bid: Decimal, ask: Decimal) -> Quote {
    Quote {
        symbol: BTC.to_string(),
        bid,
        ask,
        last: bid,
        updated_at: Utc::now(),
    }
}

pub fn order_update(order_id: &str, side: Side, status: OrderStatus, filled: Decimal) -> OrderUpdate {
    OrderUpdate {
        symbol: BTC.to_string(),
        order_id: order_id.to_string(),
        client_order_id: None,
        side,
        status,
        price: None,
        quantity: dec!(1),
        filled_quantity: filled,
        avg_fill_price: None,
        updated_at: Utc::now(),
    }
}

// ============================================================================
// 모의 게이트웨이
// ============================================================================

#[derive(Default)]
pub struct MockGateway {
    pub instruments: Mutex<Vec<InstrumentSpec>>,
    pub positions: Mutex<Vec<PositionSnapshot>>,
    pub open_orders: Mutex<Vec<OrderUpdate>>,
    pub equity: Mutex<Decimal>,
    /// 설정되면 주문 제출이 이 에러로 실패
    pub place_error: Mutex<Option<ExchangeError>>,
    /// 설정되면 주문 제출 응답 지연
    pub place_delay: Mutex<Option<Duration>>,

    pub placed: Mutex<Vec<OrderIntent>>,
    pub amended: Mutex<Vec<(String, Decimal)>>,
    pub cancelled: Mutex<Vec<String>>,
    pub next_id: AtomicU32,
    pub equity_calls: AtomicU32,
    pub clock_refreshes: AtomicU32,

    /// 취소 호출 시점의 스트림 토큰 상태 기록용
    pub stream_token: Mutex<Option<CancellationToken>>,
    pub cancel_saw_closed_stream: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Self {
        let gateway = Self::default();
        *gateway.instruments.lock().unwrap() = vec![btc_spec()];
        *gateway.equity.lock().unwrap() = dec!(10000);
        gateway
    }

    pub fn placed(&self) -> Vec<OrderIntent> {
        self.placed.lock().unwrap().clone()
    }

    pub fn placed_with(&self, origin: IntentOrigin) -> Vec<OrderIntent> {
        self.placed()
            .into_iter()
            .filter(|i| i.origin == origin)
            .collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn fail_orders_with(&self, error: ExchangeError) {
        *self.place_error.lock().unwrap() = Some(error);
    }

    pub fn clear_failure(&self) {
        *self.place_error.lock().unwrap() = None;
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    fn venue_name(&self) -> &str {
        "mock"
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderAck, ExchangeError> {
        let delay = *self.place_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.place_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.placed.lock().unwrap().push(intent.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(OrderAck {
            order_id: format!("ord-{}", n),
            client_order_id: intent.client_order_id(),
        })
    }

    async fn amend_order(&self, _symbol: &str, order_id: &str, new_price: Decimal) -> Result<(), ExchangeError> {
        self.amended.lock().unwrap().push((order_id.to_string(), new_price));
        Ok(())
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        if let Some(token) = self.stream_token.lock().unwrap().as_ref() {
            if token.is_cancelled() {
                self.cancel_saw_closed_stream.store(true, Ordering::SeqCst);
            }
        }
        self.cancelled.lock().unwrap().push(order_id.to_string());
        Ok(())
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn fetch_open_orders(&self) -> Result<Vec<OrderUpdate>, ExchangeError> {
        Ok(self.open_orders.lock().unwrap().clone())
    }

    async fn fetch_equity(&self, _ccy: &str) -> Result<Decimal, ExchangeError> {
        self.equity_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.equity.lock().unwrap())
    }

    async fn fetch_instruments(&self) -> Result<Vec<InstrumentSpec>, ExchangeError> {
        Ok(self.instruments.lock().unwrap().clone())
    }

    async fn refresh_clock(&self) -> Result<i64, ExchangeError> {
        self.clock_refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}
