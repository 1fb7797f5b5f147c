//! 거래소 게이트웨이 trait.
//!
//! 실행 엔진은 이 trait만 의존하므로 테스트에서는 모의 구현으로 교체할 수 있습니다.

use async_trait::async_trait;
use rust_decimal::Decimal;
use trader_core::{InstrumentSpec, OrderIntent, OrderUpdate, PositionSnapshot};

use crate::ExchangeError;

/// 주문 접수 응답.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    /// 거래소 주문 ID
    pub order_id: String,
    /// 클라이언트 주문 ID
    pub client_order_id: String,
}

/// 서명된 거래소 호출.
///
/// # Errors
///
/// - `ExchangeError::Authentication` / `EnvironmentMismatch`: 치명적, 재시도 금지
/// - `ExchangeError::OrderRejected`: 거래소 검증 실패, 같은 인자로 재시도 금지
/// - `ExchangeError::NetworkError`: 구현체가 백오프 재시도 후 반환
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// venue 이름 (로그용).
    fn venue_name(&self) -> &str;

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderAck, ExchangeError>;

    async fn amend_order(
        &self,
        symbol: &str,
        order_id: &str,
        new_price: Decimal,
    ) -> Result<(), ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    /// 심볼별 포지션 (REST 조회).
    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, ExchangeError>;

    /// 미체결 주문.
    async fn fetch_open_orders(&self) -> Result<Vec<OrderUpdate>, ExchangeError>;

    /// 통화별 자산 평가액.
    async fn fetch_equity(&self, ccy: &str) -> Result<Decimal, ExchangeError>;

    async fn fetch_instruments(&self) -> Result<Vec<InstrumentSpec>, ExchangeError>;

    /// 시계 재보정. 적용된 오프셋(ms)을 반환합니다.
    async fn refresh_clock(&self) -> Result<i64, ExchangeError>;
}
