//! 주문 의도와 주문 상태 타입.
//!
//! `OrderIntent`는 생성부터 최종 해소(체결 확인/거부/취소)까지만 존재하는
//! 일시적인 값입니다. 실행 엔진이 이를 거래소 요청으로 변환합니다.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// 방향
// =============================================================================

/// 주문 방향.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// 매수
    Buy,
    /// 매도
    Sell,
}

impl Side {
    /// 반대 방향.
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// 부호 (매수 +1, 매도 -1).
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// 부호 있는 수량에서 방향 추론. 0이면 `None`.
    pub fn from_signed(quantity: Decimal) -> Option<Self> {
        if quantity > Decimal::ZERO {
            Some(Side::Buy)
        } else if quantity < Decimal::ZERO {
            Some(Side::Sell)
        } else {
            None
        }
    }

    /// 거래소 와이어 표기 ("buy" / "sell").
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// 주문 의도
// =============================================================================

/// 주문 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// 호가창에 남는 지정가 (post-only)
    Maker,
    /// 즉시 체결 후 잔량 취소
    ImmediateOrCancel,
    /// 시장가
    Market,
}

impl OrderKind {
    /// 가격이 필요한 주문 유형인지.
    pub fn requires_price(&self) -> bool {
        matches!(self, OrderKind::Maker | OrderKind::ImmediateOrCancel)
    }

    /// 호가창에 남는 주문인지.
    pub fn is_resting(&self) -> bool {
        matches!(self, OrderKind::Maker)
    }
}

/// 주문 의도의 출처.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentOrigin {
    /// 전략 진입
    StrategyOpen,
    /// 전략 청산
    StrategyClose,
    /// 원장 재동기화 (목표/실제 포지션 차이 보정)
    Resync,
}

/// 주문 의도.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// 의도 ID (clOrdId 생성에 사용)
    pub id: Uuid,
    /// 심볼 (예: BTC-USDT-SWAP)
    pub symbol: String,
    /// 방향
    pub side: Side,
    /// 주문 유형
    pub kind: OrderKind,
    /// 수량 (항상 양수, 계약 단위)
    pub quantity: Decimal,
    /// 가격 (지정가/IOC 전용)
    pub price: Option<Decimal>,
    /// 출처
    pub origin: IntentOrigin,
    /// 포지션 감소 전용 여부
    pub reduce_only: bool,
    /// 생성 시각
    pub created_at: DateTime<Utc>,
}

impl OrderIntent {
    /// 새 주문 의도 생성.
    ///
    /// 청산 의도는 기본적으로 `reduce_only`가 설정됩니다.
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        kind: OrderKind,
        quantity: Decimal,
        price: Option<Decimal>,
        origin: IntentOrigin,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            kind,
            quantity: quantity.abs(),
            price,
            origin,
            reduce_only: origin == IntentOrigin::StrategyClose,
            created_at: Utc::now(),
        }
    }

    /// `reduce_only` 플래그 지정.
    pub fn with_reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }

    /// 부호 있는 수량 (매수 +, 매도 -).
    pub fn signed_quantity(&self) -> Decimal {
        self.quantity * self.side.sign()
    }

    /// 거래소 clOrdId (영숫자 32자).
    pub fn client_order_id(&self) -> String {
        self.id.simple().to_string()
    }

    /// 재동기화 의도인지.
    pub fn is_resync(&self) -> bool {
        self.origin == IntentOrigin::Resync
    }
}

/// 주문 의도의 최종 해소 결과.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntentResolution {
    /// 체결 확인
    Confirmed {
        /// 체결 수량
        filled: Decimal,
    },
    /// 거부 (거래소 검증 실패, 락 타임아웃 포함)
    Rejected {
        /// 거부 사유
        reason: String,
    },
    /// 취소 (부분 체결 가능)
    Cancelled {
        /// 취소 전까지 체결된 수량
        filled: Decimal,
    },
}

// =============================================================================
// 주문 상태 업데이트
// =============================================================================

/// 거래소 주문 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// 미체결 대기
    Live,
    /// 부분 체결
    PartiallyFilled,
    /// 전량 체결
    Filled,
    /// 취소됨
    Cancelled,
}

impl OrderStatus {
    /// 거래소 상태 문자열 파싱.
    pub fn parse(state: &str) -> Option<Self> {
        match state {
            "live" => Some(OrderStatus::Live),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "canceled" | "mmp_canceled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// 더 이상 변하지 않는 상태인지.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }
}

/// 주문 상태 변경 이벤트 (스트림 푸시 또는 REST 조회).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    /// 심볼
    pub symbol: String,
    /// 거래소 주문 ID
    pub order_id: String,
    /// 클라이언트 주문 ID
    pub client_order_id: Option<String>,
    /// 방향
    pub side: Side,
    /// 상태
    pub status: OrderStatus,
    /// 주문 가격
    pub price: Option<Decimal>,
    /// 주문 수량
    pub quantity: Decimal,
    /// 누적 체결 수량
    pub filled_quantity: Decimal,
    /// 평균 체결가
    pub avg_fill_price: Option<Decimal>,
    /// 갱신 시각
    pub updated_at: DateTime<Utc>,
}

impl OrderUpdate {
    /// 부호 있는 누적 체결 수량.
    pub fn signed_filled(&self) -> Decimal {
        self.filled_quantity * self.side.sign()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_from_signed() {
        assert_eq!(Side::from_signed(dec!(0.5)), Some(Side::Buy));
        assert_eq!(Side::from_signed(dec!(-0.5)), Some(Side::Sell));
        assert_eq!(Side::from_signed(Decimal::ZERO), None);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn test_intent_quantity_always_positive() {
        let intent = OrderIntent::new(
            "BTC-USDT-SWAP",
            Side::Sell,
            OrderKind::Market,
            dec!(-0.54),
            None,
            IntentOrigin::Resync,
        );
        assert_eq!(intent.quantity, dec!(0.54));
        assert_eq!(intent.signed_quantity(), dec!(-0.54));
        assert!(!intent.reduce_only);
    }

    #[test]
    fn test_client_order_id_is_alphanumeric_32() {
        let intent = OrderIntent::new(
            "ETH-USDT-SWAP",
            Side::Buy,
            OrderKind::Maker,
            dec!(1),
            Some(dec!(2500)),
            IntentOrigin::StrategyClose,
        );
        let id = intent.client_order_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(intent.reduce_only);
    }

    #[test]
    fn test_order_status_parse() {
        assert_eq!(OrderStatus::parse("canceled"), Some(OrderStatus::Cancelled));
        assert_eq!(OrderStatus::parse("filled"), Some(OrderStatus::Filled));
        assert!(OrderStatus::parse("unknown").is_none());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
