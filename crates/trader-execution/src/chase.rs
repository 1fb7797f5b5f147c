//! 지정가 추격(재호가) 정책.
//!
//! 호가창에 남은 주문은 다음 두 조건을 모두 만족할 때만 재호가합니다.
//! 1. 마지막 재호가 이후 최소 대기 시간 경과
//! 2. 시장가가 주문의 **최초** 가격에서 최소 거리 이상 이동
//!
//! 시장이 최대 추격 거리를 넘어가면 추격을 중단하고 즉시 청산으로 전환합니다.

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::Instant;
use trader_core::{InstrumentSpec, Quote, Side};

use crate::config::OrderConfig;
use crate::locks::LockPurpose;

// ============================================================================
// 대기 주문 기록
// ============================================================================

/// 심볼의 현재 대기(메이커) 주문.
#[derive(Debug, Clone, PartialEq)]
pub struct RestingOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub side: Side,
    /// 진입 주문인지 청산 주문인지
    pub purpose: LockPurpose,
    pub quantity: Decimal,
    /// 누적 체결 수량
    pub filled: Decimal,
    /// 최초 주문가 (추격 거리 기준)
    pub original_price: Decimal,
    pub current_price: Decimal,
    /// 주문 시각 또는 마지막 재호가 시각
    pub last_reprice_at: Instant,
    /// 접수 직전 목표 수량 (취소 시 복원용)
    pub prior_target: Decimal,
}

impl RestingOrder {
    /// 최초 가격 대비 이동 비율.
    pub fn distance_from_original(&self, market_price: Decimal) -> Decimal {
        if self.original_price.is_zero() {
            return Decimal::ZERO;
        }
        (market_price - self.original_price).abs() / self.original_price
    }

    pub fn matches(&self, order_id: &str, client_order_id: Option<&str>) -> bool {
        self.order_id == order_id || client_order_id == Some(self.client_order_id.as_str())
    }
}

// ============================================================================
// 정책
// ============================================================================

/// 재호가 보류 사유.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    /// 최소 대기 시간 미달
    Dwell,
    /// 이동 거리 미달
    Distance,
    /// 새 가격이 현재 가격과 같음
    Unchanged,
}

/// 추격 판단 결과.
#[derive(Debug, Clone, PartialEq)]
pub enum ChaseDecision {
    Hold(HoldReason),
    Reprice(Decimal),
    /// 추격 상한 초과
    Escalate { distance: Decimal },
}

/// 추격 정책.
#[derive(Debug, Clone)]
pub struct ChasePolicy {
    pub min_dwell: Duration,
    pub min_distance: Decimal,
    pub max_distance: Decimal,
    pub aggressive_spread_ticks: u32,
}

impl ChasePolicy {
    pub fn from_config(config: &OrderConfig) -> Self {
        Self {
            min_dwell: config.min_dwell(),
            min_distance: config.min_chase_distance,
            max_distance: config.max_chase_distance,
            aggressive_spread_ticks: config.aggressive_spread_ticks,
        }
    }

    /// 메이커 호가 계산.
    ///
    /// 스프레드가 `aggressive_spread_ticks`틱을 넘으면 한 틱 안쪽
    /// (매수 bid + tick, 매도 ask − tick), 아니면 최우선 호가에 붙습니다.
    pub fn maker_price(&self, quote: &Quote, side: Side, instrument: &InstrumentSpec) -> Option<Decimal> {
        if !quote.is_valid() {
            return None;
        }
        let tick = instrument.tick_size;
        let wide = tick > Decimal::ZERO
            && quote.spread() > tick * Decimal::from(self.aggressive_spread_ticks);

        let raw = match (side, wide) {
            (Side::Buy, true) => quote.bid + tick,
            (Side::Buy, false) => quote.bid,
            (Side::Sell, true) => quote.ask - tick,
            (Side::Sell, false) => quote.ask,
        };
        Some(instrument.align_price(raw, side))
    }

    /// 대기 주문 재호가 판단.
    pub fn evaluate(&self, order: &RestingOrder, market_price: Decimal, now: Instant) -> ChaseDecision {
        let distance = order.distance_from_original(market_price);
        if distance > self.max_distance {
            return ChaseDecision::Escalate { distance };
        }

        if now.saturating_duration_since(order.last_reprice_at) < self.min_dwell {
            return ChaseDecision::Hold(HoldReason::Dwell);
        }
        if distance <= self.min_distance {
            return ChaseDecision::Hold(HoldReason::Distance);
        }
        if market_price == order.current_price {
            return ChaseDecision::Hold(HoldReason::Unchanged);
        }
        ChaseDecision::Reprice(market_price)
    }
}
