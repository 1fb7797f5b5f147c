//! 상품(계약) 명세.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::order::Side;

/// 거래소 상품 명세.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// 심볼 (예: BTC-USDT-SWAP)
    pub symbol: String,
    /// 계약 1개당 기초자산 수량 (ctVal)
    pub contract_value: Decimal,
    /// 수량 최소 증분 (lotSz)
    pub lot_size: Decimal,
    /// 최소 주문 수량 (minSz)
    pub min_size: Decimal,
    /// 가격 최소 증분 (tickSz)
    pub tick_size: Decimal,
}

impl InstrumentSpec {
    /// 가격을 틱 단위로 정렬.
    ///
    /// 매수는 내림, 매도는 올림하여 지정가가 호가창 반대편을 넘지 않게 합니다.
    pub fn align_price(&self, price: Decimal, side: Side) -> Decimal {
        if self.tick_size <= Decimal::ZERO {
            return price;
        }
        let ticks = price / self.tick_size;
        let ticks = match side {
            Side::Buy => ticks.round_dp_with_strategy(0, RoundingStrategy::ToNegativeInfinity),
            Side::Sell => ticks.round_dp_with_strategy(0, RoundingStrategy::ToPositiveInfinity),
        };
        (ticks * self.tick_size).normalize()
    }
}
