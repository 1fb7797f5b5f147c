//! 최우선 호가 스냅샷.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 최우선 호가 (tickers 채널).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// 심볼
    pub symbol: String,
    /// 매수 1호가
    pub bid: Decimal,
    /// 매도 1호가
    pub ask: Decimal,
    /// 최종 체결가
    pub last: Decimal,
    /// 수신 시각
    pub updated_at: DateTime<Utc>,
}

impl Quote {
    /// 중간가.
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// 호가 스프레드.
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    /// 호가가 유효한지 (양수이고 역전되지 않음).
    pub fn is_valid(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO && self.ask >= self.bid
    }
}
