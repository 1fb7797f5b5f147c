//! 포지션 스냅샷.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::Side;

/// 증거금 모드.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    /// 교차 증거금
    #[default]
    Cross,
    /// 격리 증거금
    Isolated,
}

impl MarginMode {
    /// 거래소 표기 파싱. 알 수 없는 값은 교차로 간주.
    pub fn parse(value: &str) -> Self {
        match value {
            "isolated" => MarginMode::Isolated,
            _ => MarginMode::Cross,
        }
    }

    /// 거래소 표기.
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginMode::Cross => "cross",
            MarginMode::Isolated => "isolated",
        }
    }
}

/// 스냅샷 출처.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSource {
    /// 스트림 푸시
    Push,
    /// REST 주기 조회
    Poll,
}

/// 거래소가 확인한 포지션 스냅샷.
///
/// `quantity`는 부호 있는 계약 수량입니다 (롱 +, 숏 -).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// 심볼
    pub symbol: String,
    /// 부호 있는 수량
    pub quantity: Decimal,
    /// 평균 진입가
    pub avg_price: Option<Decimal>,
    /// 레버리지
    pub leverage: Option<Decimal>,
    /// 증거금 모드
    pub margin_mode: MarginMode,
    /// 출처
    pub source: PositionSource,
    /// 수신 시각
    pub updated_at: DateTime<Utc>,
}

impl PositionSnapshot {
    /// 무포지션 스냅샷.
    pub fn flat(symbol: impl Into<String>, source: PositionSource) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            avg_price: None,
            leverage: None,
            margin_mode: MarginMode::Cross,
            source,
            updated_at: Utc::now(),
        }
    }

    /// 포지션 방향. 무포지션이면 `None`.
    pub fn side(&self) -> Option<Side> {
        Side::from_signed(self.quantity)
    }

    /// 무포지션 여부.
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}
