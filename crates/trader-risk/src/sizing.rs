//! 정밀도 안전 포지션 사이징.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use trader_core::InstrumentSpec;

// ============================================================================
// 에러
// ============================================================================

/// 사이징 에러.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingError {
    /// 입력 검증 실패
    #[error("잘못된 사이징 입력: {0}")]
    InvalidInput(String),

    /// 계산 수량이 거래소 최소 주문 수량 미만
    #[error("최소 주문 수량 미달: 계산값 {quantity} < 최소 {min_size}")]
    BelowMinimum { quantity: Decimal, min_size: Decimal },

    /// 10진 연산 범위 초과
    #[error("사이징 연산 범위 초과: {0}")]
    Overflow(&'static str),
}

// ============================================================================
// 설정
// ============================================================================

/// 유지 자릿수 모드.
///
/// 모드는 자릿수 폭만 바꾸며 반올림 방향(0 방향 절사)은 같습니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionMode {
    /// 소수점 10자리 유지 (실거래)
    #[default]
    Full,
    /// 소수점 4자리 유지 (모의거래)
    Reduced,
}

impl PrecisionMode {
    /// 유지할 소수 자릿수.
    pub fn scale(&self) -> u32 {
        match self {
            PrecisionMode::Full => 10,
            PrecisionMode::Reduced => 4,
        }
    }
}

/// 사이징 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// 거래당 위험 비율 (0, 1]
    pub risk_fraction: Decimal,
    /// 유지 자릿수 모드
    pub precision: PrecisionMode,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            risk_fraction: Decimal::new(1, 2),
            precision: PrecisionMode::Full,
        }
    }
}

// ============================================================================
// 입력/출력
// ============================================================================

/// 사이징 입력. 계약 가치는 상품 명세(`InstrumentSpec::contract_value`)에서 읽습니다.
#[derive(Debug, Clone, PartialEq)]
pub struct SizingRequest {
    /// 계좌 평가액
    pub equity: Decimal,
    /// 진입가
    pub entry: Decimal,
    /// 손절가
    pub stop: Decimal,
    /// 거래당 위험 비율
    pub risk_fraction: Decimal,
}

/// 사이징 결과.
#[derive(Debug, Clone, PartialEq)]
pub struct SizingResult {
    /// 거래소 주문 가능 수량 (lotSz 배수, minSz 이상)
    pub quantity: Decimal,
    /// 증분 정렬 전 절사 수량
    pub raw_quantity: Decimal,
    /// 위험 금액 (equity × risk_fraction)
    pub risk_amount: Decimal,
}

// ============================================================================
// 순수 연산
// ============================================================================

/// `numer / denom`을 `scale` 자리에서 0 방향 절사.
///
/// 28자리 나눗셈이 마지막 자리에서 올림된 경우에도 결과가 정확한 몫을
/// 넘지 않도록 `result × denom > numer`이면 한 단위를 뺍니다.
/// 두 인자 모두 양수여야 합니다.
pub fn truncated_quotient(numer: Decimal, denom: Decimal, scale: u32) -> Result<Decimal, SizingError> {
    let quotient = numer
        .checked_div(denom)
        .ok_or(SizingError::Overflow("나눗셈"))?;
    let mut truncated = quotient.round_dp_with_strategy(scale, RoundingStrategy::ToZero);
    let unit = Decimal::new(1, scale);

    while truncated > Decimal::ZERO {
        match truncated.checked_mul(denom) {
            Some(product) if product > numer => truncated -= unit,
            _ => break,
        }
    }
    Ok(truncated.max(Decimal::ZERO))
}

/// `value`를 `step`의 배수로 내림 (양수 전제).
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO || value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let steps = (value / step).trunc();
    let floored = steps * step;
    if floored > value {
        floored - step
    } else {
        floored
    }
}

// ============================================================================
// Capital Commander
// ============================================================================

/// 포지션 사이저.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapitalCommander {
    precision: PrecisionMode,
}

impl CapitalCommander {
    pub fn new(precision: PrecisionMode) -> Self {
        Self { precision }
    }

    pub fn precision(&self) -> PrecisionMode {
        self.precision
    }

    /// 거래소 주문 가능 수량 계산.
    ///
    /// # Errors
    ///
    /// - `SizingError::InvalidInput`: 평가액 ≤ 0, 위험 비율이 (0, 1] 밖, 진입가 = 손절가 등
    /// - `SizingError::BelowMinimum`: 절사 후 수량이 최소 주문 수량 미만 (0 포함)
    pub fn size(
        &self,
        request: &SizingRequest,
        instrument: &InstrumentSpec,
    ) -> Result<SizingResult, SizingError> {
        validate(request, instrument)?;

        let risk_amount = request
            .equity
            .checked_mul(request.risk_fraction)
            .ok_or(SizingError::Overflow("위험 금액"))?;
        let distance = (request.entry - request.stop).abs();
        let denom = distance
            .checked_mul(instrument.contract_value)
            .ok_or(SizingError::Overflow("손절 거리 × 계약 가치"))?;

        let raw_quantity = truncated_quotient(risk_amount, denom, self.precision.scale())?;
        let quantity = floor_to_step(raw_quantity, instrument.lot_size).normalize();

        debug!(
            symbol = %instrument.symbol,
            risk_amount = %risk_amount,
            raw_quantity = %raw_quantity,
            quantity = %quantity,
            precision = ?self.precision,
            "포지션 사이징"
        );

        if quantity.is_zero() || quantity < instrument.min_size {
            return Err(SizingError::BelowMinimum {
                quantity,
                min_size: instrument.min_size,
            });
        }

        Ok(SizingResult {
            quantity,
            raw_quantity,
            risk_amount,
        })
    }
}

fn validate(request: &SizingRequest, instrument: &InstrumentSpec) -> Result<(), SizingError> {
    let invalid = |msg: &str| Err(SizingError::InvalidInput(msg.to_string()));

    if request.equity <= Decimal::ZERO {
        return invalid("평가액은 양수여야 함");
    }
    if request.risk_fraction <= Decimal::ZERO || request.risk_fraction > Decimal::ONE {
        return invalid("위험 비율은 (0, 1] 범위여야 함");
    }
    if request.entry <= Decimal::ZERO || request.stop <= Decimal::ZERO {
        return invalid("진입가/손절가는 양수여야 함");
    }
    if request.entry == request.stop {
        return invalid("진입가와 손절가가 같음");
    }
    if instrument.contract_value <= Decimal::ZERO {
        return invalid("계약 가치는 양수여야 함");
    }
    if instrument.lot_size <= Decimal::ZERO {
        return invalid("수량 증분은 양수여야 함");
    }
    Ok(())
}
