//! 포지션 사이징 속성 테스트 (proptest)
//!
//! 어떤 입력이든 결과는 정확한 몫 이하이며, 에러가 아니면 최소 주문 수량 이상이고
//! 수량 증분의 배수입니다.

use proptest::prelude::*;
use rust_decimal::Decimal;
use trader_core::InstrumentSpec;
use trader_risk::{CapitalCommander, PrecisionMode, SizingError, SizingRequest};

// ============================================================================
// 입력 생성기
// ============================================================================

/// `units × 10^-scale` 형태의 양수 Decimal.
fn decimal(max_units: i64, scale: u32) -> impl Strategy<Value = Decimal> {
    (1..=max_units).prop_map(move |units| Decimal::new(units, scale))
}

fn precision() -> impl Strategy<Value = PrecisionMode> {
    prop_oneof![Just(PrecisionMode::Full), Just(PrecisionMode::Reduced)]
}

fn lot() -> impl Strategy<Value = Decimal> {
    prop_oneof![
        Just(Decimal::new(1, 3)),
        Just(Decimal::new(1, 2)),
        Just(Decimal::new(1, 1)),
        Just(Decimal::ONE),
    ]
}

proptest! {
    #[test]
    fn prop_never_exceeds_exact_quotient(
        equity in decimal(100_000_000, 2),
        entry in decimal(10_000_000, 2),
        offset in decimal(500_000, 2),
        contract_value in prop_oneof![Just(Decimal::new(1, 2)), Just(Decimal::new(1, 1)), Just(Decimal::ONE), Just(Decimal::TEN)],
        risk_bps in 1i64..=500,
        lot_size in lot(),
        min_multiple in 1i64..=10,
        mode in precision(),
    ) {
        let stop = entry + offset;
        let request = SizingRequest {
            equity,
            entry,
            stop,
            risk_fraction: Decimal::new(risk_bps, 4),
        };
        let spec = InstrumentSpec {
            symbol: "TEST-USDT-SWAP".to_string(),
            contract_value,
            lot_size,
            min_size: lot_size * Decimal::from(min_multiple),
            tick_size: Decimal::new(1, 2),
        };

        let numer = equity * request.risk_fraction;
        let denom = offset * contract_value;

        match CapitalCommander::new(mode).size(&request, &spec) {
            Ok(sized) => {
                // 정확한 몫 이하: q × denom ≤ numer
                prop_assert!(sized.quantity * denom <= numer);
                prop_assert!(sized.quantity >= spec.min_size);
                prop_assert!((sized.quantity % lot_size).is_zero());
                prop_assert!(sized.quantity <= sized.raw_quantity);
            }
            Err(SizingError::BelowMinimum { quantity, min_size }) => {
                prop_assert!(quantity < min_size);
                prop_assert!(quantity * denom <= numer);
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }

    #[test]
    fn prop_reduced_never_above_full(
        equity in decimal(10_000_000, 2),
        entry in decimal(1_000_000, 2),
        offset in decimal(100_000, 3),
    ) {
        let request = SizingRequest {
            equity,
            entry,
            stop: entry + offset,
            risk_fraction: Decimal::new(1, 2),
        };
        let spec = InstrumentSpec {
            symbol: "TEST-USDT-SWAP".to_string(),
            contract_value: Decimal::ONE,
            lot_size: Decimal::new(1, 10),
            min_size: Decimal::new(1, 10),
            tick_size: Decimal::new(1, 2),
        };

        let full = CapitalCommander::new(PrecisionMode::Full).size(&request, &spec);
        let reduced = CapitalCommander::new(PrecisionMode::Reduced).size(&request, &spec);
        if let (Ok(full), Ok(reduced)) = (full, reduced) {
            prop_assert!(reduced.raw_quantity <= full.raw_quantity);
        }
    }
}
