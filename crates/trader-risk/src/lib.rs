//! 포지션 사이징 (Capital Commander).
//!
//! `quantity = (equity × risk_fraction) / (|entry − stop| × contract_value)`를
//! 10진 고정소수점으로 계산합니다. 반올림은 항상 0 방향 절사이며,
//! 결과는 거래소 수량 증분(lotSz)으로 내림한 뒤 최소 주문 수량(minSz)과 비교합니다.
//!
//! # 예제
//!
//! ```rust,ignore
//! use trader_risk::{CapitalCommander, PrecisionMode, SizingRequest};
//!
//! let commander = CapitalCommander::new(PrecisionMode::Full);
//! let sized = commander.size(&request, &instrument)?;
//! ```

pub mod sizing;

pub use sizing::{
    floor_to_step, truncated_quotient, CapitalCommander, PrecisionMode, SizingConfig,
    SizingError, SizingRequest, SizingResult,
};
