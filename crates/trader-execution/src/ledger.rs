//! Shadow Ledger (포지션 조정 엔진).
//!
//! 주기적으로 심볼별 `delta = target − actual`을 계산하고,
//! `|delta| / max(|target|, ε)`가 허용 비율을 넘으면 차이를 정확히 메우는
//! 재동기화 주문 의도를 만듭니다. 장부는 읽기만 합니다.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, warn};
use trader_core::{IntentOrigin, OrderIntent, OrderKind, Side};

use crate::book::PositionBook;
use crate::config::LedgerConfig;

/// 포지션 조정기.
#[derive(Debug)]
pub struct ShadowLedger {
    config: LedgerConfig,
    /// 심볼별 마지막 재동기화 시각
    last_resync: HashMap<String, Instant>,
}

impl ShadowLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            last_resync: HashMap::new(),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// 불일치 비율 `|delta| / max(|target|, ε)`.
    pub fn mismatch_ratio(&self, target: Decimal, actual: Decimal) -> Decimal {
        let denom = target.abs().max(self.config.epsilon);
        (target - actual).abs() / denom
    }

    /// 조정 1회 수행.
    ///
    /// `is_blocked`가 true인 심볼(진행 중인 주문, 격리 상태)은 건너뜁니다.
    /// 허용 범위 내 심볼은 아무것도 만들지 않습니다.
    pub fn reconcile<F>(&mut self, book: &PositionBook, now: Instant, is_blocked: F) -> Vec<OrderIntent>
    where
        F: Fn(&str) -> bool,
    {
        let mut intents = Vec::new();

        for (symbol, entry) in book.iter() {
            let delta = entry.delta();
            if delta.is_zero() {
                continue;
            }

            let ratio = self.mismatch_ratio(entry.target, entry.actual);
            if ratio <= self.config.tolerance {
                continue;
            }

            if is_blocked(symbol) {
                debug!(symbol = %symbol, delta = %delta, "진행 중인 심볼, 조정 보류");
                continue;
            }

            if let Some(last) = self.last_resync.get(symbol) {
                if now.saturating_duration_since(*last) < self.config.cooldown() {
                    debug!(symbol = %symbol, delta = %delta, "재동기화 쿨다운 중");
                    continue;
                }
            }

            let Some(side) = Side::from_signed(delta) else {
                continue;
            };
            let mismatch_pct = (ratio * Decimal::ONE_HUNDRED).round_dp(2);

            warn!(
                symbol = %symbol,
                target = %entry.target,
                actual = %entry.actual,
                delta = %delta,
                mismatch_pct = %mismatch_pct,
                "포지션 불일치 감지, 재동기화 주문 생성"
            );

            // 반대 방향이고 보유 수량 이하면 감소 전용
            let reduces = entry.side() == Some(side.opposite()) && delta.abs() <= entry.actual.abs();
            let intent = OrderIntent::new(
                symbol.as_str(),
                side,
                OrderKind::Market,
                delta.abs(),
                None,
                IntentOrigin::Resync,
            )
            .with_reduce_only(reduces);

            self.last_resync.insert(symbol.clone(), now);
            intents.push(intent);
        }

        intents
    }

    /// 심볼 쿨다운 해제 (격리 해제 등).
    pub fn clear_cooldown(&mut self, symbol: &str) {
        self.last_resync.remove(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use trader_core::{PositionSnapshot, PositionSource};

    const BTC: &str = "BTC-USDT-SWAP";

    fn book_with(target: Decimal, actual: Decimal) -> PositionBook {
        let mut book = PositionBook::new([BTC]);
        book.set_target(BTC, target);
        book.apply_snapshot(&PositionSnapshot {
            quantity: actual,
            ..PositionSnapshot::flat(BTC, PositionSource::Poll)
        });
        book
    }

    #[test]
    fn test_mismatch_ratio() {
        let ledger = ShadowLedger::new(LedgerConfig::default());
        assert_eq!(ledger.mismatch_ratio(dec!(0.54), dec!(0)), dec!(1));
        assert_eq!(ledger.mismatch_ratio(dec!(1), dec!(0.95)), dec!(0.05));
    }

    #[test]
    fn test_resync_for_missing_position() {
        let book = book_with(dec!(0.54), dec!(0));
        let mut ledger = ShadowLedger::new(LedgerConfig::default());

        let intents = ledger.reconcile(&book, Instant::now(), |_| false);

        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].signed_quantity(), dec!(0.54));
        assert_eq!(intents[0].origin, IntentOrigin::Resync);
        assert_eq!(intents[0].kind, OrderKind::Market);
        assert!(!intents[0].reduce_only);
    }

    #[test]
    fn test_within_tolerance_emits_nothing() {
        let book = book_with(dec!(1), dec!(0.95));
        let mut ledger = ShadowLedger::new(LedgerConfig::default());

        assert!(ledger.reconcile(&book, Instant::now(), |_| false).is_empty());
        assert!(ledger.reconcile(&book, Instant::now(), |_| false).is_empty());
    }

    #[test]
    fn test_excess_position_resync_is_reduce_only() {
        let book = book_with(dec!(1), dec!(1.5));
        let mut ledger = ShadowLedger::new(LedgerConfig::default());

        let intents = ledger.reconcile(&book, Instant::now(), |_| false);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, Side::Sell);
        assert_eq!(intents[0].quantity, dec!(0.5));
        assert!(intents[0].reduce_only);
    }

    #[test]
    fn test_flip_through_zero_is_not_reduce_only() {
        // 목표 숏, 실제 롱: 차이가 보유량보다 큼
        let book = book_with(dec!(-1), dec!(0.5));
        let mut ledger = ShadowLedger::new(LedgerConfig::default());

        let intents = ledger.reconcile(&book, Instant::now(), |_| false);
        assert_eq!(intents[0].signed_quantity(), dec!(-1.5));
        assert!(!intents[0].reduce_only);
    }

    #[test]
    fn test_cooldown_suppresses_repeat() {
        let book = book_with(dec!(2), dec!(0));
        let mut ledger = ShadowLedger::new(LedgerConfig {
            cooldown_ms: 30_000,
            ..LedgerConfig::default()
        });
        let start = Instant::now();

        assert_eq!(ledger.reconcile(&book, start, |_| false).len(), 1);
        assert!(ledger
            .reconcile(&book, start + Duration::from_secs(10), |_| false)
            .is_empty());
        assert_eq!(
            ledger
                .reconcile(&book, start + Duration::from_secs(31), |_| false)
                .len(),
            1
        );
    }

    #[test]
    fn test_blocked_symbol_skipped_without_cooldown() {
        let book = book_with(dec!(2), dec!(0));
        let mut ledger = ShadowLedger::new(LedgerConfig::default());
        let now = Instant::now();

        assert!(ledger.reconcile(&book, now, |s| s == BTC).is_empty());
        // 보류는 쿨다운을 시작하지 않음
        assert_eq!(ledger.reconcile(&book, now, |_| false).len(), 1);
    }
}
