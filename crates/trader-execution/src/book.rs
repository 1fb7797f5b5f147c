//! 심볼별 목표/실제 포지션 장부.
//!
//! - `actual`은 거래소 데이터(푸시 또는 조회)로만 변경됩니다.
//! - `target`은 주문 상태 머신이 접수된 주문 의도로만 변경합니다.
//!
//! Shadow Ledger는 이 장부를 읽기만 합니다.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;
use trader_core::{MarginMode, PositionSnapshot, PositionSource, Side};

/// 심볼 하나의 포지션 기록.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionEntry {
    /// 전략 목표 수량 (부호 있음)
    pub target: Decimal,
    /// 거래소 확인 수량 (부호 있음)
    pub actual: Decimal,
    pub leverage: Option<Decimal>,
    pub margin_mode: MarginMode,
    /// 마지막 실제 수량 갱신 시각
    pub actual_updated_at: Option<DateTime<Utc>>,
    /// 마지막 갱신 출처
    pub source: Option<PositionSource>,
}

impl PositionEntry {
    /// 실제 포지션 방향.
    pub fn side(&self) -> Option<Side> {
        Side::from_signed(self.actual)
    }

    /// `target − actual`.
    pub fn delta(&self) -> Decimal {
        self.target - self.actual
    }
}

/// 포지션 장부.
#[derive(Debug, Clone, Default)]
pub struct PositionBook {
    entries: BTreeMap<String, PositionEntry>,
}

impl PositionBook {
    /// 추적 심볼을 등록한 장부 생성.
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: symbols
                .into_iter()
                .map(|s| (s.into(), PositionEntry::default()))
                .collect(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&PositionEntry> {
        self.entries.get(symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PositionEntry)> {
        self.entries.iter()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    pub fn actual(&self, symbol: &str) -> Decimal {
        self.entries.get(symbol).map(|e| e.actual).unwrap_or_default()
    }

    pub fn target(&self, symbol: &str) -> Decimal {
        self.entries.get(symbol).map(|e| e.target).unwrap_or_default()
    }

    /// 거래소 스냅샷 반영. 추적하지 않는 심볼은 무시합니다.
    ///
    /// 실제 수량이 바뀌었으면 이전 값을 반환합니다.
    pub fn apply_snapshot(&mut self, snapshot: &PositionSnapshot) -> Option<Decimal> {
        let entry = self.entries.get_mut(&snapshot.symbol)?;
        let previous = entry.actual;

        entry.actual = snapshot.quantity;
        entry.margin_mode = snapshot.margin_mode;
        if snapshot.leverage.is_some() {
            entry.leverage = snapshot.leverage;
        }
        entry.actual_updated_at = Some(snapshot.updated_at);
        entry.source = Some(snapshot.source);

        if previous != snapshot.quantity {
            debug!(
                symbol = %snapshot.symbol,
                previous = %previous,
                actual = %snapshot.quantity,
                source = ?snapshot.source,
                "실제 포지션 갱신"
            );
            Some(previous)
        } else {
            None
        }
    }

    /// REST 전체 조회 결과 반영.
    ///
    /// 조회 결과에 없는 추적 심볼은 무포지션으로 간주합니다.
    /// 실제 수량이 바뀐 심볼 목록을 반환합니다.
    pub fn apply_poll(&mut self, snapshots: &[PositionSnapshot]) -> Vec<String> {
        let mut changed = Vec::new();
        let symbols: Vec<String> = self.entries.keys().cloned().collect();

        for symbol in symbols {
            let flat;
            let snapshot = match snapshots.iter().find(|s| s.symbol == symbol) {
                Some(s) => s,
                None => {
                    flat = PositionSnapshot::flat(symbol.as_str(), PositionSource::Poll);
                    &flat
                }
            };
            if self.apply_snapshot(snapshot).is_some() {
                changed.push(symbol);
            }
        }
        changed
    }

    /// 목표 수량 설정. 주문 상태 머신 전용.
    pub(crate) fn set_target(&mut self, symbol: &str, target: Decimal) {
        if let Some(entry) = self.entries.get_mut(symbol) {
            if entry.target != target {
                debug!(symbol, previous = %entry.target, target = %target, "목표 포지션 갱신");
            }
            entry.target = target;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(symbol: &str, qty: Decimal, source: PositionSource) -> PositionSnapshot {
        PositionSnapshot {
            quantity: qty,
            ..PositionSnapshot::flat(symbol, source)
        }
    }

    #[test]
    fn test_snapshot_updates_actual_only() {
        let mut book = PositionBook::new(["BTC-USDT-SWAP"]);
        book.set_target("BTC-USDT-SWAP", dec!(1));

        let prev = book.apply_snapshot(&snapshot("BTC-USDT-SWAP", dec!(0.4), PositionSource::Push));
        assert_eq!(prev, Some(Decimal::ZERO));
        assert_eq!(book.actual("BTC-USDT-SWAP"), dec!(0.4));
        assert_eq!(book.target("BTC-USDT-SWAP"), dec!(1));
        assert_eq!(book.get("BTC-USDT-SWAP").unwrap().delta(), dec!(0.6));

        // 같은 값 재수신은 변경 아님
        assert!(book
            .apply_snapshot(&snapshot("BTC-USDT-SWAP", dec!(0.4), PositionSource::Poll))
            .is_none());
    }

    #[test]
    fn test_untracked_symbol_ignored() {
        let mut book = PositionBook::new(["BTC-USDT-SWAP"]);
        assert!(book
            .apply_snapshot(&snapshot("DOGE-USDT-SWAP", dec!(5), PositionSource::Push))
            .is_none());
        assert!(!book.is_tracked("DOGE-USDT-SWAP"));
    }

    #[test]
    fn test_poll_flattens_missing_symbols() {
        let mut book = PositionBook::new(["BTC-USDT-SWAP", "ETH-USDT-SWAP"]);
        book.apply_snapshot(&snapshot("ETH-USDT-SWAP", dec!(-2), PositionSource::Push));

        let changed = book.apply_poll(&[snapshot("BTC-USDT-SWAP", dec!(1), PositionSource::Poll)]);

        assert_eq!(changed, vec!["BTC-USDT-SWAP".to_string(), "ETH-USDT-SWAP".to_string()]);
        assert_eq!(book.actual("ETH-USDT-SWAP"), Decimal::ZERO);
        assert_eq!(book.get("BTC-USDT-SWAP").unwrap().side(), Some(Side::Buy));
    }
}
