//! 심볼 락과 락 타임아웃 집계.
//!
//! 심볼·목적(진입/청산)마다 락은 최대 하나입니다. 두 번째 획득 시도는
//! 대기열에 들어가지 않고 즉시 거부됩니다. 락은 타임아웃이 지나면 강제 해제됩니다.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

/// 락 목적.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPurpose {
    Open,
    Close,
}

/// 보유 중인 락.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolLock {
    pub purpose: LockPurpose,
    /// 락을 잡은 주문 의도
    pub intent_id: Uuid,
    pub acquired_at: Instant,
}

/// 만료로 강제 해제된 락.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredLock {
    pub symbol: String,
    pub lock: SymbolLock,
    pub held_for: Duration,
}

/// 심볼 락 테이블.
#[derive(Debug)]
pub struct SymbolLocks {
    timeout: Duration,
    held: HashMap<(String, LockPurpose), SymbolLock>,
}

impl SymbolLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            held: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 락 획득 시도.
    ///
    /// 이미 보유 중이면 기존 락을 `Err`로 돌려줍니다. 만료된 락은 먼저 정리합니다.
    pub fn try_acquire(
        &mut self,
        symbol: &str,
        purpose: LockPurpose,
        intent_id: Uuid,
        now: Instant,
    ) -> Result<(), SymbolLock> {
        let key = (symbol.to_string(), purpose);
        if let Some(existing) = self.held.get(&key) {
            if now.saturating_duration_since(existing.acquired_at) < self.timeout {
                return Err(existing.clone());
            }
            warn!(symbol, purpose = ?purpose, intent_id = %existing.intent_id, "만료된 락 강제 해제 후 재획득");
        }
        self.held.insert(
            key,
            SymbolLock {
                purpose,
                intent_id,
                acquired_at: now,
            },
        );
        Ok(())
    }

    pub fn release(&mut self, symbol: &str, purpose: LockPurpose) -> Option<SymbolLock> {
        self.held.remove(&(symbol.to_string(), purpose))
    }

    /// 심볼에 어떤 목적이든 락이 있는지.
    pub fn is_locked(&self, symbol: &str) -> bool {
        self.held.keys().any(|(s, _)| s == symbol)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// 만료된 락을 강제 해제하고 목록을 반환.
    ///
    /// 각 락은 한 번만 보고됩니다.
    pub fn expire(&mut self, now: Instant) -> Vec<ExpiredLock> {
        let timeout = self.timeout;
        let expired_keys: Vec<(String, LockPurpose)> = self
            .held
            .iter()
            .filter(|(_, lock)| now.saturating_duration_since(lock.acquired_at) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();

        expired_keys
            .into_iter()
            .filter_map(|key| {
                let lock = self.held.remove(&key)?;
                let held_for = now.saturating_duration_since(lock.acquired_at);
                warn!(
                    symbol = %key.0,
                    purpose = ?key.1,
                    intent_id = %lock.intent_id,
                    held_ms = held_for.as_millis() as u64,
                    "락 만료, 진행 중인 시도 포기 (거부 처리)"
                );
                Some(ExpiredLock {
                    symbol: key.0,
                    lock,
                    held_for,
                })
            })
            .collect()
    }

    /// 모든 락 해제 (종료 시).
    pub fn release_all(&mut self) -> usize {
        let count = self.held.len();
        self.held.clear();
        count
    }
}

// ============================================================================
// 락 타임아웃 집계
// ============================================================================

/// 구간 내 락 타임아웃 횟수가 임계치를 넘으면 운영자 경보.
///
/// 단발성 경합이 아닌 네트워크 장애를 드러내기 위한 집계입니다.
#[derive(Debug)]
pub struct LockTimeoutMonitor {
    window: Duration,
    threshold: u32,
    events: VecDeque<Instant>,
}

impl LockTimeoutMonitor {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            events: VecDeque::new(),
        }
    }

    /// 타임아웃 1건 기록. 경보를 냈으면 true.
    pub fn record(&mut self, symbol: &str, now: Instant) -> bool {
        self.events.push_back(now);
        while let Some(front) = self.events.front() {
            if now.saturating_duration_since(*front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }

        let count = self.events.len() as u32;
        if count > self.threshold {
            error!(
                target: "operator_alert",
                symbol,
                count,
                window_secs = self.window.as_secs(),
                "락 타임아웃 빈발, 네트워크 상태 확인 필요"
            );
            self.events.clear();
            return true;
        }
        false
    }

    pub fn recent(&self) -> usize {
        self.events.len()
    }
}
