//! 실행 계층 설정.
//!
//! 모든 필드는 명시적 기본값을 가지며 시간 값은 `*_ms`/`*_secs` 정수로 저장합니다.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

// ============================================================================
// 원장
// ============================================================================

/// Shadow Ledger 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// 조정 주기 (초)
    pub interval_secs: u64,
    /// 허용 불일치 비율 (기본 10%)
    pub tolerance: Decimal,
    /// 목표 0 근처 나눗셈 보호값
    pub epsilon: Decimal,
    /// 심볼별 재동기화 쿨다운 (밀리초)
    pub cooldown_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 20,
            tolerance: Decimal::new(10, 2),
            epsilon: Decimal::new(1, 8),
            cooldown_ms: 60_000,
        }
    }
}

impl LedgerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

// ============================================================================
// 주문 상태 머신
// ============================================================================

/// 주문 상태 머신 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    /// 심볼 락 타임아웃 (밀리초)
    pub lock_timeout_ms: u64,
    /// 재호가 전 최소 대기 (밀리초)
    pub min_dwell_ms: u64,
    /// 재호가 최소 이동 비율 (원 주문가 대비)
    pub min_chase_distance: Decimal,
    /// 추격 상한 비율. 초과 시 즉시 청산으로 전환
    pub max_chase_distance: Decimal,
    /// 스프레드가 이 틱 수를 넘으면 한 틱 안쪽으로 호가
    pub aggressive_spread_ticks: u32,
    /// 연속 청산 실패 허용 횟수
    pub close_failure_limit: u32,
    /// 락 타임아웃 경보 임계 횟수
    pub lock_timeout_alert_threshold: u32,
    /// 락 타임아웃 집계 구간 (초)
    pub lock_timeout_window_secs: u64,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            min_dwell_ms: 2_000,
            min_chase_distance: Decimal::new(5, 3),
            max_chase_distance: Decimal::new(3, 2),
            aggressive_spread_ticks: 2,
            close_failure_limit: 3,
            lock_timeout_alert_threshold: 3,
            lock_timeout_window_secs: 60,
        }
    }
}

impl OrderConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn min_dwell(&self) -> Duration {
        Duration::from_millis(self.min_dwell_ms)
    }

    pub fn lock_timeout_window(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_window_secs)
    }
}

// ============================================================================
// 엔진
// ============================================================================

/// 엔진 루프 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 거래 심볼 목록
    pub symbols: Vec<String>,
    /// 평가액 조회 통화
    pub equity_currency: String,
    /// 추격 검사 주기 (밀리초)
    pub chase_interval_ms: u64,
    /// 시계 재보정 주기 (초)
    pub clock_refresh_secs: u64,
    /// 종료 시 주문 취소 확인 대기 (밀리초)
    pub cancel_timeout_ms: u64,
    /// 명령 채널 버퍼
    pub command_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTC-USDT-SWAP".to_string()],
            equity_currency: "USDT".to_string(),
            chase_interval_ms: 500,
            clock_refresh_secs: 300,
            cancel_timeout_ms: 5_000,
            command_buffer: 64,
        }
    }
}

impl EngineConfig {
    pub fn chase_interval(&self) -> Duration {
        Duration::from_millis(self.chase_interval_ms)
    }

    pub fn clock_refresh(&self) -> Duration {
        Duration::from_secs(self.clock_refresh_secs)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}
