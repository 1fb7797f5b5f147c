//! 실행 계층 에러 타입.

use rust_decimal::Decimal;
use thiserror::Error;
use trader_exchange::ExchangeError;
use trader_risk::SizingError;

use crate::locks::LockPurpose;
use crate::order_fsm::Phase;

/// 주문 시도 거부 사유.
///
/// 거부는 에러가 아니라 호출자가 판단할 결과입니다. 엔진은 이를 로그로 남기고
/// 다음 명령을 처리합니다.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    /// 포지션 보유 중 신규 진입 차단
    #[error("{symbol}: 포지션 보유 중 신규 진입 차단 (actual={actual})")]
    ValveClosed { symbol: String, actual: Decimal },

    /// 다른 단계 진행 중
    #[error("{symbol}: 진행 중인 단계 {phase:?}")]
    Busy { symbol: String, phase: Phase },

    /// 락 획득 실패 (대기하지 않음)
    #[error("{symbol}: {purpose:?} 락 이미 보유 중")]
    Locked { symbol: String, purpose: LockPurpose },

    /// 락 타임아웃으로 시도 포기
    #[error("{symbol}: 락 타임아웃 ({waited_ms}ms), 시도 포기")]
    LockTimeout { symbol: String, waited_ms: u64 },

    /// 격리된 심볼 (비정상 상태 리셋 후 운영자 확인 대기)
    #[error("{0}: 격리 상태, 운영자 확인 필요")]
    Quarantined(String),

    #[error("{0}: 청산할 포지션 없음")]
    NothingToClose(String),

    #[error("{0}: 호가 없음")]
    NoQuote(String),

    #[error("{0}: 상품 명세 없음")]
    UnknownInstrument(String),

    #[error("사이징 실패: {0}")]
    Sizing(#[from] SizingError),

    #[error("거래소 거부: {0}")]
    Exchange(#[from] ExchangeError),
}

impl Rejection {
    /// 연결을 유지할 수 없는 치명적 거부인지.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Rejection::Exchange(e) if e.is_fatal())
    }
}

/// 엔진 에러.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    /// 치명적 거래소 에러 (인증 실패, 재연결 소진 등)
    #[error("치명적 거래소 에러: {0}")]
    Fatal(ExchangeError),

    /// 시작 단계 실패
    #[error("엔진 시작 실패: {0}")]
    Startup(String),

    /// 명령 채널 닫힘
    #[error("엔진이 종료됨")]
    EngineStopped,
}
