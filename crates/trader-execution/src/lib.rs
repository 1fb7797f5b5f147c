//! 주문 실행 및 포지션 조정.
//!
//! 이 crate는 다음을 제공합니다:
//! - 목표/실제 포지션 장부 (`PositionBook`)
//! - 주기적 포지션 조정 (`ShadowLedger`)
//! - 심볼 락, 원웨이 밸브, 지정가 추격을 포함한 주문 상태 머신
//! - 단일 태스크 실행 엔진과 순서 있는 종료
//!
//! # 예제
//!
//! ```rust,ignore
//! use trader_execution::{Engine, EngineConfig, LedgerConfig, OrderConfig};
//!
//! let (engine, handle) = Engine::new(
//!     EngineConfig::default(),
//!     LedgerConfig::default(),
//!     OrderConfig::default(),
//!     SizingConfig::default(),
//!     gateway,
//!     events_rx,
//!     stream_token,
//! );
//! tokio::spawn(engine.run());
//! handle.open("BTC-USDT-SWAP", Side::Buy, entry, stop, OrderKind::Maker).await?;
//! ```

pub mod book;
pub mod chase;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod order_fsm;

// 주요 타입 재내보내기
pub use book::{PositionBook, PositionEntry};
pub use chase::{ChaseDecision, ChasePolicy, HoldReason, RestingOrder};
pub use config::{EngineConfig, LedgerConfig, OrderConfig};
pub use engine::{Command, Engine, EngineHandle, EngineSummary};
pub use error::{ExecutionError, Rejection};
pub use ledger::ShadowLedger;
pub use locks::{ExpiredLock, LockPurpose, LockTimeoutMonitor, SymbolLock, SymbolLocks};
pub use order_fsm::{
    CloseRequest, InFlightOrder, OpenRequest, OrderStateMachine, Phase, SymbolState,
};
