//! 거래소 프로토콜 클라이언트.
//!
//! OKX v5 API에 대해 다음을 제공합니다:
//! - 요청 서명과 세션 소유 시계 오프셋 보정
//! - 봉투 응답 해석과 에러 분류 (치명/재시도/거부)
//! - 스트림 연결 수명주기 (연결 → 로그인 → 구독 → keepalive → 재연결)
//! - 실행 엔진이 의존하는 [`ExchangeGateway`] trait
//!
//! # 예제
//!
//! ```rust,ignore
//! use trader_exchange::connector::okx::{Credentials, OkxEndpoints, OkxRestClient, Session, Venue};
//!
//! let session = Session::new(Credentials::new(key, secret, pass), Venue::Simulated);
//! let client = OkxRestClient::new(session, &OkxEndpoints::for_venue(Venue::Simulated))?;
//! client.calibrate_clock().await?;
//! ```

pub mod connector;
pub mod error;
pub mod retry;
pub mod traits;

pub use connector::okx::{
    CalibrationConfig, ChannelArg, Credentials, OkxEndpoints, OkxRestClient, OkxStream, Session,
    StreamConfig, StreamEvent, StreamKind, Venue,
};
pub use error::ExchangeError;
pub use retry::{backoff_delay, with_retry, RetryConfig};
pub use traits::{ExchangeGateway, OrderAck};
