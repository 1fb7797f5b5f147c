//! OKX v5 커넥터.
//!
//! - `auth`: 자격 증명, 서명, 타임스탬프 형식
//! - `clock`: 서버 시계 오프셋, 세션
//! - `client`: 서명된 REST 클라이언트
//! - `messages`: 스트림 프레임과 공용 응답 DTO
//! - `connection`: 스트림 연결 상태 머신 (순수 로직)
//! - `websocket`: 스트림 연결 실행 루프

pub mod auth;
pub mod client;
pub mod clock;
pub mod connection;
pub mod messages;
pub mod websocket;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use auth::{Credentials, SIMULATED_TRADING_HEADER};
pub use client::{CalibrationConfig, OkxRestClient};
pub use clock::{ServerClock, Session};
pub use connection::{Connection, ConnectionState, ReconnectPolicy};
pub use messages::ChannelArg;
pub use websocket::{OkxStream, StreamConfig, StreamEvent, StreamKind};

const REST_URL: &str = "https://www.okx.com";
const LIVE_PUBLIC_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const LIVE_PRIVATE_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/private";
const SIMULATED_PUBLIC_WS_URL: &str = "wss://wspap.okx.com:8443/ws/v5/public";
const SIMULATED_PRIVATE_WS_URL: &str = "wss://wspap.okx.com:8443/ws/v5/private";

/// 거래 환경.
///
/// REST는 같은 base URL을 쓰고 헤더로 구분하며, 스트림은 엔드포인트가 다릅니다.
/// 자격 증명은 환경별로 발급되며 교차 사용 시 거래소가 `50101`로 거부합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    /// 모의거래
    #[default]
    Simulated,
    /// 실거래
    Live,
}

impl Venue {
    pub fn is_simulated(&self) -> bool {
        matches!(self, Venue::Simulated)
    }

    pub fn public_ws_url(&self) -> &'static str {
        match self {
            Venue::Simulated => SIMULATED_PUBLIC_WS_URL,
            Venue::Live => LIVE_PUBLIC_WS_URL,
        }
    }

    pub fn private_ws_url(&self) -> &'static str {
        match self {
            Venue::Simulated => SIMULATED_PRIVATE_WS_URL,
            Venue::Live => LIVE_PRIVATE_WS_URL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Simulated => "simulated",
            Venue::Live => "live",
        }
    }
}

/// 엔드포인트 설정. 테스트에서는 로컬 서버 주소로 교체합니다.
#[derive(Debug, Clone)]
pub struct OkxEndpoints {
    pub rest_url: String,
    pub public_ws_url: String,
    pub private_ws_url: String,
    /// REST 요청 타임아웃
    pub request_timeout: Duration,
}

impl OkxEndpoints {
    /// venue 기본 엔드포인트.
    pub fn for_venue(venue: Venue) -> Self {
        Self {
            rest_url: REST_URL.to_string(),
            public_ws_url: venue.public_ws_url().to_string(),
            private_ws_url: venue.private_ws_url().to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_rest_url(mut self, url: impl Into<String>) -> Self {
        self.rest_url = url.into();
        self
    }
}
