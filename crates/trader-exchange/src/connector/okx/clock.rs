//! 서버 시계 오프셋과 세션.
//!
//! 오프셋(`server - local`, 밀리초)은 프로세스 전역 상태가 아니라
//! 세션이 소유하는 값이며, 모든 서명 타임스탬프 생성에 적용됩니다.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::{auth::Credentials, Venue};

/// 측정된 서버 시계 오프셋.
#[derive(Debug, Default)]
pub struct ServerClock {
    offset_ms: AtomicI64,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 고정 오프셋으로 생성 (테스트, 재시작 복원용).
    pub fn with_offset_ms(offset_ms: i64) -> Self {
        Self {
            offset_ms: AtomicI64::new(offset_ms),
        }
    }

    /// 현재 오프셋 (server - local).
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn set_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// 서버 기준 현재 시각.
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::milliseconds(self.offset_ms())
    }
}

/// 요청 왕복 중간 시점을 로컬 기준으로 삼은 오프셋.
pub fn measure_offset(sent: DateTime<Utc>, received: DateTime<Utc>, server_ms: i64) -> i64 {
    let sent_ms = sent.timestamp_millis();
    let received_ms = received.timestamp_millis();
    let local_mid = sent_ms + (received_ms - sent_ms) / 2;
    server_ms - local_mid
}

/// 인증 세션: 자격 증명, venue, 시계 오프셋.
///
/// 시계는 REST 클라이언트와 스트림 연결이 공유합니다.
#[derive(Debug, Clone)]
pub struct Session {
    pub credentials: Credentials,
    pub venue: Venue,
    pub clock: Arc<ServerClock>,
}

impl Session {
    pub fn new(credentials: Credentials, venue: Venue) -> Self {
        Self {
            credentials,
            venue,
            clock: Arc::new(ServerClock::new()),
        }
    }
}
