//! 스트림 연결 상태 머신.
//!
//! I/O 없이 상태 전이, 재연결 카운터, 마지막 수신 시각만 관리합니다.
//! 실행 루프(`websocket`)가 이벤트마다 이 상태를 갱신합니다.
//!
//! ```text
//! Disconnected → Connecting → Authenticating → Subscribed
//!      ↑              │              │              │
//!      └──────────────┴──────────────┴──────────────┘  (끊김/실패)
//! ```
//!
//! 재연결 카운터는 모든 채널의 구독 에코를 받은 뒤에만 0으로 초기화됩니다.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::messages::ChannelArg;
use crate::{retry::backoff_delay, ExchangeError};

/// 연결 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
}

/// 재연결 정책.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// 이 횟수를 넘는 연속 실패는 치명적 에러
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

/// 논리 채널 하나의 연결 상태.
#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    reconnect_attempts: u32,
    last_message_at: Option<Instant>,
    pending: Vec<ChannelArg>,
    policy: ReconnectPolicy,
}

impl Connection {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            last_message_at: None,
            pending: Vec::new(),
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_message_at(&self) -> Option<Instant> {
        self.last_message_at
    }

    /// 아직 에코를 받지 못한 구독.
    pub fn pending_subscriptions(&self) -> &[ChannelArg] {
        &self.pending
    }

    /// 전송 계층 연결 시작.
    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
        self.pending.clear();
    }

    /// 전송 계층 연결 수립.
    pub fn on_open(&mut self, now: Instant) {
        self.last_message_at = Some(now);
    }

    /// 로그인 전송.
    pub fn begin_login(&mut self) {
        self.state = ConnectionState::Authenticating;
    }

    /// 구독 전송. 구독할 채널이 없으면 즉시 완료로 간주합니다.
    ///
    /// 모든 구독이 완료되면 `true`.
    pub fn begin_subscribe(&mut self, args: &[ChannelArg]) -> bool {
        self.pending = args.to_vec();
        if self.pending.is_empty() {
            self.mark_subscribed();
            return true;
        }
        false
    }

    /// 구독 에코 수신. 마지막 에코이면 `Subscribed`로 전이하고 `true`.
    pub fn on_subscribe_echo(&mut self, arg: &ChannelArg) -> bool {
        self.pending.retain(|p| p != arg);
        if self.pending.is_empty() && self.state != ConnectionState::Subscribed {
            self.mark_subscribed();
            return true;
        }
        false
    }

    fn mark_subscribed(&mut self) {
        self.state = ConnectionState::Subscribed;
        self.reconnect_attempts = 0;
    }

    /// 프레임 수신 (keepalive 포함).
    pub fn on_message(&mut self, now: Instant) {
        self.last_message_at = Some(now);
    }

    /// 마지막 수신 이후 `window`가 지났는지.
    pub fn is_stale(&self, now: Instant, window: Duration) -> bool {
        match self.last_message_at {
            Some(last) => now.saturating_duration_since(last) > window,
            None => false,
        }
    }

    /// 세션 종료 (끊김, 핸드셰이크 실패, 무응답).
    ///
    /// 다음 연결 시도 전 대기 시간을 반환합니다.
    /// 연속 실패가 최대 횟수를 넘으면 치명적 에러입니다.
    pub fn record_failure(&mut self) -> Result<Duration, ExchangeError> {
        self.state = ConnectionState::Disconnected;
        self.pending.clear();
        self.reconnect_attempts += 1;
        if self.reconnect_attempts > self.policy.max_attempts {
            return Err(ExchangeError::ReconnectExhausted {
                attempts: self.policy.max_attempts,
            });
        }
        Ok(backoff_delay(
            self.reconnect_attempts,
            self.policy.base,
            self.policy.cap,
        ))
    }

    /// 정상 종료.
    pub fn close(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
            max_attempts: 10,
        }
    }

    fn establish(conn: &mut Connection, args: &[ChannelArg]) {
        conn.begin_connect();
        conn.on_open(Instant::now());
        conn.begin_login();
        assert!(!conn.begin_subscribe(args));
        for arg in args {
            conn.on_subscribe_echo(arg);
        }
    }

    #[test]
    fn test_five_failures_then_success_resets_counter() {
        let args = vec![ChannelArg::positions(), ChannelArg::orders()];
        let mut conn = Connection::new(policy());
        establish(&mut conn, &args);
        assert_eq!(conn.state(), ConnectionState::Subscribed);

        // 스트림 끊김
        let first = conn.record_failure().unwrap();
        assert_eq!(first, Duration::from_secs(5));

        // 연속 실패
        let mut delays = vec![first];
        for _ in 0..4 {
            conn.begin_connect();
            delays.push(conn.record_failure().unwrap());
        }
        assert_eq!(conn.reconnect_attempts(), 5);
        assert_eq!(
            delays.iter().map(Duration::as_secs).collect::<Vec<_>>(),
            vec![5, 10, 20, 40, 80]
        );

        establish(&mut conn, &args);
        assert_eq!(conn.state(), ConnectionState::Subscribed);
        assert_eq!(conn.reconnect_attempts(), 0);
    }

    #[test]
    fn test_counter_not_reset_until_all_echoes() {
        let args = vec![ChannelArg::positions(), ChannelArg::orders()];
        let mut conn = Connection::new(policy());
        conn.record_failure().unwrap();
        conn.record_failure().unwrap();

        conn.begin_connect();
        conn.begin_login();
        conn.begin_subscribe(&args);
        assert!(!conn.on_subscribe_echo(&ChannelArg::positions()));
        assert_eq!(conn.state(), ConnectionState::Authenticating);
        assert_eq!(conn.reconnect_attempts(), 2);

        assert!(conn.on_subscribe_echo(&ChannelArg::orders()));
        assert_eq!(conn.reconnect_attempts(), 0);
    }

    #[test]
    fn test_exhausted_attempts_are_fatal() {
        let mut conn = Connection::new(ReconnectPolicy {
            max_attempts: 3,
            ..policy()
        });
        for _ in 0..3 {
            assert!(conn.record_failure().is_ok());
        }
        let err = conn.record_failure().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err, ExchangeError::ReconnectExhausted { attempts: 3 });
    }

    #[test]
    fn test_staleness_window() {
        let mut conn = Connection::new(policy());
        let start = Instant::now();
        assert!(!conn.is_stale(start, Duration::from_secs(30)));
        conn.on_open(start);
        assert!(!conn.is_stale(start + Duration::from_secs(30), Duration::from_secs(30)));
        assert!(conn.is_stale(start + Duration::from_secs(31), Duration::from_secs(30)));
        conn.on_message(start + Duration::from_secs(31));
        assert!(!conn.is_stale(start + Duration::from_secs(40), Duration::from_secs(30)));
    }

    #[test]
    fn test_public_channel_without_subscriptions() {
        let mut conn = Connection::new(policy());
        conn.begin_connect();
        assert!(conn.begin_subscribe(&[]));
        assert_eq!(conn.state(), ConnectionState::Subscribed);
    }
}
