//! OKX 스트림 연결 실행 루프.
//!
//! 채널 종류(public/private)마다 하나의 [`OkxStream`]을 별도 태스크로 실행합니다.
//! 수신 데이터와 상태 변화는 `mpsc` 채널로 [`StreamEvent`]를 보냅니다.
//!
//! - keepalive: `ping_interval`마다 텍스트 `ping` 전송, 서버는 `pong` 응답
//! - 무응답 감시: `stale_after` 동안 어떤 프레임도 없으면 소켓 상태와 무관하게 재연결
//! - 핸드셰이크 제한: `handshake_timeout` 안에 로그인과 모든 구독 에코가 끝나야 함
//! - 치명적 에러(인증 실패, 재연결 소진)는 `Fatal` 이벤트 후 루프 종료

use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::{
    sync::mpsc,
    time::{interval_at, Instant},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, protocol::Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trader_core::{OrderUpdate, PositionSnapshot, Quote};

use super::{
    auth::ws_timestamp,
    clock::Session,
    connection::{Connection, ConnectionState, ReconnectPolicy},
    messages::{
        frame_preview, parse_inbound, subscribe_message, ChannelArg, PushData, WsInbound,
    },
};
use crate::ExchangeError;

// ============================================================================
// 설정과 이벤트
// ============================================================================

/// 스트림 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// 재연결 기본 대기 (ms)
    pub reconnect_base_ms: u64,
    /// 재연결 최대 대기 (ms)
    pub reconnect_cap_ms: u64,
    /// 연속 재연결 실패 허용 횟수
    pub max_reconnect_attempts: u32,
    /// 무응답 허용 시간 (ms)
    pub stale_after_ms: u64,
    /// keepalive 간격 (ms)
    pub ping_interval_ms: u64,
    /// 연결~구독 완료 제한 시간 (ms)
    pub handshake_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 60_000,
            max_reconnect_attempts: 10,
            stale_after_ms: 30_000,
            ping_interval_ms: 20_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl StreamConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            cap: Duration::from_millis(self.reconnect_cap_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// 무응답 감시 주기.
    fn watchdog_period(&self) -> Duration {
        (self.stale_after() / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
    }
}

/// 채널 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// 시세 (인증 불필요)
    Public,
    /// 계좌 (로그인 필요)
    Private,
}

/// 스트림 이벤트.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Position(PositionSnapshot),
    Order(OrderUpdate),
    Ticker(Quote),
    /// 연결 상태 변화
    State {
        kind: StreamKind,
        state: ConnectionState,
    },
    /// 복구 불가. 스트림 태스크는 종료됨
    Fatal {
        kind: StreamKind,
        error: ExchangeError,
    },
}

/// 세션 종료 사유.
enum SessionEnd {
    /// 종료 신호
    Shutdown,
    /// 서버가 연결 종료
    Closed,
}

// ============================================================================
// 스트림
// ============================================================================

pub struct OkxStream {
    kind: StreamKind,
    url: String,
    session: Option<Session>,
    channels: Vec<ChannelArg>,
    config: StreamConfig,
    tx: mpsc::Sender<StreamEvent>,
    connection: Connection,
}

impl OkxStream {
    /// 시세 스트림.
    pub fn public(
        url: impl Into<String>,
        channels: Vec<ChannelArg>,
        config: StreamConfig,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Self {
        Self::build(StreamKind::Public, url.into(), None, channels, config, tx)
    }

    /// 계좌 스트림. 연결마다 세션 시계로 로그인합니다.
    pub fn private(
        url: impl Into<String>,
        session: Session,
        channels: Vec<ChannelArg>,
        config: StreamConfig,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Self {
        Self::build(
            StreamKind::Private,
            url.into(),
            Some(session),
            channels,
            config,
            tx,
        )
    }

    fn build(
        kind: StreamKind,
        url: String,
        session: Option<Session>,
        channels: Vec<ChannelArg>,
        config: StreamConfig,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Self {
        let connection = Connection::new(config.policy());
        Self {
            kind,
            url,
            session,
            channels,
            config,
            tx,
            connection,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// 연결 및 수신 루프. 별도 태스크에서 실행해야 합니다.
    ///
    /// `shutdown`이 취소되면 정상 종료하고, 치명적 에러면 `Fatal` 이벤트 후 에러를 반환합니다.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ExchangeError> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.connection.begin_connect();
            self.emit_state().await;

            let outcome = self.run_session(&shutdown).await;
            let error = match outcome {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) => {
                    ExchangeError::Disconnected("서버가 연결을 종료함".to_string())
                }
                Err(e) if e.is_fatal() => return Err(self.escalate(e).await),
                Err(e) => e,
            };

            let delay = match self.connection.record_failure() {
                Ok(delay) => delay,
                Err(exhausted) => return Err(self.escalate(exhausted).await),
            };
            self.emit_state().await;
            warn!(
                kind = ?self.kind,
                error = %error,
                attempt = self.connection.reconnect_attempts(),
                max_attempts = self.config.max_reconnect_attempts,
                delay_ms = delay.as_millis(),
                "스트림 끊김, 재연결 대기"
            );

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.connection.close();
        self.emit_state().await;
        info!(kind = ?self.kind, "스트림 종료");
        Ok(())
    }

    /// 연결 1회 수명.
    async fn run_session(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd, ExchangeError> {
        let handshake_timeout = self.config.handshake_timeout();
        let (ws_stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
            connected = tokio::time::timeout(handshake_timeout, connect_async(self.url.as_str())) => {
                connected
                    .map_err(|_| ExchangeError::NetworkError("연결 타임아웃".to_string()))?
                    .map_err(|e| ExchangeError::NetworkError(format!("WebSocket 연결 실패: {}", e)))?
            }
        };
        let (mut write, mut read) = ws_stream.split();

        let opened_at = Instant::now();
        self.connection.on_open(opened_at);
        info!(kind = ?self.kind, url = %self.url, "WebSocket 연결 성공");

        match self.session.clone() {
            Some(session) => {
                self.connection.begin_login();
                self.emit_state().await;
                let timestamp = ws_timestamp(session.clock.now());
                let login = session.credentials.login_message(&timestamp)?;
                write.send(Message::Text(login)).await?;
            }
            None => self.subscribe(&mut write).await?,
        }

        let ping_period = self.config.ping_interval();
        let mut ping = interval_at(opened_at + ping_period, ping_period);
        let watchdog_period = self.config.watchdog_period();
        let mut watchdog = interval_at(opened_at + watchdog_period, watchdog_period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.connection.on_message(Instant::now());
                            if !self.handle_text(&text, &mut write).await? {
                                return Ok(SessionEnd::Shutdown);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.connection.on_message(Instant::now());
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!(kind = ?self.kind, ?frame, "서버에서 연결 종료 요청");
                            return Ok(SessionEnd::Closed);
                        }
                        Some(Ok(_)) => self.connection.on_message(Instant::now()),
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(SessionEnd::Closed),
                    }
                }
                _ = ping.tick() => {
                    write.send(Message::Text("ping".to_string())).await?;
                }
                _ = watchdog.tick() => {
                    let now = Instant::now();
                    if self.connection.is_stale(now, self.config.stale_after()) {
                        return Err(ExchangeError::Disconnected(format!(
                            "{}ms 동안 수신 없음",
                            self.config.stale_after_ms
                        )));
                    }
                    if self.connection.state() != ConnectionState::Subscribed
                        && now.saturating_duration_since(opened_at) > handshake_timeout
                    {
                        return Err(ExchangeError::NetworkError(format!(
                            "핸드셰이크 타임아웃 (대기 중 구독 {}개)",
                            self.connection.pending_subscriptions().len()
                        )));
                    }
                }
            }
        }
    }

    /// 텍스트 프레임 처리. 이벤트 수신자가 사라졌으면 `false`.
    async fn handle_text<S>(&mut self, text: &str, write: &mut S) -> Result<bool, ExchangeError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let inbound = match parse_inbound(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                let (channel, head) = frame_preview(text);
                warn!(
                    kind = ?self.kind,
                    channel = channel.as_deref().unwrap_or("-"),
                    error = %e,
                    frame = head,
                    "프레임 파싱 실패, 버림"
                );
                return Ok(true);
            }
        };

        match inbound {
            WsInbound::Pong | WsInbound::Other => Ok(true),
            WsInbound::Login { code, msg } => {
                if code != "0" {
                    return Err(ExchangeError::from_okx_code(&code, &msg));
                }
                info!(kind = ?self.kind, "로그인 성공");
                self.subscribe(write).await?;
                Ok(true)
            }
            WsInbound::Subscribed(arg) => {
                debug!(channel = %arg.channel, inst_id = ?arg.inst_id, "구독 확인");
                if self.connection.on_subscribe_echo(&arg) {
                    info!(kind = ?self.kind, channels = self.channels.len(), "구독 완료, 재연결 카운터 초기화");
                    return Ok(self.emit_state().await);
                }
                Ok(true)
            }
            WsInbound::Error { code, msg } => {
                let err = ExchangeError::from_okx_code(&code, &msg);
                error!(kind = ?self.kind, error = %err, "스트림 에러 이벤트");
                Err(err)
            }
            WsInbound::Push(data) => Ok(self.forward(data).await),
        }
    }

    async fn subscribe<S>(&mut self, write: &mut S) -> Result<(), ExchangeError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        if self.connection.begin_subscribe(&self.channels) {
            self.emit_state().await;
            return Ok(());
        }
        let msg = subscribe_message(&self.channels)?;
        write.send(Message::Text(msg)).await?;
        Ok(())
    }

    async fn forward(&self, data: PushData) -> bool {
        let events: Vec<StreamEvent> = match data {
            PushData::Positions(rows) => rows.into_iter().map(StreamEvent::Position).collect(),
            PushData::Orders(rows) => rows.into_iter().map(StreamEvent::Order).collect(),
            PushData::Tickers(rows) => rows.into_iter().map(StreamEvent::Ticker).collect(),
        };
        for event in events {
            if self.tx.send(event).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn emit_state(&self) -> bool {
        self.tx
            .send(StreamEvent::State {
                kind: self.kind,
                state: self.connection.state(),
            })
            .await
            .is_ok()
    }

    /// 치명적 에러 보고.
    async fn escalate(&mut self, error: ExchangeError) -> ExchangeError {
        self.connection.close();
        error!(
            target: "operator_alert",
            kind = ?self.kind,
            error = %error,
            "스트림 치명적 에러, 재연결 중단"
        );
        let _ = self
            .tx
            .send(StreamEvent::Fatal {
                kind: self.kind,
                error: error.clone(),
            })
            .await;
        error
    }
}
