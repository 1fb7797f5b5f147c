//! 실행 엔진.
//!
//! 태스크 하나가 포지션 장부, Shadow Ledger, 주문 상태 머신, 호가를 소유하고
//! 스트림 이벤트·전략 명령·타이머를 `select!`로 직렬 처리합니다.
//! 상태 변경은 모두 await 사이에서 동기적으로 일어납니다.
//!
//! # 종료 순서
//!
//! 1. 명령 수신 중단
//! 2. 대기 주문 전체 취소 (`cancel_timeout` 안에서 확인)
//! 3. 스트림 토큰 취소 (연결 종료)
//! 4. 락 전체 해제

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trader_core::{OrderKind, Quote, Side};
use trader_exchange::{ExchangeError, ExchangeGateway, StreamEvent};
use trader_risk::{CapitalCommander, SizingConfig, SizingRequest};

use crate::book::PositionBook;
use crate::config::{EngineConfig, LedgerConfig, OrderConfig};
use crate::error::{ExecutionError, Rejection};
use crate::ledger::ShadowLedger;
use crate::order_fsm::{CloseRequest, OpenRequest, OrderStateMachine};

// ============================================================================
// 명령
// ============================================================================

/// 전략 계층 명령.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// 진입 (엔진이 사이징)
    Open {
        symbol: String,
        side: Side,
        entry: Decimal,
        stop: Decimal,
        kind: OrderKind,
    },
    /// 전량 청산
    Close { symbol: String, kind: OrderKind },
    /// 정상 종료
    Shutdown,
}

/// 엔진 명령 송신 핸들.
///
/// 모든 핸들이 닫히면 엔진은 종료 시퀀스를 시작합니다.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    pub async fn send(&self, command: Command) -> Result<(), ExecutionError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ExecutionError::EngineStopped)
    }

    pub async fn open(
        &self,
        symbol: impl Into<String>,
        side: Side,
        entry: Decimal,
        stop: Decimal,
        kind: OrderKind,
    ) -> Result<(), ExecutionError> {
        self.send(Command::Open {
            symbol: symbol.into(),
            side,
            entry,
            stop,
            kind,
        })
        .await
    }

    pub async fn close(&self, symbol: impl Into<String>, kind: OrderKind) -> Result<(), ExecutionError> {
        self.send(Command::Close {
            symbol: symbol.into(),
            kind,
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<(), ExecutionError> {
        self.send(Command::Shutdown).await
    }
}

/// 종료 요약.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSummary {
    pub commands_processed: u64,
    pub reconcile_ticks: u64,
    pub cancelled_orders: usize,
    pub released_locks: usize,
}

// ============================================================================
// 엔진
// ============================================================================

pub struct Engine {
    config: EngineConfig,
    gateway: Arc<dyn ExchangeGateway>,
    book: PositionBook,
    ledger: ShadowLedger,
    fsm: OrderStateMachine,
    commander: CapitalCommander,
    risk_fraction: Decimal,
    quotes: HashMap<String, Quote>,
    events: mpsc::Receiver<StreamEvent>,
    commands: mpsc::Receiver<Command>,
    /// 스트림 태스크 종료용 (종료 시퀀스 3단계에서 취소)
    stream_token: CancellationToken,
    /// 외부 종료 신호
    shutdown: CancellationToken,
    summary: EngineSummary,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        ledger: LedgerConfig,
        orders: OrderConfig,
        sizing: SizingConfig,
        gateway: Arc<dyn ExchangeGateway>,
        events: mpsc::Receiver<StreamEvent>,
        stream_token: CancellationToken,
    ) -> (Self, EngineHandle) {
        let (tx, commands) = mpsc::channel(config.command_buffer.max(1));
        let tolerance = ledger.tolerance;

        let engine = Self {
            book: PositionBook::new(config.symbols.iter().cloned()),
            ledger: ShadowLedger::new(ledger),
            fsm: OrderStateMachine::new(orders, Arc::clone(&gateway), tolerance),
            commander: CapitalCommander::new(sizing.precision),
            risk_fraction: sizing.risk_fraction,
            quotes: HashMap::new(),
            config,
            gateway,
            events,
            commands,
            stream_token,
            shutdown: CancellationToken::new(),
            summary: EngineSummary::default(),
        };
        (engine, EngineHandle { tx })
    }

    /// 외부 종료 신호 토큰 (Ctrl-C 등).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn state_machine(&self) -> &OrderStateMachine {
        &self.fsm
    }

    /// 시작 준비: 상품 명세 로드, 초기 포지션 조회.
    async fn bootstrap(&mut self) -> Result<(), ExecutionError> {
        let instruments = self.gateway.fetch_instruments().await.map_err(startup_error)?;
        let tracked: Vec<_> = instruments
            .into_iter()
            .filter(|spec| self.book.is_tracked(&spec.symbol))
            .collect();

        for symbol in self.book.symbols() {
            if !tracked.iter().any(|spec| &spec.symbol == symbol) {
                return Err(ExecutionError::Startup(format!("상품 명세 없음: {}", symbol)));
            }
        }
        self.fsm.set_instruments(tracked);

        let positions = self.gateway.fetch_positions().await.map_err(startup_error)?;
        self.fsm.apply_poll(&mut self.book, &positions);

        info!(
            venue = self.gateway.venue_name(),
            symbols = ?self.config.symbols,
            "엔진 준비 완료"
        );
        Ok(())
    }

    /// 엔진 실행. 종료 시퀀스까지 마친 뒤 반환합니다.
    ///
    /// 치명적 거래소 에러(인증 실패, 재연결 소진)가 발생해도 종료 시퀀스는 수행한 뒤
    /// 에러를 반환합니다.
    pub async fn run(mut self) -> Result<EngineSummary, ExecutionError> {
        if let Err(e) = self.bootstrap().await {
            error!(error = %e, "엔진 시작 실패");
            self.stream_token.cancel();
            return Err(e);
        }

        let mut reconcile = interval(self.ledger.config().interval());
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut chase = interval(self.config.chase_interval());
        chase.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let clock_period = self.config.clock_refresh();
        let mut clock = interval_at(Instant::now() + clock_period, clock_period);
        clock.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = self.shutdown.clone();
        let mut events_open = true;
        let mut failure: Option<ExecutionError> = None;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("종료 신호 수신");
                    break;
                }

                event = self.events.recv(), if events_open => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event) {
                            failure = Some(e);
                            break;
                        }
                    }
                    None => {
                        warn!("스트림 이벤트 채널 닫힘, 주기 조회로만 동작");
                        events_open = false;
                    }
                },

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        info!("종료 명령 수신");
                        break;
                    }
                    Some(command) => {
                        self.summary.commands_processed += 1;
                        if let Err(e) = self.handle_command(command).await {
                            failure = Some(e);
                            break;
                        }
                    }
                },

                _ = reconcile.tick() => {
                    self.summary.reconcile_ticks += 1;
                    if let Err(e) = self.reconcile_tick().await {
                        failure = Some(e);
                        break;
                    }
                }

                _ = chase.tick() => {
                    let now = Instant::now();
                    if let Err(e) = self.fsm.chase_tick(&mut self.book, &self.quotes, now).await {
                        failure = Some(ExecutionError::Fatal(e));
                        break;
                    }
                }

                _ = clock.tick() => {
                    if let Err(e) = self.refresh_clock().await {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        let summary = self.shutdown_sequence().await;
        match failure {
            Some(e) => {
                error!(target: "operator_alert", error = %e, "엔진 비정상 종료");
                Err(e)
            }
            None => Ok(summary),
        }
    }

    // ========================================================================
    // 이벤트
    // ========================================================================

    fn handle_event(&mut self, event: StreamEvent) -> Result<(), ExecutionError> {
        match event {
            StreamEvent::Position(snapshot) => {
                self.fsm.on_position(&mut self.book, &snapshot);
            }
            StreamEvent::Order(update) => {
                if let Some(resolution) = self.fsm.on_order_update(&mut self.book, &update) {
                    debug!(symbol = %update.symbol, resolution = ?resolution, "주문 해소");
                }
            }
            StreamEvent::Ticker(quote) => {
                self.quotes.insert(quote.symbol.clone(), quote);
            }
            StreamEvent::State { kind, state } => {
                info!(kind = ?kind, state = ?state, "스트림 상태 변경");
            }
            StreamEvent::Fatal { kind, error } => {
                error!(kind = ?kind, error = %error, "스트림 복구 불가");
                return Err(ExecutionError::Fatal(error));
            }
        }
        Ok(())
    }

    // ========================================================================
    // 명령
    // ========================================================================

    async fn handle_command(&mut self, command: Command) -> Result<(), ExecutionError> {
        let result = match command {
            Command::Open {
                symbol,
                side,
                entry,
                stop,
                kind,
            } => self.handle_open(symbol, side, entry, stop, kind).await,
            Command::Close { symbol, kind } => {
                let quote = self.quotes.get(&symbol);
                self.fsm
                    .submit_close(&mut self.book, CloseRequest { symbol, kind }, quote)
                    .await
                    .map(|_| ())
            }
            Command::Shutdown => Ok(()),
        };

        match result {
            Ok(()) => Ok(()),
            Err(Rejection::Exchange(e)) if e.is_fatal() => Err(ExecutionError::Fatal(e)),
            Err(rejection) => {
                warn!(reason = %rejection, "명령 거부");
                Ok(())
            }
        }
    }

    async fn handle_open(
        &mut self,
        symbol: String,
        side: Side,
        entry: Decimal,
        stop: Decimal,
        kind: OrderKind,
    ) -> Result<(), Rejection> {
        // 평가액 조회 전에 밸브부터 확인
        self.fsm.check_valve(&self.book, &symbol)?;

        let instrument = self
            .fsm
            .instrument(&symbol)
            .cloned()
            .ok_or_else(|| Rejection::UnknownInstrument(symbol.clone()))?;
        let equity = self.gateway.fetch_equity(&self.config.equity_currency).await?;

        let request = SizingRequest {
            equity,
            entry,
            stop,
            risk_fraction: self.risk_fraction,
        };
        let sized = self.commander.size(&request, &instrument)?;

        let quote = self.quotes.get(&symbol);
        self.fsm
            .submit_open(
                &mut self.book,
                OpenRequest {
                    symbol,
                    side,
                    quantity: sized.quantity,
                    kind,
                },
                quote,
            )
            .await
            .map(|_| ())
    }

    // ========================================================================
    // 타이머
    // ========================================================================

    /// 조정 1회: 조회 → 비정상 탐지 → 원장 → 재동기화 제출.
    async fn reconcile_tick(&mut self) -> Result<(), ExecutionError> {
        match self.gateway.fetch_positions().await {
            Ok(positions) => self.fsm.apply_poll(&mut self.book, &positions),
            Err(e) if e.is_fatal() => return Err(ExecutionError::Fatal(e)),
            Err(e) => {
                warn!(error = %e, "포지션 조회 실패, 이번 조정 건너뜀");
                return Ok(());
            }
        }

        for (symbol, orphan) in self.fsm.detect_abnormal(&mut self.book) {
            self.fsm.cancel_best_effort(&symbol, &orphan.order_id).await;
        }

        let fsm = &self.fsm;
        let intents = self
            .ledger
            .reconcile(&self.book, Instant::now(), |symbol| fsm.is_busy(symbol));

        for intent in intents {
            match self.fsm.submit_resync(&mut self.book, intent).await {
                Ok(_) => {}
                Err(Rejection::Exchange(e)) if e.is_fatal() => return Err(ExecutionError::Fatal(e)),
                Err(rejection) => debug!(reason = %rejection, "재동기화 보류"),
            }
        }
        Ok(())
    }

    async fn refresh_clock(&self) -> Result<(), ExecutionError> {
        match self.gateway.refresh_clock().await {
            Ok(offset_ms) => {
                debug!(offset_ms, "시계 재보정");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(ExecutionError::Fatal(e)),
            Err(e) => {
                warn!(error = %e, "시계 재보정 실패, 기존 오프셋 유지");
                Ok(())
            }
        }
    }

    // ========================================================================
    // 종료
    // ========================================================================

    async fn shutdown_sequence(&mut self) -> EngineSummary {
        info!("종료 시퀀스 시작");
        self.commands.close();

        let cancelled = self
            .fsm
            .cancel_all_resting(self.config.cancel_timeout())
            .await;

        self.stream_token.cancel();
        let released = self.fsm.release_all_locks();

        self.summary.cancelled_orders = cancelled;
        self.summary.released_locks = released;
        info!(
            commands = self.summary.commands_processed,
            reconcile_ticks = self.summary.reconcile_ticks,
            cancelled,
            released,
            "종료 완료"
        );
        self.summary.clone()
    }
}

fn startup_error(error: ExchangeError) -> ExecutionError {
    if error.is_fatal() {
        ExecutionError::Fatal(error)
    } else {
        ExecutionError::Startup(error.to_string())
    }
}
