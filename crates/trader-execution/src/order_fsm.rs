//! 심볼별 주문 상태 머신.
//!
//! ```text
//! Idle ─▶ PendingOpen(락) ─▶ Open ─▶ PendingClose(락) ─▶ Closed ─▶ Idle
//!              │                ▲           ▲
//!              └─▶ Chasing ─────┘           │
//!                  (대기 주문 추격) ─ 상한 초과 ┘
//! ```
//!
//! # 규칙
//!
//! - **원웨이 밸브**: 실제 포지션이 0이 아니면 신규 진입을 받지 않습니다.
//!   락 획득보다 먼저 검사합니다.
//! - **심볼 락**: 진입/청산 제출 전에 획득합니다. 메이커 주문은 접수 시, 즉시 체결형
//!   주문(IOC, 시장가, 재동기화)은 최종 상태 푸시를 받을 때 해제합니다. 거부 또는
//!   타임아웃이면 바로 해제하고, 락 타임아웃이 지나도록 해소되지 않은 주문은 포기합니다.
//! - **비정상 상태 리셋**: 제출 이력으로 설명되지 않는 포지션이 보이면 심볼 상태를
//!   무포지션으로 초기화하고 운영자 경보를 올린 뒤 격리합니다. 자동 보정은 하지 않습니다.
//!
//! 모든 메서드는 엔진 태스크 하나에서만 호출됩니다. `&mut self`로 직렬화되므로
//! 기록 갱신은 await 사이에서 원자적입니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use trader_core::{
    InstrumentSpec, IntentOrigin, IntentResolution, OrderIntent, OrderKind, OrderStatus,
    OrderUpdate, PositionSnapshot, Quote, Side,
};
use trader_exchange::{ExchangeError, ExchangeGateway, OrderAck};

use crate::book::PositionBook;
use crate::chase::{ChaseDecision, ChasePolicy, RestingOrder};
use crate::config::OrderConfig;
use crate::error::Rejection;
use crate::locks::{LockPurpose, LockTimeoutMonitor, SymbolLocks};

// ============================================================================
// 상태
// ============================================================================

/// 심볼 주문 단계.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    /// 포지션/주문 없음
    #[default]
    Idle,
    /// 진입 제출 중 또는 즉시 체결형 진입 주문 해소 대기 (Open 락 보유)
    PendingOpen,
    /// 진입 접수됨, 포지션 보유
    Open,
    /// 대기 주문 추격 중
    Chasing,
    /// 청산 제출 중 또는 즉시 체결형 청산 주문 해소 대기 (Close 락 보유)
    PendingClose,
    /// 청산 접수됨, 무포지션 확인 대기
    Closed,
}

/// 심볼별 추적 상태.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolState {
    pub phase: Phase,
    pub resting: Option<RestingOrder>,
    /// 접수됐지만 최종 상태를 아직 받지 못한 즉시 체결형 주문
    pub in_flight: Option<InFlightOrder>,
    /// 마지막 무포지션 이후 접수된 주문 수량 누계
    pub submitted_history: Decimal,
    /// 연속 청산 실패 횟수
    pub close_failures: u32,
    /// 비정상 상태 리셋 후 격리 여부
    pub quarantined: bool,
}

/// 접수 후 최종 상태 대기 중인 즉시 체결형 주문.
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub side: Side,
    /// 보유 중인 락 목적
    pub purpose: LockPurpose,
    pub quantity: Decimal,
    pub filled: Decimal,
    /// 접수 직전 목표 수량 (미체결 취소 시 복원용)
    pub prior_target: Decimal,
    /// 재동기화 주문은 목표 수량을 바꾸지 않음
    pub resync: bool,
}

impl InFlightOrder {
    fn new(ack: &OrderAck, intent: &OrderIntent, purpose: LockPurpose, prior_target: Decimal) -> Self {
        Self {
            order_id: ack.order_id.clone(),
            client_order_id: ack.client_order_id.clone(),
            side: intent.side,
            purpose,
            quantity: intent.quantity,
            filled: Decimal::ZERO,
            prior_target,
            resync: intent.origin == IntentOrigin::Resync,
        }
    }

    pub fn matches(&self, order_id: &str, client_order_id: Option<&str>) -> bool {
        self.order_id == order_id || client_order_id == Some(self.client_order_id.as_str())
    }
}

/// 전략 진입 요청 (사이징 완료 수량).
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub kind: OrderKind,
}

/// 전략 청산 요청.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub symbol: String,
    pub kind: OrderKind,
}

// ============================================================================
// 상태 머신
// ============================================================================

pub struct OrderStateMachine {
    config: OrderConfig,
    gateway: Arc<dyn ExchangeGateway>,
    policy: ChasePolicy,
    locks: SymbolLocks,
    lock_monitor: LockTimeoutMonitor,
    states: HashMap<String, SymbolState>,
    instruments: HashMap<String, InstrumentSpec>,
    /// 비정상 판단 허용 비율 (원장 허용 비율과 동일)
    tolerance: Decimal,
}

impl OrderStateMachine {
    pub fn new(config: OrderConfig, gateway: Arc<dyn ExchangeGateway>, tolerance: Decimal) -> Self {
        Self {
            policy: ChasePolicy::from_config(&config),
            locks: SymbolLocks::new(config.lock_timeout()),
            lock_monitor: LockTimeoutMonitor::new(
                config.lock_timeout_window(),
                config.lock_timeout_alert_threshold,
            ),
            config,
            gateway,
            states: HashMap::new(),
            instruments: HashMap::new(),
            tolerance,
        }
    }

    pub fn set_instruments(&mut self, instruments: impl IntoIterator<Item = InstrumentSpec>) {
        for spec in instruments {
            self.instruments.insert(spec.symbol.clone(), spec);
        }
    }

    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentSpec> {
        self.instruments.get(symbol)
    }

    pub fn state(&self, symbol: &str) -> Option<&SymbolState> {
        self.states.get(symbol)
    }

    pub fn phase(&self, symbol: &str) -> Phase {
        self.states.get(symbol).map(|s| s.phase).unwrap_or_default()
    }

    pub fn locks(&self) -> &SymbolLocks {
        &self.locks
    }

    pub fn lock_monitor(&self) -> &LockTimeoutMonitor {
        &self.lock_monitor
    }

    pub fn policy(&self) -> &ChasePolicy {
        &self.policy
    }

    /// 원장 조정에서 제외할 심볼인지 (진행 중, 락 보유, 미해소 주문, 격리).
    pub fn is_busy(&self, symbol: &str) -> bool {
        self.locks.is_locked(symbol)
            || self.states.get(symbol).is_some_and(|s| {
                s.quarantined
                    || s.in_flight.is_some()
                    || matches!(s.phase, Phase::PendingOpen | Phase::PendingClose | Phase::Chasing)
            })
    }

    fn state_mut(&mut self, symbol: &str) -> &mut SymbolState {
        self.states.entry(symbol.to_string()).or_default()
    }

    // ========================================================================
    // 원웨이 밸브
    // ========================================================================

    /// 실제 포지션이 있으면 신규 진입 거부.
    pub fn check_valve(&self, book: &PositionBook, symbol: &str) -> Result<(), Rejection> {
        let actual = book.actual(symbol);
        if actual.is_zero() {
            return Ok(());
        }
        info!(symbol, actual = %actual, "원웨이 밸브: 포지션 보유 중 진입 차단");
        Err(Rejection::ValveClosed {
            symbol: symbol.to_string(),
            actual,
        })
    }

    // ========================================================================
    // 진입
    // ========================================================================

    /// 전략 진입 제출.
    ///
    /// 밸브 → 단계 확인 → 락 → 제출 순서입니다. 접수되면 목표 수량이
    /// `±quantity`로 설정되고, 메이커 주문은 `Chasing`으로 들어갑니다.
    pub async fn submit_open(
        &mut self,
        book: &mut PositionBook,
        request: OpenRequest,
        quote: Option<&Quote>,
    ) -> Result<OrderAck, Rejection> {
        let symbol = request.symbol.clone();
        self.check_valve(book, &symbol)?;

        {
            let state = self.state_mut(&symbol);
            if state.quarantined {
                return Err(Rejection::Quarantined(symbol));
            }
            if state.phase != Phase::Idle {
                let phase = state.phase;
                return Err(Rejection::Busy { symbol, phase });
            }
        }

        let price = self.limit_price(&symbol, request.side, request.kind, quote)?;
        let intent = OrderIntent::new(
            symbol.as_str(),
            request.side,
            request.kind,
            request.quantity,
            price,
            IntentOrigin::StrategyOpen,
        );

        self.locks
            .try_acquire(&symbol, LockPurpose::Open, intent.id, Instant::now())
            .map_err(|_| Rejection::Locked {
                symbol: symbol.clone(),
                purpose: LockPurpose::Open,
            })?;
        self.state_mut(&symbol).phase = Phase::PendingOpen;

        info!(
            symbol = %symbol,
            side = %intent.side,
            kind = ?intent.kind,
            quantity = %intent.quantity,
            price = ?intent.price,
            "진입 주문 제출"
        );

        let prior_target = book.target(&symbol);
        let ack = match self.place_with_timeout(&intent).await {
            Ok(ack) => ack,
            Err(rejection) => {
                self.locks.release(&symbol, LockPurpose::Open);
                self.state_mut(&symbol).phase = Phase::Idle;
                warn!(symbol = %symbol, reason = %rejection, "진입 주문 거부");
                return Err(rejection);
            }
        };

        book.set_target(&symbol, intent.signed_quantity());
        let state = self.state_mut(&symbol);
        state.submitted_history += intent.quantity;
        if intent.kind.is_resting() {
            let price = intent.price.unwrap_or_default();
            state.resting = Some(RestingOrder {
                order_id: ack.order_id.clone(),
                client_order_id: ack.client_order_id.clone(),
                side: intent.side,
                purpose: LockPurpose::Open,
                quantity: intent.quantity,
                filled: Decimal::ZERO,
                original_price: price,
                current_price: price,
                last_reprice_at: Instant::now(),
                prior_target,
            });
            state.phase = Phase::Chasing;
            self.locks.release(&symbol, LockPurpose::Open);
        } else {
            // 최종 상태 푸시까지 PendingOpen과 락 유지
            state.in_flight =
                Some(InFlightOrder::new(&ack, &intent, LockPurpose::Open, prior_target));
        }
        info!(symbol = %symbol, order_id = %ack.order_id, "진입 주문 접수");
        Ok(ack)
    }

    // ========================================================================
    // 청산
    // ========================================================================

    /// 전략 청산 제출.
    ///
    /// `Open` 또는 `Idle`(실제 포지션 보유) 단계에서만 허용됩니다.
    /// 격리된 심볼도 수동 청산은 허용합니다.
    pub async fn submit_close(
        &mut self,
        book: &mut PositionBook,
        request: CloseRequest,
        quote: Option<&Quote>,
    ) -> Result<OrderAck, Rejection> {
        let symbol = request.symbol;
        if book.actual(&symbol).is_zero() {
            return Err(Rejection::NothingToClose(symbol));
        }
        let phase = self.phase(&symbol);
        let in_flight = self.states.get(&symbol).is_some_and(|s| s.in_flight.is_some());
        if in_flight || !matches!(phase, Phase::Open | Phase::Idle) {
            return Err(Rejection::Busy { symbol, phase });
        }
        self.close_position(book, &symbol, request.kind, quote).await
    }

    async fn close_position(
        &mut self,
        book: &mut PositionBook,
        symbol: &str,
        kind: OrderKind,
        quote: Option<&Quote>,
    ) -> Result<OrderAck, Rejection> {
        let actual = book.actual(symbol);
        let Some(position_side) = Side::from_signed(actual) else {
            return Err(Rejection::NothingToClose(symbol.to_string()));
        };
        let side = position_side.opposite();
        let price = self.limit_price(symbol, side, kind, quote)?;
        let intent = OrderIntent::new(
            symbol,
            side,
            kind,
            actual.abs(),
            price,
            IntentOrigin::StrategyClose,
        );

        self.locks
            .try_acquire(symbol, LockPurpose::Close, intent.id, Instant::now())
            .map_err(|_| Rejection::Locked {
                symbol: symbol.to_string(),
                purpose: LockPurpose::Close,
            })?;
        let previous_phase = {
            let state = self.state_mut(symbol);
            let previous = state.phase;
            state.phase = Phase::PendingClose;
            previous
        };

        info!(
            symbol,
            side = %intent.side,
            kind = ?intent.kind,
            quantity = %intent.quantity,
            "청산 주문 제출"
        );

        let prior_target = book.target(symbol);
        match self.place_with_timeout(&intent).await {
            Ok(ack) => {
                book.set_target(symbol, Decimal::ZERO);
                let state = self.state_mut(symbol);
                state.submitted_history += intent.quantity;
                state.close_failures = 0;
                if intent.kind.is_resting() {
                    let price = intent.price.unwrap_or_default();
                    state.resting = Some(RestingOrder {
                        order_id: ack.order_id.clone(),
                        client_order_id: ack.client_order_id.clone(),
                        side: intent.side,
                        purpose: LockPurpose::Close,
                        quantity: intent.quantity,
                        filled: Decimal::ZERO,
                        original_price: price,
                        current_price: price,
                        last_reprice_at: Instant::now(),
                        prior_target,
                    });
                    state.phase = Phase::Chasing;
                    self.locks.release(symbol, LockPurpose::Close);
                } else {
                    state.in_flight =
                        Some(InFlightOrder::new(&ack, &intent, LockPurpose::Close, prior_target));
                }
                info!(symbol, order_id = %ack.order_id, "청산 주문 접수");
                Ok(ack)
            }
            Err(rejection) => {
                self.locks.release(symbol, LockPurpose::Close);
                let limit = self.config.close_failure_limit;
                let failures = {
                    let state = self.state_mut(symbol);
                    state.phase = previous_phase;
                    state.close_failures += 1;
                    state.close_failures
                };
                warn!(symbol, failures, reason = %rejection, "청산 주문 실패");

                if failures >= limit {
                    let reason = format!("연속 청산 실패 {}회", failures);
                    if let Some(orphan) = self.force_reset(book, symbol, &reason) {
                        self.cancel_best_effort(symbol, &orphan.order_id).await;
                    }
                }
                Err(rejection)
            }
        }
    }

    // ========================================================================
    // 재동기화
    // ========================================================================

    /// 원장 재동기화 주문 제출.
    ///
    /// 목표 수량은 바꾸지 않습니다. 감소 전용이면 Close 락, 아니면 Open 락을 쓰고
    /// 최종 상태 푸시까지 보유합니다.
    pub async fn submit_resync(
        &mut self,
        book: &mut PositionBook,
        intent: OrderIntent,
    ) -> Result<OrderAck, Rejection> {
        let symbol = intent.symbol.clone();
        {
            let state = self.state_mut(&symbol);
            if state.quarantined {
                return Err(Rejection::Quarantined(symbol));
            }
            if state.in_flight.is_some()
                || matches!(
                    state.phase,
                    Phase::PendingOpen | Phase::PendingClose | Phase::Chasing
                )
            {
                let phase = state.phase;
                return Err(Rejection::Busy { symbol, phase });
            }
        }

        let purpose = if intent.reduce_only {
            LockPurpose::Close
        } else {
            LockPurpose::Open
        };
        self.locks
            .try_acquire(&symbol, purpose, intent.id, Instant::now())
            .map_err(|_| Rejection::Locked {
                symbol: symbol.clone(),
                purpose,
            })?;

        info!(
            symbol = %symbol,
            side = %intent.side,
            quantity = %intent.quantity,
            reduce_only = intent.reduce_only,
            "재동기화 주문 제출"
        );
        let prior_target = book.target(&symbol);
        match self.place_with_timeout(&intent).await {
            Ok(ack) => {
                let state = self.state_mut(&symbol);
                state.submitted_history += intent.quantity;
                state.in_flight = Some(InFlightOrder::new(&ack, &intent, purpose, prior_target));
                debug!(symbol = %symbol, target = %prior_target, "재동기화 주문 접수");
                Ok(ack)
            }
            Err(rejection) => {
                self.locks.release(&symbol, purpose);
                warn!(symbol = %symbol, reason = %rejection, "재동기화 주문 거부");
                Err(rejection)
            }
        }
    }

    // ========================================================================
    // 거래소 데이터 반영
    // ========================================================================

    /// 포지션 푸시 반영.
    pub fn on_position(&mut self, book: &mut PositionBook, snapshot: &PositionSnapshot) {
        book.apply_snapshot(snapshot);
        self.settle(book, &snapshot.symbol);
    }

    /// REST 포지션 조회 반영.
    pub fn apply_poll(&mut self, book: &mut PositionBook, snapshots: &[PositionSnapshot]) {
        book.apply_poll(snapshots);
        let symbols: Vec<String> = book.symbols().cloned().collect();
        for symbol in symbols {
            self.settle(book, &symbol);
        }
    }

    /// 무포지션 확인 시 단계 정리.
    fn settle(&mut self, book: &PositionBook, symbol: &str) {
        if !book.actual(symbol).is_zero() {
            return;
        }
        let Some(state) = self.states.get_mut(symbol) else {
            return;
        };

        if state.quarantined {
            info!(symbol, "무포지션 확인, 격리 해제");
            *state = SymbolState::default();
            return;
        }
        match state.phase {
            Phase::Closed => {
                info!(symbol, "청산 완료");
                state.phase = Phase::Idle;
                state.submitted_history = Decimal::ZERO;
                state.close_failures = 0;
            }
            Phase::Idle => state.submitted_history = Decimal::ZERO,
            _ => {}
        }
    }

    /// 주문 상태 푸시 반영.
    ///
    /// 추적 중인 대기 주문 또는 미해소 즉시 체결형 주문의 최종 해소 결과를 반환합니다.
    /// 즉시 체결형 주문이 최종 상태가 되면 보유하던 락을 해제합니다.
    pub fn on_order_update(
        &mut self,
        book: &mut PositionBook,
        update: &OrderUpdate,
    ) -> Option<IntentResolution> {
        let symbol = update.symbol.as_str();
        let state = self.states.get_mut(symbol)?;
        let client_id = update.client_order_id.as_deref();
        let resting = state
            .resting
            .as_ref()
            .is_some_and(|r| r.matches(&update.order_id, client_id));
        let in_flight = !resting
            && state
                .in_flight
                .as_ref()
                .is_some_and(|o| o.matches(&update.order_id, client_id));
        if !resting && !in_flight {
            return None;
        }

        let filled = update.filled_quantity;
        if matches!(update.status, OrderStatus::Live | OrderStatus::PartiallyFilled) {
            if let Some(order) = state.resting.as_mut().filter(|_| resting) {
                order.filled = filled;
            }
            if let Some(order) = state.in_flight.as_mut().filter(|_| in_flight) {
                order.filled = filled;
            }
            return None;
        }

        let (side, purpose, prior_target, resync) = if resting {
            let order = state.resting.take()?;
            (order.side, order.purpose, order.prior_target, false)
        } else {
            let order = state.in_flight.take()?;
            (order.side, order.purpose, order.prior_target, order.resync)
        };

        let confirmed = update.status == OrderStatus::Filled;
        if resync {
            // 목표 수량은 그대로, 무포지션에서 증가 방향으로 체결되면 보유 단계로
            if state.phase == Phase::Idle && purpose == LockPurpose::Open && !filled.is_zero() {
                state.phase = Phase::Open;
            }
        } else if confirmed {
            state.phase = match purpose {
                LockPurpose::Open => Phase::Open,
                LockPurpose::Close => Phase::Closed,
            };
        } else {
            state.phase = match purpose {
                LockPurpose::Open if filled.is_zero() => Phase::Idle,
                _ => Phase::Open,
            };
            book.set_target(symbol, prior_target + side.sign() * filled);
        }
        let resolution = if confirmed {
            IntentResolution::Confirmed { filled }
        } else {
            IntentResolution::Cancelled { filled }
        };

        if in_flight {
            self.locks.release(symbol, purpose);
        }
        info!(
            symbol,
            order_id = %update.order_id,
            resync,
            resolution = ?resolution,
            "주문 최종 상태"
        );
        self.settle(book, symbol);
        Some(resolution)
    }

    // ========================================================================
    // 비정상 상태
    // ========================================================================

    /// 제출 이력으로 설명되지 않는 포지션 탐지.
    ///
    /// `|actual| > history × (1 + tolerance)`이면 강제 초기화합니다.
    /// 초기화로 추적을 잃은 대기 주문 목록을 반환합니다 (호출자가 취소).
    pub fn detect_abnormal(&mut self, book: &mut PositionBook) -> Vec<(String, RestingOrder)> {
        let tolerance = self.tolerance;
        let symbols: Vec<String> = book.symbols().cloned().collect();
        let mut orphans = Vec::new();

        for symbol in symbols {
            let actual = book.actual(&symbol).abs();
            if actual.is_zero() {
                continue;
            }
            let state = self.state_mut(&symbol);
            if state.quarantined
                || state.in_flight.is_some()
                || matches!(state.phase, Phase::PendingOpen | Phase::PendingClose)
            {
                continue;
            }
            let allowance = state.submitted_history * (Decimal::ONE + tolerance);
            if actual > allowance {
                let reason = format!(
                    "설명되지 않는 포지션: actual={} history={}",
                    actual, state.submitted_history
                );
                if let Some(orphan) = self.force_reset(book, &symbol, &reason) {
                    orphans.push((symbol, orphan));
                }
            }
        }
        orphans
    }

    /// 심볼 상태를 무포지션으로 초기화하고 격리.
    ///
    /// 추적하던 대기 주문이 있으면 반환합니다.
    pub fn force_reset(
        &mut self,
        book: &mut PositionBook,
        symbol: &str,
        reason: &str,
    ) -> Option<RestingOrder> {
        let state = self.state_mut(symbol);
        let previous = std::mem::take(state);
        state.quarantined = true;

        error!(
            target: "operator_alert",
            symbol,
            reason,
            phase = ?previous.phase,
            history = %previous.submitted_history,
            actual = %book.actual(symbol),
            target = %book.target(symbol),
            "비정상 상태, 심볼 상태 강제 초기화 및 격리"
        );

        book.set_target(symbol, Decimal::ZERO);
        self.locks.release(symbol, LockPurpose::Open);
        self.locks.release(symbol, LockPurpose::Close);
        previous.resting
    }

    // ========================================================================
    // 추격
    // ========================================================================

    /// 추격 검사 1회.
    ///
    /// 만료된 락과 그 락이 지키던 미해소 주문을 먼저 정리한 뒤,
    /// `Chasing` 심볼마다 재호가/보류/상한 초과를 판단합니다.
    /// 치명적 거래소 에러만 `Err`로 반환합니다.
    pub async fn chase_tick(
        &mut self,
        book: &mut PositionBook,
        quotes: &HashMap<String, Quote>,
        now: Instant,
    ) -> Result<(), ExchangeError> {
        for expired in self.locks.expire(now) {
            self.lock_monitor.record(&expired.symbol, now);
            self.abandon_in_flight(book, &expired.symbol, expired.lock.purpose);
        }

        let candidates: Vec<(String, RestingOrder)> = self
            .states
            .iter()
            .filter(|(_, s)| s.phase == Phase::Chasing)
            .filter_map(|(symbol, s)| s.resting.clone().map(|r| (symbol.clone(), r)))
            .collect();

        for (symbol, order) in candidates {
            let Some(quote) = quotes.get(&symbol) else {
                continue;
            };
            let Some(instrument) = self.instruments.get(&symbol) else {
                continue;
            };
            let Some(market_price) = self.policy.maker_price(quote, order.side, instrument) else {
                continue;
            };

            match self.policy.evaluate(&order, market_price, now) {
                ChaseDecision::Hold(reason) => {
                    debug!(symbol = %symbol, reason = ?reason, "재호가 보류");
                }
                ChaseDecision::Reprice(new_price) => {
                    self.reprice(&symbol, &order, new_price, now).await?;
                }
                ChaseDecision::Escalate { distance } => {
                    self.escalate(book, &symbol, order, distance).await?;
                }
            }
        }
        Ok(())
    }

    /// 락 만료로 해소되지 않은 즉시 체결형 주문 추적 포기.
    ///
    /// 목표 수량은 접수 시 값 그대로 두고, 남는 차이는 원장 조정이 메웁니다.
    fn abandon_in_flight(&mut self, book: &PositionBook, symbol: &str, purpose: LockPurpose) {
        let Some(state) = self.states.get_mut(symbol) else {
            return;
        };
        if !state.in_flight.as_ref().is_some_and(|o| o.purpose == purpose) {
            return;
        }
        let Some(order) = state.in_flight.take() else {
            return;
        };
        if !order.resync {
            state.phase = match purpose {
                LockPurpose::Open => Phase::Open,
                LockPurpose::Close => Phase::Closed,
            };
        }
        warn!(
            symbol,
            order_id = %order.order_id,
            purpose = ?purpose,
            resync = order.resync,
            target = %book.target(symbol),
            actual = %book.actual(symbol),
            "최종 상태 미수신, 주문 추적 포기"
        );
        self.settle(book, symbol);
    }

    async fn reprice(
        &mut self,
        symbol: &str,
        order: &RestingOrder,
        new_price: Decimal,
        now: Instant,
    ) -> Result<(), ExchangeError> {
        let amend = self.gateway.amend_order(symbol, &order.order_id, new_price);
        match tokio::time::timeout(self.locks.timeout(), amend).await {
            Ok(Ok(())) => {
                if let Some(resting) = self
                    .state_mut(symbol)
                    .resting
                    .as_mut()
                    .filter(|r| r.order_id == order.order_id)
                {
                    resting.current_price = new_price;
                    resting.last_reprice_at = now;
                }
                info!(
                    symbol,
                    order_id = %order.order_id,
                    original = %order.original_price,
                    from = %order.current_price,
                    to = %new_price,
                    "대기 주문 재호가"
                );
                Ok(())
            }
            Ok(Err(e)) if e.is_fatal() => Err(e),
            Ok(Err(e)) => {
                warn!(symbol, order_id = %order.order_id, error = %e, "재호가 실패");
                Ok(())
            }
            Err(_) => {
                warn!(symbol, order_id = %order.order_id, "재호가 응답 시간 초과");
                Ok(())
            }
        }
    }

    /// 추격 상한 초과: 대기 주문 취소 후 청산 주문이면 즉시 청산으로 전환.
    async fn escalate(
        &mut self,
        book: &mut PositionBook,
        symbol: &str,
        order: RestingOrder,
        distance: Decimal,
    ) -> Result<(), ExchangeError> {
        warn!(
            symbol,
            order_id = %order.order_id,
            purpose = ?order.purpose,
            distance = %distance,
            "추격 상한 초과, 대기 주문 취소"
        );

        let cancel = self.gateway.cancel_order(symbol, &order.order_id);
        match tokio::time::timeout(self.locks.timeout(), cancel).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_fatal() => return Err(e),
            Ok(Err(e)) => {
                warn!(symbol, error = %e, "대기 주문 취소 실패, 다음 검사에서 재시도");
                return Ok(());
            }
            Err(_) => {
                warn!(symbol, "대기 주문 취소 응답 시간 초과, 다음 검사에서 재시도");
                return Ok(());
            }
        }

        let filled = order.filled;
        book.set_target(symbol, order.prior_target + order.side.sign() * filled);
        {
            let state = self.state_mut(symbol);
            state.resting = None;
            state.phase = match order.purpose {
                LockPurpose::Open if filled.is_zero() => Phase::Idle,
                _ => Phase::Open,
            };
        }

        if order.purpose == LockPurpose::Open {
            info!(symbol, filled = %filled, "진입 추격 중단");
            self.settle(book, symbol);
            return Ok(());
        }

        if book.actual(symbol).is_zero() {
            self.state_mut(symbol).phase = Phase::Closed;
            self.settle(book, symbol);
            return Ok(());
        }

        match self.close_position(book, symbol, OrderKind::Market, None).await {
            Ok(_) => Ok(()),
            Err(Rejection::Exchange(e)) if e.is_fatal() => Err(e),
            Err(rejection) => {
                warn!(symbol, reason = %rejection, "즉시 청산 전환 실패");
                Ok(())
            }
        }
    }

    // ========================================================================
    // 종료
    // ========================================================================

    /// 모든 대기 주문 취소 (추적 중 + 거래소 미체결 목록).
    ///
    /// 전체 과정은 `timeout` 안에서 끝나야 하며, 취소 확인된 주문 수를 반환합니다.
    pub async fn cancel_all_resting(&mut self, timeout: Duration) -> usize {
        let mut targets: Vec<(String, String)> = self
            .states
            .iter()
            .filter_map(|(symbol, s)| s.resting.as_ref().map(|r| (symbol.clone(), r.order_id.clone())))
            .collect();

        let gateway = Arc::clone(&self.gateway);
        let mut cancelled = 0usize;
        let work = async {
            match gateway.fetch_open_orders().await {
                Ok(open) => {
                    for order in open {
                        if !targets.iter().any(|(_, id)| *id == order.order_id) {
                            targets.push((order.symbol, order.order_id));
                        }
                    }
                }
                Err(e) => warn!(error = %e, "미체결 주문 조회 실패, 추적 중인 주문만 취소"),
            }

            for (symbol, order_id) in &targets {
                match gateway.cancel_order(symbol, order_id).await {
                    Ok(()) => {
                        cancelled += 1;
                        info!(symbol = %symbol, order_id = %order_id, "종료: 주문 취소");
                    }
                    Err(e) => warn!(symbol = %symbol, order_id = %order_id, error = %e, "종료: 주문 취소 실패"),
                }
            }
        };

        let finished = tokio::time::timeout(timeout, work).await.is_ok();
        if !finished {
            error!(
                target: "operator_alert",
                timeout_ms = timeout.as_millis() as u64,
                cancelled,
                "종료 중 주문 취소 확인 시간 초과, 잔여 주문 수동 확인 필요"
            );
        }

        for state in self.states.values_mut() {
            state.resting = None;
            state.in_flight = None;
            if state.phase == Phase::Chasing {
                state.phase = Phase::Open;
            }
        }
        cancelled
    }

    /// 모든 락 해제.
    pub fn release_all_locks(&mut self) -> usize {
        self.locks.release_all()
    }

    /// 추적을 잃은 주문 취소 (실패는 로그만).
    pub async fn cancel_best_effort(&self, symbol: &str, order_id: &str) {
        let cancel = self.gateway.cancel_order(symbol, order_id);
        match tokio::time::timeout(self.locks.timeout(), cancel).await {
            Ok(Ok(())) => info!(symbol, order_id, "추적 해제된 주문 취소"),
            Ok(Err(e)) => warn!(symbol, order_id, error = %e, "추적 해제된 주문 취소 실패"),
            Err(_) => warn!(symbol, order_id, "추적 해제된 주문 취소 시간 초과"),
        }
    }

    // ========================================================================
    // 내부
    // ========================================================================

    /// 주문 유형별 지정가. 시장가는 `None`.
    fn limit_price(
        &self,
        symbol: &str,
        side: Side,
        kind: OrderKind,
        quote: Option<&Quote>,
    ) -> Result<Option<Decimal>, Rejection> {
        if !kind.requires_price() {
            return Ok(None);
        }
        let instrument = self
            .instruments
            .get(symbol)
            .ok_or_else(|| Rejection::UnknownInstrument(symbol.to_string()))?;
        let quote = quote
            .filter(|q| q.is_valid())
            .ok_or_else(|| Rejection::NoQuote(symbol.to_string()))?;

        let price = match kind {
            OrderKind::Maker => self.policy.maker_price(quote, side, instrument),
            // IOC는 반대편 최우선 호가를 가져감
            _ => {
                let touch = match side {
                    Side::Buy => quote.ask,
                    Side::Sell => quote.bid,
                };
                Some(instrument.align_price(touch, side.opposite()))
            }
        };
        price
            .map(Some)
            .ok_or_else(|| Rejection::NoQuote(symbol.to_string()))
    }

    /// 락 타임아웃 안에서 주문 제출. 타임아웃은 거부로 처리하고 집계합니다.
    async fn place_with_timeout(&mut self, intent: &OrderIntent) -> Result<OrderAck, Rejection> {
        let timeout = self.locks.timeout();
        match tokio::time::timeout(timeout, self.gateway.place_order(intent)).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(e)) => Err(Rejection::Exchange(e)),
            Err(_) => {
                warn!(
                    symbol = %intent.symbol,
                    intent_id = %intent.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "락 타임아웃, 제출 시도 포기"
                );
                self.lock_monitor.record(&intent.symbol, Instant::now());
                Err(Rejection::LockTimeout {
                    symbol: intent.symbol.clone(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}
