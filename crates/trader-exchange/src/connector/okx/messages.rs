//! 스트림 프레임 파싱과 공용 응답 DTO.
//!
//! 거래소는 숫자를 문자열로 보내며, 빈 문자열은 "값 없음"입니다.
//! 구독 성공은 `event: "subscribe"` 에코 자체로 판단합니다 (성공 코드 필드는 없을 수 있음).

use std::{collections::BTreeMap, str::FromStr};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trader_core::{
    MarginMode, OrderStatus, OrderUpdate, PositionSnapshot, PositionSource, Quote, Side,
};

use crate::ExchangeError;

// ============================================================================
// 구독 인자
// ============================================================================

/// 채널 구독 인자.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelArg {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inst_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inst_type: Option<String>,
}

impl ChannelArg {
    /// 최우선 호가 채널 (public).
    pub fn tickers(symbol: impl Into<String>) -> Self {
        Self {
            channel: "tickers".to_string(),
            inst_id: Some(symbol.into()),
            inst_type: None,
        }
    }

    /// 무기한 스왑 포지션 채널 (private).
    pub fn positions() -> Self {
        Self {
            channel: "positions".to_string(),
            inst_id: None,
            inst_type: Some("SWAP".to_string()),
        }
    }

    /// 무기한 스왑 주문 채널 (private).
    pub fn orders() -> Self {
        Self {
            channel: "orders".to_string(),
            inst_id: None,
            inst_type: Some("SWAP".to_string()),
        }
    }
}

#[derive(Serialize)]
struct OpMessage<'a> {
    op: &'a str,
    args: &'a [ChannelArg],
}

/// 구독 요청 메시지.
pub fn subscribe_message(args: &[ChannelArg]) -> Result<String, ExchangeError> {
    Ok(serde_json::to_string(&OpMessage {
        op: "subscribe",
        args,
    })?)
}

// ============================================================================
// 수신 프레임
// ============================================================================

/// 채널 푸시 데이터.
#[derive(Debug, Clone, PartialEq)]
pub enum PushData {
    Positions(Vec<PositionSnapshot>),
    Orders(Vec<OrderUpdate>),
    Tickers(Vec<Quote>),
}

/// 서버 → 클라이언트 프레임.
#[derive(Debug, Clone, PartialEq)]
pub enum WsInbound {
    /// keepalive 응답 (`pong`)
    Pong,
    /// 로그인 응답
    Login { code: String, msg: String },
    /// 구독 에코
    Subscribed(ChannelArg),
    /// 에러 이벤트
    Error { code: String, msg: String },
    /// 채널 데이터
    Push(PushData),
    /// 처리하지 않는 프레임 (연결 수 알림 등)
    Other,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: Option<String>,
    code: Option<String>,
    #[serde(default)]
    msg: String,
    arg: Option<ChannelArg>,
    data: Option<Value>,
}

/// 로그에 남길 프레임 앞부분 길이 (문자 수).
const FRAME_PREVIEW_CHARS: usize = 200;

/// 파싱에 실패한 프레임의 채널명과 앞부분 (로그용).
pub fn frame_preview(text: &str) -> (Option<String>, &str) {
    let channel = serde_json::from_str::<Value>(text).ok().and_then(|v| {
        v.pointer("/arg/channel")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let head = match text.char_indices().nth(FRAME_PREVIEW_CHARS) {
        Some((end, _)) => &text[..end],
        None => text,
    };
    (channel, head)
}

/// 텍스트 프레임 파싱.
pub fn parse_inbound(text: &str) -> Result<WsInbound, ExchangeError> {
    if text == "pong" {
        return Ok(WsInbound::Pong);
    }

    let frame: RawFrame = serde_json::from_str(text)?;
    if let Some(event) = frame.event.as_deref() {
        let code = frame.code.unwrap_or_default();
        return Ok(match event {
            "login" => WsInbound::Login {
                code,
                msg: frame.msg,
            },
            "subscribe" => match frame.arg {
                Some(arg) => WsInbound::Subscribed(arg),
                None => WsInbound::Other,
            },
            "error" => WsInbound::Error {
                code,
                msg: frame.msg,
            },
            _ => WsInbound::Other,
        });
    }

    let (Some(arg), Some(data)) = (frame.arg, frame.data) else {
        return Ok(WsInbound::Other);
    };

    let push = match arg.channel.as_str() {
        "positions" => {
            let rows: Vec<OkxPosition> = serde_json::from_value(data)?;
            PushData::Positions(aggregate_positions(&rows, PositionSource::Push)?)
        }
        "orders" => {
            let rows: Vec<OkxOrder> = serde_json::from_value(data)?;
            PushData::Orders(
                rows.iter()
                    .map(OkxOrder::to_update)
                    .collect::<Result<Vec<_>, _>>()?,
            )
        }
        "tickers" => {
            let rows: Vec<OkxTicker> = serde_json::from_value(data)?;
            PushData::Tickers(
                rows.iter()
                    .map(OkxTicker::to_quote)
                    .collect::<Result<Vec<_>, _>>()?,
            )
        }
        _ => return Ok(WsInbound::Other),
    };
    Ok(WsInbound::Push(push))
}

// ============================================================================
// 공용 DTO (REST 응답과 스트림 푸시가 같은 필드를 사용)
// ============================================================================

/// 포지션 행.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxPosition {
    pub inst_id: String,
    #[serde(default)]
    pub pos: String,
    #[serde(default)]
    pub avg_px: String,
    #[serde(default)]
    pub lever: String,
    #[serde(default)]
    pub pos_side: String,
    #[serde(default)]
    pub mgn_mode: String,
}

impl OkxPosition {
    /// 부호 있는 수량. long/short 모드에서는 `posSide`가 부호를 결정합니다.
    pub fn signed_quantity(&self) -> Result<Decimal, ExchangeError> {
        let pos = parse_decimal("pos", &self.pos)?;
        Ok(match self.pos_side.as_str() {
            "short" => -pos.abs(),
            "long" => pos.abs(),
            _ => pos,
        })
    }
}

/// 심볼별로 행을 합산한 스냅샷.
pub fn aggregate_positions(
    rows: &[OkxPosition],
    source: PositionSource,
) -> Result<Vec<PositionSnapshot>, ExchangeError> {
    let mut by_symbol: BTreeMap<&str, PositionSnapshot> = BTreeMap::new();
    for row in rows {
        let quantity = row.signed_quantity()?;
        let entry = by_symbol
            .entry(row.inst_id.as_str())
            .or_insert_with(|| PositionSnapshot::flat(row.inst_id.clone(), source));
        entry.quantity += quantity;
        if !quantity.is_zero() {
            entry.avg_price = parse_opt_decimal(&row.avg_px);
            entry.leverage = parse_opt_decimal(&row.lever);
            entry.margin_mode = MarginMode::parse(&row.mgn_mode);
        }
    }
    Ok(by_symbol.into_values().collect())
}

/// 주문 행.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxOrder {
    pub inst_id: String,
    pub ord_id: String,
    #[serde(default)]
    pub cl_ord_id: String,
    pub side: String,
    pub state: String,
    #[serde(default)]
    pub px: String,
    #[serde(default)]
    pub sz: String,
    #[serde(default)]
    pub acc_fill_sz: String,
    #[serde(default)]
    pub avg_px: String,
    #[serde(default)]
    pub u_time: String,
}

impl OkxOrder {
    pub fn to_update(&self) -> Result<OrderUpdate, ExchangeError> {
        let side = match self.side.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            other => return Err(ExchangeError::ParseError(format!("알 수 없는 side: {}", other))),
        };
        let status = OrderStatus::parse(&self.state).ok_or_else(|| {
            ExchangeError::ParseError(format!("알 수 없는 주문 상태: {}", self.state))
        })?;
        Ok(OrderUpdate {
            symbol: self.inst_id.clone(),
            order_id: self.ord_id.clone(),
            client_order_id: (!self.cl_ord_id.is_empty()).then(|| self.cl_ord_id.clone()),
            side,
            status,
            price: parse_opt_decimal(&self.px),
            quantity: parse_decimal("sz", &self.sz)?,
            filled_quantity: parse_decimal("accFillSz", &self.acc_fill_sz)?,
            avg_fill_price: parse_opt_decimal(&self.avg_px),
            updated_at: parse_millis(&self.u_time),
        })
    }
}

/// 최우선 호가 행.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxTicker {
    pub inst_id: String,
    #[serde(default)]
    pub bid_px: String,
    #[serde(default)]
    pub ask_px: String,
    #[serde(default)]
    pub last: String,
    #[serde(default)]
    pub ts: String,
}

impl OkxTicker {
    pub fn to_quote(&self) -> Result<Quote, ExchangeError> {
        Ok(Quote {
            symbol: self.inst_id.clone(),
            bid: parse_decimal("bidPx", &self.bid_px)?,
            ask: parse_decimal("askPx", &self.ask_px)?,
            last: parse_decimal("last", &self.last)?,
            updated_at: parse_millis(&self.ts),
        })
    }
}

// ==================== 파싱 헬퍼 ====================

/// 문자열 숫자 파싱. 빈 문자열은 0.
pub(crate) fn parse_decimal(field: &str, value: &str) -> Result<Decimal, ExchangeError> {
    if value.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(value)
        .map_err(|e| ExchangeError::ParseError(format!("{} 파싱 실패 ({}): {}", field, value, e)))
}

/// 문자열 숫자 파싱. 빈 문자열이나 잘못된 값은 `None`.
pub(crate) fn parse_opt_decimal(value: &str) -> Option<Decimal> {
    if value.is_empty() {
        None
    } else {
        Decimal::from_str(value).ok()
    }
}

fn parse_millis(value: &str) -> DateTime<Utc> {
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}
