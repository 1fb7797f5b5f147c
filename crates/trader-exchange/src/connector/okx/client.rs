//! OKX 서명 REST 클라이언트.
//!
//! 모든 응답은 `{code, msg, data: [...]}` 봉투로 오며 `code != "0"`이면 실패입니다.
//! 주문 단위 실패는 `data[0].sCode`로 분류합니다.
//! 네트워크/요청 한도 에러는 백오프로 재시도하고, 타임스탬프 에러는
//! 시계를 재보정한 뒤 한 번만 재시도합니다.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use trader_core::{
    InstrumentSpec, MarginMode, OrderIntent, OrderKind, OrderUpdate, PositionSnapshot,
    PositionSource,
};

use super::{
    auth::rest_timestamp,
    clock::{measure_offset, Session},
    messages::{aggregate_positions, parse_decimal, OkxOrder, OkxPosition},
    OkxEndpoints,
};
use crate::{
    retry::{with_retry, RetryConfig},
    traits::{ExchangeGateway, OrderAck},
    ExchangeError,
};

const SERVER_TIME_PATH: &str = "/api/v5/public/time";
const BALANCE_PATH: &str = "/api/v5/account/balance";
const POSITIONS_PATH: &str = "/api/v5/account/positions";
const INSTRUMENTS_PATH: &str = "/api/v5/public/instruments";
const LEVERAGE_PATH: &str = "/api/v5/account/set-leverage";
const ORDER_PATH: &str = "/api/v5/trade/order";
const AMEND_PATH: &str = "/api/v5/trade/amend-order";
const CANCEL_PATH: &str = "/api/v5/trade/cancel-order";
const PENDING_ORDERS_PATH: &str = "/api/v5/trade/orders-pending";

const INST_TYPE: &str = "SWAP";

// ============================================================================
// 설정
// ============================================================================

/// 시계 보정 설정.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// 허용 최대 오프셋 (거래소 허용 오차)
    pub max_skew: Duration,
    /// 오프셋이 허용치를 넘을 때 측정 반복 횟수
    pub attempts: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            max_skew: Duration::from_secs(30),
            attempts: 3,
        }
    }
}

// ============================================================================
// API 응답 타입
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemStatus {
    #[serde(default)]
    s_code: String,
    #[serde(default)]
    s_msg: String,
}

#[derive(Debug, Deserialize)]
struct ServerTime {
    ts: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Balance {
    #[serde(default)]
    total_eq: String,
    #[serde(default)]
    details: Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceDetail {
    ccy: String,
    #[serde(default)]
    eq: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instrument {
    inst_id: String,
    #[serde(default)]
    ct_val: String,
    #[serde(default)]
    lot_sz: String,
    #[serde(default)]
    min_sz: String,
    #[serde(default)]
    tick_sz: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResult {
    #[serde(default)]
    ord_id: String,
    #[serde(default)]
    cl_ord_id: String,
}

// ============================================================================
// 요청 바디
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrderBody<'a> {
    inst_id: &'a str,
    td_mode: &'a str,
    side: &'a str,
    ord_type: &'a str,
    sz: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    px: Option<String>,
    reduce_only: bool,
    cl_ord_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AmendOrderBody<'a> {
    inst_id: &'a str,
    ord_id: &'a str,
    new_px: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelOrderBody<'a> {
    inst_id: &'a str,
    ord_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetLeverageBody<'a> {
    inst_id: &'a str,
    lever: String,
    mgn_mode: &'a str,
}

fn ord_type(kind: OrderKind) -> &'static str {
    match kind {
        OrderKind::Maker => "post_only",
        OrderKind::ImmediateOrCancel => "ioc",
        OrderKind::Market => "market",
    }
}

// ============================================================================
// OKX 클라이언트
// ============================================================================

pub struct OkxRestClient {
    http: Client,
    session: Session,
    base_url: String,
    retry: RetryConfig,
    calibration: CalibrationConfig,
    margin_mode: MarginMode,
}

impl OkxRestClient {
    pub fn new(session: Session, endpoints: &OkxEndpoints) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(endpoints.request_timeout)
            .build()
            .map_err(|e| ExchangeError::NetworkError(format!("HTTP 클라이언트 생성 실패: {}", e)))?;
        Ok(Self {
            http,
            session,
            base_url: endpoints.rest_url.trim_end_matches('/').to_string(),
            retry: RetryConfig::default(),
            calibration: CalibrationConfig::default(),
            margin_mode: MarginMode::Cross,
        })
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_calibration(mut self, calibration: CalibrationConfig) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn with_margin_mode(mut self, margin_mode: MarginMode) -> Self {
        self.margin_mode = margin_mode;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    // ==================== 요청 공통 ====================

    /// 단일 요청 (재시도 없음).
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&str>,
        signed: bool,
    ) -> Result<Vec<T>, ExchangeError> {
        let request_path = if query.is_empty() {
            path.to_string()
        } else {
            let qs = serde_urlencoded::to_string(query)
                .map_err(|e| ExchangeError::InvalidRequest(format!("쿼리 인코딩 실패: {}", e)))?;
            format!("{}?{}", path, qs)
        };
        let body = body.unwrap_or_default();
        let url = format!("{}{}", self.base_url, request_path);

        let mut builder = self.http.request(method.clone(), &url);
        if signed {
            let timestamp = rest_timestamp(self.session.clock.now());
            let headers = self.session.credentials.rest_headers(
                self.session.venue,
                &timestamp,
                method.as_str(),
                &request_path,
                body,
            )?;
            builder = builder.headers(headers);
        }
        if !body.is_empty() {
            // 서명한 문자열 그대로 전송
            builder = builder.body(body.to_string());
        }

        debug!(method = %method, path = %request_path, "REST 요청");
        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        parse_envelope(status, &text)
    }

    /// 서명 요청: 네트워크 재시도 + 타임스탬프 에러 시 재보정 후 1회 재시도.
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&str>,
    ) -> Result<Vec<T>, ExchangeError> {
        let first = with_retry(&self.retry, || {
            self.request::<T>(method.clone(), path, query, body, true)
        })
        .await;

        match first {
            Err(e) if e.is_timestamp() => {
                warn!(error = %e, path, "타임스탬프 거부, 시계 재보정 후 재시도");
                self.calibrate_clock().await?;
                self.request(method, path, query, body, true).await
            }
            other => other,
        }
    }

    fn first<T>(rows: Vec<T>, what: &str) -> Result<T, ExchangeError> {
        rows.into_iter()
            .next()
            .ok_or_else(|| ExchangeError::ParseError(format!("{} 응답이 비어 있음", what)))
    }

    // ==================== 공개 API ====================

    /// 서버 시각 (epoch 밀리초). 인증 불필요.
    pub async fn server_time(&self) -> Result<i64, ExchangeError> {
        let rows: Vec<ServerTime> = with_retry(&self.retry, || {
            self.request(Method::GET, SERVER_TIME_PATH, &[], None, false)
        })
        .await?;
        let row = Self::first(rows, "server time")?;
        row.ts
            .parse::<i64>()
            .map_err(|e| ExchangeError::ParseError(format!("ts 파싱 실패: {}", e)))
    }

    /// 시계 오프셋 측정 및 적용.
    ///
    /// 오프셋이 허용치를 넘으면 설정된 횟수만큼 다시 측정하며,
    /// 끝내 넘으면 서명 요청을 하지 않도록 `ClockSkew`를 반환합니다.
    pub async fn calibrate_clock(&self) -> Result<i64, ExchangeError> {
        let max_ms = self.calibration.max_skew.as_millis() as i64;
        let attempts = self.calibration.attempts.max(1);
        let mut last_offset = 0;

        for attempt in 1..=attempts {
            let sent = Utc::now();
            let server_ms = self.server_time().await?;
            let received = Utc::now();
            let offset = measure_offset(sent, received, server_ms);
            last_offset = offset;

            if offset.abs() <= max_ms {
                self.session.clock.set_offset_ms(offset);
                info!(
                    offset_ms = offset,
                    rtt_ms = (received - sent).num_milliseconds(),
                    "서버 시계 보정 완료"
                );
                return Ok(offset);
            }
            warn!(offset_ms = offset, max_ms, attempt, attempts, "시계 오차 허용치 초과, 재측정");
        }

        Err(ExchangeError::ClockSkew {
            offset_ms: last_offset,
            max_ms,
        })
    }

    /// 통화별 자산 평가액. 통화 상세가 없으면 총 평가액.
    pub async fn get_balance(&self, ccy: &str) -> Result<Decimal, ExchangeError> {
        let rows: Vec<Balance> = self
            .signed(Method::GET, BALANCE_PATH, &[("ccy", ccy.to_string())], None)
            .await?;
        let balance = Self::first(rows, "balance")?;
        match balance.details.iter().find(|d| d.ccy == ccy) {
            Some(detail) => parse_decimal("eq", &detail.eq),
            None => parse_decimal("totalEq", &balance.total_eq),
        }
    }

    /// 무기한 스왑 포지션 (심볼별 합산).
    pub async fn get_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        let mut query = vec![("instType", INST_TYPE.to_string())];
        if let Some(symbol) = symbol {
            query.push(("instId", symbol.to_string()));
        }
        let rows: Vec<OkxPosition> = self.signed(Method::GET, POSITIONS_PATH, &query, None).await?;
        aggregate_positions(&rows, PositionSource::Poll)
    }

    /// 거래 가능한 무기한 스왑 상품 명세.
    pub async fn get_instruments(&self) -> Result<Vec<InstrumentSpec>, ExchangeError> {
        let query = [("instType", INST_TYPE.to_string())];
        let rows: Vec<Instrument> = with_retry(&self.retry, || {
            self.request(Method::GET, INSTRUMENTS_PATH, &query, None, false)
        })
        .await?;

        rows.into_iter()
            .filter(|i| i.state == "live")
            .map(|i| -> Result<InstrumentSpec, ExchangeError> {
                Ok(InstrumentSpec {
                    contract_value: parse_decimal("ctVal", &i.ct_val)?,
                    lot_size: parse_decimal("lotSz", &i.lot_sz)?,
                    min_size: parse_decimal("minSz", &i.min_sz)?,
                    tick_size: parse_decimal("tickSz", &i.tick_sz)?,
                    symbol: i.inst_id,
                })
            })
            .collect()
    }

    /// 주문 제출.
    ///
    /// 주문은 중복 체결 위험이 있으므로 네트워크 재시도는 하지 않습니다.
    pub async fn place_order(&self, intent: &OrderIntent) -> Result<OrderAck, ExchangeError> {
        if intent.kind.requires_price() && intent.price.is_none() {
            return Err(ExchangeError::InvalidRequest(format!(
                "{:?} 주문에 가격이 없음",
                intent.kind
            )));
        }

        let body = PlaceOrderBody {
            inst_id: &intent.symbol,
            td_mode: self.margin_mode.as_str(),
            side: intent.side.as_str(),
            ord_type: ord_type(intent.kind),
            sz: intent.quantity.normalize().to_string(),
            px: intent
                .price
                .filter(|_| intent.kind.requires_price())
                .map(|p| p.normalize().to_string()),
            reduce_only: intent.reduce_only,
            cl_ord_id: intent.client_order_id(),
        };
        let body = serde_json::to_string(&body)?;

        let rows: Vec<OrderResult> = self.single_shot(Method::POST, ORDER_PATH, &body).await?;
        let row = Self::first(rows, "order")?;
        info!(
            symbol = %intent.symbol,
            side = %intent.side,
            kind = ?intent.kind,
            quantity = %intent.quantity,
            order_id = %row.ord_id,
            "주문 접수"
        );
        Ok(OrderAck {
            order_id: row.ord_id,
            client_order_id: row.cl_ord_id,
        })
    }

    /// 지정가 주문 가격 변경.
    pub async fn amend_order(
        &self,
        symbol: &str,
        order_id: &str,
        new_price: Decimal,
    ) -> Result<(), ExchangeError> {
        let body = serde_json::to_string(&AmendOrderBody {
            inst_id: symbol,
            ord_id: order_id,
            new_px: new_price.normalize().to_string(),
        })?;
        let _: Vec<OrderResult> = self.single_shot(Method::POST, AMEND_PATH, &body).await?;
        Ok(())
    }

    /// 주문 취소.
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let body = serde_json::to_string(&CancelOrderBody {
            inst_id: symbol,
            ord_id: order_id,
        })?;
        let _: Vec<OrderResult> = self.signed(Method::POST, CANCEL_PATH, &[], Some(&body)).await?;
        Ok(())
    }

    /// 미체결 주문.
    pub async fn get_pending_orders(&self) -> Result<Vec<OrderUpdate>, ExchangeError> {
        let rows: Vec<OkxOrder> = self
            .signed(
                Method::GET,
                PENDING_ORDERS_PATH,
                &[("instType", INST_TYPE.to_string())],
                None,
            )
            .await?;
        rows.iter().map(OkxOrder::to_update).collect()
    }

    /// 레버리지 설정.
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let body = serde_json::to_string(&SetLeverageBody {
            inst_id: symbol,
            lever: leverage.to_string(),
            mgn_mode: self.margin_mode.as_str(),
        })?;
        let _: Vec<Value> = self.signed(Method::POST, LEVERAGE_PATH, &[], Some(&body)).await?;
        info!(symbol, leverage, "레버리지 설정 완료");
        Ok(())
    }

    /// 주문성 요청: 타임스탬프 에러만 재보정 후 1회 재시도.
    async fn single_shot<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &str,
    ) -> Result<Vec<T>, ExchangeError> {
        match self.request(method.clone(), path, &[], Some(body), true).await {
            Err(e) if e.is_timestamp() => {
                warn!(error = %e, path, "타임스탬프 거부, 시계 재보정 후 재시도");
                self.calibrate_clock().await?;
                self.request(method, path, &[], Some(body), true).await
            }
            other => other,
        }
    }
}

/// 응답 봉투 해석.
fn parse_envelope<T: DeserializeOwned>(status: StatusCode, text: &str) -> Result<Vec<T>, ExchangeError> {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                ExchangeError::RateLimited(format!("HTTP {}", status))
            } else if status.is_server_error() {
                ExchangeError::NetworkError(format!("HTTP {}", status))
            } else {
                ExchangeError::ParseError(format!("HTTP {}: {}", status, e))
            });
        }
    };

    if envelope.code != "0" {
        // 주문 단위 실패 코드 우선
        if let Ok(items) = serde_json::from_value::<Vec<ItemStatus>>(envelope.data.clone()) {
            if let Some(item) = items.iter().find(|i| !i.s_code.is_empty() && i.s_code != "0") {
                return Err(ExchangeError::from_okx_code(&item.s_code, &item.s_msg));
            }
        }
        return Err(ExchangeError::from_okx_code(&envelope.code, &envelope.msg));
    }

    if envelope.data.is_null() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_value(envelope.data)?)
}

// ============================================================================
// ExchangeGateway 구현
// ============================================================================

#[async_trait]
impl ExchangeGateway for OkxRestClient {
    fn venue_name(&self) -> &str {
        self.session.venue.as_str()
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderAck, ExchangeError> {
        OkxRestClient::place_order(self, intent).await
    }

    async fn amend_order(
        &self,
        symbol: &str,
        order_id: &str,
        new_price: Decimal,
    ) -> Result<(), ExchangeError> {
        OkxRestClient::amend_order(self, symbol, order_id, new_price).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        OkxRestClient::cancel_order(self, symbol, order_id).await
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        self.get_positions(None).await
    }

    async fn fetch_open_orders(&self) -> Result<Vec<OrderUpdate>, ExchangeError> {
        self.get_pending_orders().await
    }

    async fn fetch_equity(&self, ccy: &str) -> Result<Decimal, ExchangeError> {
        self.get_balance(ccy).await
    }

    async fn fetch_instruments(&self) -> Result<Vec<InstrumentSpec>, ExchangeError> {
        self.get_instruments().await
    }

    async fn refresh_clock(&self) -> Result<i64, ExchangeError> {
        self.calibrate_clock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_success() {
        let rows: Vec<ServerTime> = parse_envelope(
            StatusCode::OK,
            r#"{"code":"0","msg":"","data":[{"ts":"1704067200000"}]}"#,
        )
        .unwrap();
        assert_eq!(rows[0].ts, "1704067200000");
    }

    #[test]
    fn test_envelope_item_code_wins() {
        let err = parse_envelope::<OrderResult>(
            StatusCode::OK,
            r#"{"code":"1","msg":"Operation failed.","data":[{"ordId":"","clOrdId":"x","sCode":"51008","sMsg":"Insufficient margin"}]}"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ExchangeError::OrderRejected {
                code: "51008".to_string(),
                msg: "Insufficient margin".to_string()
            }
        );
    }

    #[test]
    fn test_envelope_http_errors() {
        assert!(matches!(
            parse_envelope::<Value>(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            Err(ExchangeError::RateLimited(_))
        ));
        assert!(matches!(
            parse_envelope::<Value>(StatusCode::BAD_GATEWAY, "<html>"),
            Err(ExchangeError::NetworkError(_))
        ));
        assert!(matches!(
            parse_envelope::<Value>(
                StatusCode::UNAUTHORIZED,
                r#"{"code":"50101","msg":"APIKey does not match current environment.","data":[]}"#
            ),
            Err(ExchangeError::EnvironmentMismatch { .. })
        ));
    }

    #[test]
    fn test_order_body_is_compact_camel_case() {
        let body = PlaceOrderBody {
            inst_id: "BTC-USDT-SWAP",
            td_mode: "cross",
            side: "buy",
            ord_type: "market",
            sz: "0.54".to_string(),
            px: None,
            reduce_only: false,
            cl_ord_id: "abc".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"instId":"BTC-USDT-SWAP","tdMode":"cross","side":"buy","ordType":"market","sz":"0.54","reduceOnly":false,"clOrdId":"abc"}"#
        );
    }
}
