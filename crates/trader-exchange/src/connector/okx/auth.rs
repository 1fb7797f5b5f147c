//! OKX 자격 증명과 요청 서명.
//!
//! 서명은 `base64(HMAC-SHA256(secret, timestamp + METHOD + requestPath + body))`입니다.
//! REST 타임스탬프는 ISO-8601 UTC 밀리초 (`2024-01-01T00:00:00.123Z`),
//! 스트림 로그인 타임스탬프는 Unix epoch 초 + 소수부 (`1704067200.123`)입니다.
//! 모의거래 헤더는 서명 이후에 추가되며 서명 대상에 포함되지 않습니다.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use sha2::Sha256;

use super::Venue;
use crate::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

/// 로그인 서명 경로.
const LOGIN_VERIFY_PATH: &str = "/users/self/verify";

/// 모의거래 표시 헤더.
pub const SIMULATED_TRADING_HEADER: &str = "x-simulated-trading";

// ============================================================================
// 자격 증명
// ============================================================================

/// API 자격 증명 (venue 별로 발급됨).
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    secret_key: SecretString,
    passphrase: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***")
            .field("secret_key", &"***")
            .field("passphrase", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            secret_key: SecretString::from(secret_key.into()),
            passphrase: SecretString::from(passphrase.into()),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// 비어 있는 항목이 있는지.
    pub fn is_incomplete(&self) -> bool {
        self.api_key.is_empty()
            || self.secret_key.expose_secret().is_empty()
            || self.passphrase.expose_secret().is_empty()
    }

    /// 서명 원문에 대한 base64 HMAC-SHA256.
    pub fn sign(&self, prehash: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.expose_secret().as_bytes())
            .map_err(|e| ExchangeError::Authentication(format!("HMAC 키 생성 실패: {}", e)))?;
        mac.update(prehash.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// 서명된 REST 헤더.
    ///
    /// 모의거래 venue이면 서명 후 `x-simulated-trading: 1`을 추가합니다.
    pub fn rest_headers(
        &self,
        venue: Venue,
        timestamp: &str,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> Result<HeaderMap, ExchangeError> {
        let sign = self.sign(&prehash(timestamp, method, request_path, body))?;

        let mut headers = HeaderMap::new();
        headers.insert("ok-access-key", header_value(&self.api_key)?);
        headers.insert("ok-access-sign", header_value(&sign)?);
        headers.insert("ok-access-timestamp", header_value(timestamp)?);
        headers.insert(
            "ok-access-passphrase",
            header_value(self.passphrase.expose_secret())?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if venue.is_simulated() {
            headers.insert(SIMULATED_TRADING_HEADER, HeaderValue::from_static("1"));
        }
        Ok(headers)
    }

    /// 스트림 로그인 메시지.
    ///
    /// `timestamp`는 [`ws_timestamp`] 형식이어야 합니다.
    pub fn login_message(&self, timestamp: &str) -> Result<String, ExchangeError> {
        let sign = self.sign(&prehash(timestamp, "GET", LOGIN_VERIFY_PATH, ""))?;
        let msg = json!({
            "op": "login",
            "args": [{
                "apiKey": self.api_key,
                "passphrase": self.passphrase.expose_secret(),
                "timestamp": timestamp,
                "sign": sign,
            }]
        });
        Ok(msg.to_string())
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ExchangeError> {
    HeaderValue::from_str(value)
        .map_err(|e| ExchangeError::InvalidRequest(format!("헤더 값 오류: {}", e)))
}

// ============================================================================
// 서명 원문과 타임스탬프
// ============================================================================

/// 서명 원문. `method`는 대문자로 정규화됩니다.
pub fn prehash(timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
    format!(
        "{}{}{}{}",
        timestamp,
        method.to_ascii_uppercase(),
        request_path,
        body
    )
}

/// REST 타임스탬프 (ISO-8601, UTC, 밀리초).
pub fn rest_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// 스트림 로그인 타임스탬프 (epoch 초.밀리초).
pub fn ws_timestamp(at: DateTime<Utc>) -> String {
    let ms = at.timestamp_millis();
    format!("{}.{:03}", ms.div_euclid(1000), ms.rem_euclid(1000))
}
