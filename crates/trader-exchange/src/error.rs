//! 거래소 에러 분류.
//!
//! 거래소 응답 코드를 재시도 가능 여부와 치명도에 따라 분류합니다.
//! 치명적 에러(인증 실패, 환경 불일치, 재연결 소진)만 연결을 종료하고
//! 운영자에게 보고되며, 나머지는 호출자가 복구합니다.

use thiserror::Error;

/// 거래소 에러.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    /// 서명/자격 증명 오류
    #[error("인증 실패: {0}")]
    Authentication(String),

    /// 자격 증명과 엔드포인트 환경(모의/실거래) 불일치
    #[error("환경 불일치 (code {code}): {msg}")]
    EnvironmentMismatch { code: String, msg: String },

    /// 요청 타임스탬프가 거래소 허용 범위를 벗어남
    #[error("타임스탬프 에러 (code {code}): {msg}")]
    Timestamp { code: String, msg: String },

    /// 보정 재시도 후에도 시계 오차가 허용치를 넘음
    #[error("시계 오차 초과: offset={offset_ms}ms, 허용={max_ms}ms")]
    ClockSkew { offset_ms: i64, max_ms: i64 },

    /// 네트워크 에러 (타임아웃, 연결 리셋)
    #[error("네트워크 에러: {0}")]
    NetworkError(String),

    /// 요청 한도 초과
    #[error("요청 한도 초과: {0}")]
    RateLimited(String),

    /// 거래소 측 주문 검증 실패
    #[error("주문 거부 (code {code}): {msg}")]
    OrderRejected { code: String, msg: String },

    /// 기타 API 에러
    #[error("API 에러 (code {code}): {msg}")]
    Api { code: String, msg: String },

    /// 응답 파싱 실패
    #[error("파싱 에러: {0}")]
    ParseError(String),

    /// 스트림 연결 끊김
    #[error("연결 끊김: {0}")]
    Disconnected(String),

    /// 최대 재연결 시도 소진
    #[error("재연결 시도 소진 ({attempts}회)")]
    ReconnectExhausted { attempts: u32 },

    /// 잘못된 요청 인자
    #[error("잘못된 요청: {0}")]
    InvalidRequest(String),
}

impl ExchangeError {
    /// 거래소 응답 코드로부터 에러 분류.
    pub fn from_okx_code(code: &str, msg: &str) -> Self {
        let code_owned = code.to_string();
        let msg_owned = msg.to_string();
        match code {
            "50101" => ExchangeError::EnvironmentMismatch {
                code: code_owned,
                msg: msg_owned,
            },
            "50102" | "50112" | "60004" | "60006" => ExchangeError::Timestamp {
                code: code_owned,
                msg: msg_owned,
            },
            "50103" | "50104" | "50105" | "50111" | "50113" | "60005" | "60007" | "60009"
            | "60024" => ExchangeError::Authentication(format!("{} ({})", msg, code)),
            "50011" | "50061" => ExchangeError::RateLimited(format!("{} ({})", msg, code)),
            c if c.starts_with("51") => ExchangeError::OrderRejected {
                code: code_owned,
                msg: msg_owned,
            },
            _ => ExchangeError::Api {
                code: code_owned,
                msg: msg_owned,
            },
        }
    }

    /// 치명적 에러 여부 (재시도 불가, 운영자 보고 대상).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExchangeError::Authentication(_)
                | ExchangeError::EnvironmentMismatch { .. }
                | ExchangeError::ClockSkew { .. }
                | ExchangeError::ReconnectExhausted { .. }
        )
    }

    /// 백오프 재시도 가능 여부.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::NetworkError(_)
                | ExchangeError::RateLimited(_)
                | ExchangeError::Disconnected(_)
        )
    }

    /// 시계 재보정이 필요한 에러인지.
    pub fn is_timestamp(&self) -> bool {
        matches!(self, ExchangeError::Timestamp { .. })
    }

    /// 에러별 권장 대기 시간 (밀리초).
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            ExchangeError::RateLimited(_) => Some(1000),
            _ => None,
        }
    }
}

// ==================== 에러 변환 ====================

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ExchangeError::ParseError(err.to_string())
        } else {
            ExchangeError::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::ParseError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ExchangeError::Disconnected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_mismatch_is_fatal() {
        let err = ExchangeError::from_okx_code("50101", "APIKey does not match current environment.");
        assert!(matches!(err, ExchangeError::EnvironmentMismatch { .. }));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_code_classification() {
        assert!(ExchangeError::from_okx_code("50102", "Timestamp request expired").is_timestamp());
        assert!(ExchangeError::from_okx_code("60004", "Invalid timestamp").is_timestamp());
        assert!(ExchangeError::from_okx_code("50113", "Invalid Sign").is_fatal());
        assert!(ExchangeError::from_okx_code("60009", "Login failed").is_fatal());
        assert!(ExchangeError::from_okx_code("50011", "Too Many Requests").is_retryable());
        assert!(matches!(
            ExchangeError::from_okx_code("51008", "Insufficient balance"),
            ExchangeError::OrderRejected { .. }
        ));
        assert!(matches!(
            ExchangeError::from_okx_code("50000", "Body cannot be empty"),
            ExchangeError::Api { .. }
        ));
    }

    #[test]
    fn test_order_rejected_not_retried() {
        let err = ExchangeError::OrderRejected {
            code: "51020".to_string(),
            msg: "Order amount should be greater than the min available amount".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());
    }
}
