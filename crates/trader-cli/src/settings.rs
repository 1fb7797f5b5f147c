//! 애플리케이션 설정.
//!
//! 시작 시 한 번 로드합니다. 우선순위는 다음과 같습니다.
//!
//! 1. 기본값 (각 필드의 `Default`)
//! 2. `trader.toml` (없으면 건너뜀)
//! 3. `TRADER__SECTION__FIELD` 환경 변수
//!
//! 자격 증명은 설정 파일에 두지 않고 `OKX_*` 환경 변수에서만 읽습니다.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use trader_core::MarginMode;
use trader_exchange::{CalibrationConfig, Credentials, RetryConfig, StreamConfig, Venue};
use trader_execution::{EngineConfig, LedgerConfig, OrderConfig};
use trader_risk::SizingConfig;

/// 기본 설정 파일 경로.
pub const DEFAULT_CONFIG_PATH: &str = "trader.toml";

const ENV_PREFIX: &str = "TRADER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("설정 로드 실패: {0}")]
    Load(#[from] config::ConfigError),

    #[error("환경 변수 누락: {0}")]
    MissingCredential(&'static str),

    #[error("잘못된 설정 {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// 섹션
// ============================================================================

/// 거래소 연결 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    /// 모의거래 여부. `OKX_SIMULATED`가 있으면 그 값이 우선합니다.
    pub simulated: bool,
    /// REST 주소 재정의
    pub rest_url: Option<String>,
    pub max_clock_skew_secs: u64,
    pub calibration_attempts: u32,
    pub margin_mode: MarginMode,
    /// 시작 시 심볼별로 적용할 레버리지 (없으면 거래소 설정 유지)
    pub leverage: Option<u32>,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            simulated: true,
            rest_url: None,
            max_clock_skew_secs: 30,
            calibration_attempts: 3,
            margin_mode: MarginMode::Cross,
            leverage: None,
        }
    }
}

impl ExchangeSettings {
    pub fn venue(&self) -> Venue {
        if self.simulated {
            Venue::Simulated
        } else {
            Venue::Live
        }
    }

    pub fn calibration(&self) -> CalibrationConfig {
        CalibrationConfig {
            max_skew: Duration::from_secs(self.max_clock_skew_secs),
            attempts: self.calibration_attempts,
        }
    }
}

/// REST 재시도 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            add_jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `RUST_LOG`이 없을 때 쓰는 필터
    pub level: String,
    /// JSON 출력
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ============================================================================
// AppConfig
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub exchange: ExchangeSettings,
    pub retry: RetrySettings,
    pub stream: StreamConfig,
    pub ledger: LedgerConfig,
    pub orders: OrderConfig,
    pub engine: EngineConfig,
    pub sizing: SizingConfig,
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// 파일과 환경 변수에서 로드.
    ///
    /// 경로를 주지 않으면 `trader.toml`을 찾고, 없으면 기본값만 씁니다.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut config: AppConfig = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;

        if let Some(simulated) = env_flag("OKX_SIMULATED") {
            config.exchange.simulated = simulated;
        }
        Ok(config)
    }

    /// TOML 문자열에서 로드. 환경 변수는 반영하지 않습니다.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?)
    }

    /// 값 범위 검증.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.symbols.is_empty() {
            return Err(ConfigError::invalid("engine.symbols", "비어 있음"));
        }
        if self.engine.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::invalid("engine.symbols", "빈 심볼"));
        }

        let unit = Decimal::ONE;
        if self.ledger.tolerance <= Decimal::ZERO || self.ledger.tolerance > unit {
            return Err(ConfigError::invalid(
                "ledger.tolerance",
                format!("(0, 1] 범위 밖: {}", self.ledger.tolerance),
            ));
        }
        if self.ledger.epsilon < Decimal::ZERO {
            return Err(ConfigError::invalid("ledger.epsilon", "음수"));
        }
        if self.sizing.risk_fraction <= Decimal::ZERO || self.sizing.risk_fraction > unit {
            return Err(ConfigError::invalid(
                "sizing.risk_fraction",
                format!("(0, 1] 범위 밖: {}", self.sizing.risk_fraction),
            ));
        }

        if self.orders.lock_timeout_ms == 0 {
            return Err(ConfigError::invalid("orders.lock_timeout_ms", "0"));
        }
        if self.orders.min_chase_distance < Decimal::ZERO {
            return Err(ConfigError::invalid("orders.min_chase_distance", "음수"));
        }
        if self.orders.max_chase_distance < self.orders.min_chase_distance {
            return Err(ConfigError::invalid(
                "orders.max_chase_distance",
                "min_chase_distance보다 작음",
            ));
        }
        if self.orders.lock_timeout_window_secs == 0 {
            return Err(ConfigError::invalid("orders.lock_timeout_window_secs", "0"));
        }

        if self.stream.reconnect_base_ms == 0 {
            return Err(ConfigError::invalid("stream.reconnect_base_ms", "0"));
        }
        if self.stream.reconnect_cap_ms < self.stream.reconnect_base_ms {
            return Err(ConfigError::invalid(
                "stream.reconnect_cap_ms",
                "reconnect_base_ms보다 작음",
            ));
        }
        if self.stream.stale_after_ms == 0 {
            return Err(ConfigError::invalid("stream.stale_after_ms", "0"));
        }
        if self.stream.ping_interval_ms == 0 {
            return Err(ConfigError::invalid("stream.ping_interval_ms", "0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                "base_delay_ms보다 작음",
            ));
        }

        // tokio interval은 0 주기를 허용하지 않음
        if self.ledger.interval_secs == 0 {
            return Err(ConfigError::invalid("ledger.interval_secs", "0"));
        }
        if self.engine.chase_interval_ms == 0 {
            return Err(ConfigError::invalid("engine.chase_interval_ms", "0"));
        }
        if self.engine.clock_refresh_secs == 0 {
            return Err(ConfigError::invalid("engine.clock_refresh_secs", "0"));
        }

        if self.exchange.leverage == Some(0) {
            return Err(ConfigError::invalid("exchange.leverage", "0"));
        }
        if self.exchange.calibration_attempts == 0 {
            return Err(ConfigError::invalid("exchange.calibration_attempts", "0"));
        }
        Ok(())
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("engine.symbols")
        .ignore_empty(true)
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    parse_flag(&value)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ============================================================================
// 자격 증명
// ============================================================================

/// `OKX_API_KEY`, `OKX_SECRET_KEY`, `OKX_PASSPHRASE`에서 자격 증명 로드.
pub fn load_credentials() -> Result<Credentials, ConfigError> {
    credentials_from(|name| std::env::var(name).ok())
}

fn credentials_from<F>(lookup: F) -> Result<Credentials, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &'static str| -> Result<String, ConfigError> {
        lookup(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingCredential(name))
    };

    let api_key = read("OKX_API_KEY")?;
    let secret_key = read("OKX_SECRET_KEY")?;
    let passphrase = read("OKX_PASSPHRASE")?;
    Ok(Credentials::new(api_key, secret_key, passphrase))
}
