//! 재시도와 지수 백오프.
//!
//! 스트림 재연결과 REST 재시도가 같은 순수 함수 [`backoff_delay`]로 대기 시간을 계산합니다.
//! 치명적 에러(인증, 환경 불일치)와 거래소 거부는 재시도하지 않습니다.
//!
//! ```rust,ignore
//! let positions = with_retry(&RetryConfig::default(), || client.get_positions(None)).await?;
//! ```

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::{debug, warn};

use crate::ExchangeError;

/// `attempt`번째 실패 후 대기 시간.
///
/// `min(cap, base * 2^(attempt - 1))`. `attempt == 0`이면 0, 곱셈이 넘치면 `cap`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let Some(exponent) = attempt.checked_sub(1) else {
        return Duration::ZERO;
    };
    match 2u32.checked_pow(exponent).and_then(|f| base.checked_mul(f)) {
        Some(delay) => delay.min(cap),
        None => cap,
    }
}

/// REST 재시도 설정.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 첫 시도 이후 추가 시도 횟수
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 대기 시간에 ±25% 무작위 편차
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    fn wait_before(&self, retry: u32, error: &ExchangeError) -> Duration {
        let mut delay = backoff_delay(retry, self.base_delay, self.max_delay);
        // 레이트 리밋 응답이 준 대기 시간이 하한
        if let Some(hint) = error.retry_delay_ms() {
            delay = delay.max(Duration::from_millis(hint));
        }
        if !self.add_jitter {
            return delay;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
        delay.mul_f64(factor)
    }
}

/// `operation`을 재시도 가능한 에러에 한해 반복 실행.
///
/// 치명적이거나 재시도 불가한 에러는 즉시 반환하고, 재시도를 모두 쓰면 마지막 에러를 반환합니다.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut retries = 0u32;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    debug!(retries, "재시도 후 성공");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if error.is_fatal() {
            warn!(error = %error, "치명적 에러, 재시도하지 않음");
            return Err(error);
        }
        if !error.is_retryable() || retries >= config.max_retries {
            if retries > 0 {
                warn!(error = %error, retries, "재시도 소진");
            }
            return Err(error);
        }

        retries += 1;
        let wait = config.wait_before(retries, &error);
        warn!(
            error = %error,
            retry = retries,
            of = config.max_retries,
            wait_ms = wait.as_millis() as u64,
            "요청 실패, 재시도 대기"
        );
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn no_jitter(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            add_jitter: false,
        }
    }

    /// 처음 `failures`번은 `error`로 실패하고 이후 성공하는 작업을 실행해 (결과, 호출 수) 반환.
    async fn run_flaky(
        config: &RetryConfig,
        failures: u32,
        error: fn() -> ExchangeError,
    ) -> (Result<u32, ExchangeError>, u32) {
        let calls = Cell::new(0u32);
        let result = with_retry(config, || {
            let n = calls.get() + 1;
            calls.set(n);
            async move {
                if n <= failures {
                    Err(error())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        (result, calls.get())
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(300);
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| backoff_delay(attempt, base, cap).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80]);
    }

    #[test]
    fn test_backoff_bounds() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_delay(0, base, cap), Duration::ZERO);
        assert_eq!(backoff_delay(7, base, cap), cap);
        assert_eq!(backoff_delay(64, base, cap), cap);
    }

    #[test]
    fn test_rate_limit_hint_is_lower_bound() {
        let config = no_jitter(3);
        let limited = ExchangeError::from_okx_code("50011", "too many requests");
        let wait = config.wait_before(1, &limited);
        assert!(wait >= Duration::from_millis(limited.retry_delay_ms().unwrap_or(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_retried_until_success() {
        let (result, calls) = run_flaky(&no_jitter(3), 2, || {
            ExchangeError::NetworkError("connection reset".to_string())
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_environment_mismatch_not_retried() {
        let (result, calls) =
            run_flaky(&no_jitter(3), 5, || ExchangeError::from_okx_code("50101", "env")).await;
        assert!(matches!(result, Err(ExchangeError::EnvironmentMismatch { .. })));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_rejection_not_retried() {
        let (result, calls) = run_flaky(&no_jitter(3), 5, || {
            ExchangeError::from_okx_code("51020", "below minimum")
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::OrderRejected { .. })));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let (result, calls) = run_flaky(&no_jitter(2), u32::MAX, || {
            ExchangeError::NetworkError("항상 실패".to_string())
        })
        .await;
        assert!(result.is_err());
        // 첫 시도 + 재시도 2회
        assert_eq!(calls, 3);
    }
}
