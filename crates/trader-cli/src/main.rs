//! OKX 실행 코어 CLI.
//!
//! # 사용 예시
//!
//! ```bash
//! # 엔진 실행 (trader.toml + TRADER__* 환경 변수)
//! trader run --config trader.toml
//!
//! # 서버 시계 오프셋 측정
//! trader calibrate
//!
//! # 포지션 크기 계산
//! trader size --equity 54 --entry 100 --stop 99 --contract-value 1 --lot-size 0.01 --min-size 0.01
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trader_core::InstrumentSpec;
use trader_exchange::{
    ChannelArg, ExchangeGateway, OkxEndpoints, OkxRestClient, OkxStream, Session,
};
use trader_execution::Engine;
use trader_risk::{CapitalCommander, PrecisionMode, SizingRequest};

mod settings;

use settings::{load_credentials, AppConfig, LoggingSettings};

/// 스트림 이벤트 채널 크기.
const EVENT_BUFFER: usize = 1024;

#[derive(Parser)]
#[command(name = "trader")]
#[command(about = "OKX 실행 코어 - 포지션 대사, 사이징, 주문 상태 기계", long_about = None)]
#[command(version)]
struct Cli {
    /// 설정 파일 (기본: trader.toml, 없으면 기본값)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 엔진 실행 (공개/계좌 스트림 + 대사 + 주문 상태 기계)
    Run,

    /// 서버 시계 오프셋 측정
    Calibrate,

    /// 포지션 크기 계산
    Size {
        /// 계좌 평가금
        #[arg(long)]
        equity: Decimal,

        /// 진입가
        #[arg(long)]
        entry: Decimal,

        /// 손절가
        #[arg(long)]
        stop: Decimal,

        /// 계약 1개당 기초자산 수량 (ctVal)
        #[arg(long)]
        contract_value: Decimal,

        /// 수량 최소 증분 (lotSz)
        #[arg(long)]
        lot_size: Decimal,

        /// 최소 주문 수량 (minSz)
        #[arg(long)]
        min_size: Decimal,

        /// 리스크 비율 (기본: 설정값)
        #[arg(long)]
        risk: Option<Decimal>,

        /// 축소 정밀도 (소수점 4자리)
        #[arg(long, default_value = "false")]
        reduced: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // .env 파일 로드 (없어도 에러 안남)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("설정 로드 실패")?;
    init_tracing(&config.logging);

    config.validate().context("설정 검증 실패")?;

    match cli.command {
        Commands::Run => run_engine(config).await,
        Commands::Calibrate => calibrate(config).await,
        Commands::Size {
            equity,
            entry,
            stop,
            contract_value,
            lot_size,
            min_size,
            risk,
            reduced,
        } => {
            let precision = if reduced {
                PrecisionMode::Reduced
            } else {
                config.sizing.precision
            };
            let spec = InstrumentSpec {
                symbol: "CLI".to_string(),
                contract_value,
                lot_size,
                min_size,
                tick_size: Decimal::ZERO,
            };
            let request = SizingRequest {
                equity,
                entry,
                stop,
                risk_fraction: risk.unwrap_or(config.sizing.risk_fraction),
            };

            let result = CapitalCommander::new(precision)
                .size(&request, &spec)
                .context("사이징 실패")?;

            println!("precision     : {:?}", precision);
            println!("risk amount   : {}", result.risk_amount);
            println!("raw quantity  : {}", result.raw_quantity);
            println!("quantity      : {}", result.quantity);
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| logging.level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

// ============================================================================
// 서브커맨드
// ============================================================================

fn build_client(config: &AppConfig) -> anyhow::Result<(Session, OkxEndpoints, OkxRestClient)> {
    let credentials = load_credentials()?;
    let venue = config.exchange.venue();
    let session = Session::new(credentials, venue);

    let mut endpoints = OkxEndpoints::for_venue(venue);
    if let Some(url) = &config.exchange.rest_url {
        endpoints = endpoints.with_rest_url(url.clone());
    }

    let client = OkxRestClient::new(session.clone(), &endpoints)?
        .with_retry_config(config.retry.to_retry_config())
        .with_calibration(config.exchange.calibration())
        .with_margin_mode(config.exchange.margin_mode);

    Ok((session, endpoints, client))
}

async fn calibrate(config: AppConfig) -> anyhow::Result<()> {
    let (session, _, client) = build_client(&config)?;

    let offset = client.calibrate_clock().await.context("시계 보정 실패")?;
    let server_time = client.server_time().await?;

    println!("venue       : {}", session.venue.as_str());
    println!("offset (ms) : {}", offset);
    println!("server time : {}", server_time);
    Ok(())
}

async fn run_engine(config: AppConfig) -> anyhow::Result<()> {
    let (session, endpoints, client) = build_client(&config)?;

    let offset = client.calibrate_clock().await.context("시계 보정 실패")?;
    info!(
        venue = session.venue.as_str(),
        offset_ms = offset,
        "서버 시계 보정 완료"
    );

    if let Some(leverage) = config.exchange.leverage {
        for symbol in &config.engine.symbols {
            client
                .set_leverage(symbol, leverage)
                .await
                .with_context(|| format!("레버리지 설정 실패: {}", symbol))?;
            info!(symbol = %symbol, leverage, "레버리지 설정");
        }
    }

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let stream_token = CancellationToken::new();

    let tickers = config
        .engine
        .symbols
        .iter()
        .map(ChannelArg::tickers)
        .collect();
    let public = OkxStream::public(
        endpoints.public_ws_url.clone(),
        tickers,
        config.stream.clone(),
        tx.clone(),
    );
    let private = OkxStream::private(
        endpoints.private_ws_url.clone(),
        session.clone(),
        vec![ChannelArg::positions(), ChannelArg::orders()],
        config.stream.clone(),
        tx,
    );

    let public_task = tokio::spawn(public.run(stream_token.clone()));
    let private_task = tokio::spawn(private.run(stream_token.clone()));

    let gateway: Arc<dyn ExchangeGateway> = Arc::new(client);
    let (engine, _handle) = Engine::new(
        config.engine.clone(),
        config.ledger.clone(),
        config.orders.clone(),
        config.sizing.clone(),
        gateway,
        rx,
        stream_token.clone(),
    );

    let shutdown = engine.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("종료 신호 수신");
            shutdown.cancel();
        }
    });

    let outcome = engine.run().await;

    // 엔진이 종료 순서대로 토큰을 취소하지만, 시작 실패 경로를 위해 다시 취소
    stream_token.cancel();
    for (name, task) in [("public", public_task), ("private", private_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(stream = name, error = %e, "스트림 종료 오류"),
            Err(e) => warn!(stream = name, error = %e, "스트림 태스크 중단"),
        }
    }

    match outcome {
        Ok(summary) => {
            info!(
                commands = summary.commands_processed,
                reconcile_ticks = summary.reconcile_ticks,
                cancelled_orders = summary.cancelled_orders,
                released_locks = summary.released_locks,
                "엔진 종료"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "엔진 비정상 종료");
            Err(e.into())
        }
    }
}
