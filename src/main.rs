//! THETA: intraday 0DTE credit spread engine
//!
//! Entry point. Loads configuration, initialises structured logging, wires
//! the broker session, market data and alert sinks, and runs one trading
//! day with graceful shutdown on Ctrl+C.

use anyhow::{bail, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use theta::alerts::telegram::TelegramSink;
use theta::alerts::{AlertSink, Alerts, LogSink};
use theta::broker::calendar::regular_session;
use theta::broker::paper::{ChainFixture, PaperBroker};
use theta::broker::BrokerSession;
use theta::config::{self, AppConfig};
use theta::engine::{DailySchedule, EngineRuntime};
use theta::market_data::polygon::PolygonClient;
use theta::market_data::MarketDataProvider;

const BANNER: &str = r#"
 _____ _   _ _____ _____  _
|_   _| | | | ____|_   _|/ \
  | | | |_| |  _|   | | / _ \
  | | |  _  | |___  | |/ ___ \
  |_| |_| |_|_____| |_/_/   \_\

  0DTE credit spread engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("THETA_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    let schedule = DailySchedule::from_config(&cfg)?;
    let date = schedule.trading_date(Utc::now());
    info!(
        engine = %cfg.engine.name,
        %date,
        symbol = %cfg.instrument.symbol,
        broker_mode = %cfg.broker.mode,
        "THETA starting up"
    );

    // -- Initialise components -------------------------------------------

    let broker = build_broker(&cfg, date)?;

    let api_key = AppConfig::resolve_secret(&cfg.market_data.api_key_env)?;
    let market_data: Arc<dyn MarketDataProvider> =
        Arc::new(PolygonClient::new(&cfg.market_data.base_url, api_key)?);

    let alerts = build_alerts(&cfg)?;
    info!(sinks = alerts.sink_count(), "Alerts configured");

    let mut runtime = EngineRuntime::new(cfg, broker, market_data, alerts, date)?;

    // -- Run the day -----------------------------------------------------

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let interrupted = tokio::select! {
        result = runtime.run() => {
            result?;
            false
        }
        _ = &mut shutdown => {
            info!("Shutdown signal received.");
            true
        }
    };
    if interrupted {
        runtime.shutdown("Interrupted by operator").await;
    }

    info!(
        state = %runtime.state(),
        fills = runtime.session().fills().len(),
        manual_intervention = runtime.machine().needs_manual_intervention(),
        "THETA shut down cleanly."
    );
    Ok(())
}

fn build_broker(cfg: &AppConfig, date: chrono::NaiveDate) -> Result<Arc<dyn BrokerSession>> {
    match cfg.broker.mode.as_str() {
        "paper" => {
            let fixture = ChainFixture::load(&cfg.broker.paper_chain_path)?;
            info!(
                path = %cfg.broker.paper_chain_path,
                quotes = fixture.quotes.len(),
                "Using paper broker"
            );
            Ok(Arc::new(PaperBroker::from_fixture(fixture, date, regular_session(date))))
        }
        other => bail!("Unsupported broker mode: {other}"),
    }
}

/// Log sink always; Telegram when both its env vars resolve.
fn build_alerts(cfg: &AppConfig) -> Result<Alerts> {
    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink)];

    if let (Some(token_env), Some(chat_env)) = (
        cfg.alerts.telegram_bot_token_env.as_deref(),
        cfg.alerts.telegram_chat_id_env.as_deref(),
    ) {
        match (
            AppConfig::resolve_secret(token_env),
            AppConfig::resolve_env(chat_env),
        ) {
            (Ok(token), Ok(chat_id)) => {
                sinks.push(Arc::new(TelegramSink::new(token, chat_id, &cfg.engine.name)?));
            }
            _ => warn!("Telegram alerts configured but credentials missing; log only"),
        }
    }

    Ok(Alerts::new(
        sinks,
        Duration::from_secs(cfg.alerts.sink_timeout_secs),
    ))
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("theta=info"));

    let json_logging = std::env::var("THETA_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
