// ─────────────────────────────────────────────────────────────────────────────
// grid-engine: dual-account hedge-grid trading engine
//
// Wires configuration, both exchange sessions, the ATR channel, the shared
// grid plan, the two direction-polymorphic executors, and the sync
// controller's risk loop together, then drains on SIGINT: load config, build
// the exchange session(s), spawn the control loop, log throughout with
// env_logger.
// ─────────────────────────────────────────────────────────────────────────────
mod account_manager;
mod atr;
mod config;
mod decimal;
mod errors;
mod exchange;
mod executor;
mod grid_level;
mod grid_plan;
mod ingestor;
mod persistence;
mod signing;
mod symbol;
mod sync_controller;

use std::sync::Arc;

use rust_decimal_macros::dec;

use account_manager::DualAccountManager;
use atr::ATRChannel;
use config::GridConfig;
use exchange::{ExchangeSession, LiveExchange, SimExchange};
use executor::{AdmissionPolicy, GridExecutor};
use grid_level::Direction;
use grid_plan::SharedGridEngine;
use persistence::EventLog;
use sync_controller::{ControllerState, SyncController};

const DEFAULT_LIVE_BASE_URL: &str = "https://fapi.example-venue.com";
const DEFAULT_LIVE_WS_URL: &str = "wss://fstream.example-venue.com";

fn build_session(cfg: &GridConfig, api_key: &str, api_secret: &str, initial_balance: rust_decimal::Decimal) -> Arc<dyn ExchangeSession> {
    if cfg.mock {
        let rules = symbol::SymbolRules {
            symbol: cfg.symbol.clone(),
            tick_size: dec!(0.00001),
            lot_size: dec!(1),
            min_notional: dec!(5),
            leverage_brackets: vec![symbol::LeverageBracket {
                notional_floor: dec!(0),
                notional_cap: dec!(1_000_000),
                maintenance_margin_ratio: dec!(0.01),
                max_leverage: cfg.max_leverage_limit,
            }],
        };
        Arc::new(SimExchange::new(&cfg.symbol, initial_balance, dec!(1.0), rules))
    } else {
        Arc::new(LiveExchange::new(
            DEFAULT_LIVE_BASE_URL.to_string(),
            DEFAULT_LIVE_WS_URL.to_string(),
            api_key.to_string(),
            api_secret.to_string(),
        ))
    }
}

fn admission_policy(cfg: &GridConfig, tick_size: rust_decimal::Decimal) -> AdmissionPolicy {
    AdmissionPolicy {
        max_open_orders: cfg.max_open_orders,
        max_orders_per_batch: cfg.max_orders_per_batch,
        order_frequency_s: cfg.order_frequency_s,
        activation_bounds_pct: cfg.activation_bounds_pct,
        upper_lower_ratio: cfg.upper_lower_ratio,
        safe_extra_spread: tick_size * rust_decimal::Decimal::from(cfg.safe_extra_spread_ticks),
        order_timeout_s: cfg.order_timeout_s,
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cfg = match GridConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("[main] configuration invalid: {e}");
            std::process::exit(1);
        }
    };
    log::info!("[main] starting grid engine for {} (mock={})", cfg.symbol, cfg.mock);

    let event_log = Arc::new(EventLog::open(cfg.event_log_path.as_deref()));

    // Sessions start with a nominal balance in mock mode; live mode fetches
    // the real balance immediately below and the seed value is discarded.
    let long_session = build_session(&cfg, &cfg.long_api_key, &cfg.long_api_secret, dec!(10000));
    let short_session = build_session(&cfg, &cfg.short_api_key, &cfg.short_api_secret, dec!(10000));
    let accounts = DualAccountManager::new(long_session.clone(), short_session.clone(), cfg.symbol.clone(), cfg.quote_asset.clone());

    let rules = match accounts.initialize(cfg.max_leverage_limit).await {
        Ok(r) => r,
        Err(e) => {
            log::error!("[main] account initialization failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = accounts.pre_flight(cfg.force_flatten_on_start).await {
        log::error!("[main] pre-flight check failed: {e}");
        std::process::exit(1);
    }

    let min_balance = match accounts.min_balance().await {
        Ok(b) => b,
        Err(e) => {
            log::error!("[main] could not read account balances: {e}");
            std::process::exit(1);
        }
    };
    if let Ok(equal) = accounts.balances_equal_within(cfg.balance_tolerance_pct).await {
        if !equal {
            log::warn!(
                "[main] long/short balances diverge by more than {} tolerance; continuing with the smaller balance",
                cfg.balance_tolerance_pct
            );
        }
    }

    let bars = match long_session.fetch_ohlcv(&cfg.symbol, &cfg.atr_timeframe, cfg.atr_length + cfg.atr_lookback + 1).await {
        Ok(b) => b,
        Err(e) => {
            log::error!("[main] failed to fetch OHLCV history: {e}");
            std::process::exit(1);
        }
    };
    let channel = ATRChannel::new(cfg.atr_length, cfg.atr_multiplier, cfg.atr_lookback);
    let atr_result = match channel.compute(&bars) {
        Some(r) => r,
        None => {
            log::error!("[main] insufficient bars to compute an ATR channel");
            std::process::exit(1);
        }
    };

    let mut epoch_id: u64 = 1;
    let mut plan = match SharedGridEngine::compute_plan(&atr_result, min_balance, &rules, &cfg, epoch_id) {
        Ok(p) => p,
        Err(e) => {
            log::error!("[main] could not compute a feasible grid plan: {e}");
            std::process::exit(1);
        }
    };

    let total_equity = min_balance * dec!(2);

    loop {
        log::info!(
            "[main] epoch {epoch_id}: {} levels, spacing={}, notional_per_level={}, leverage={}x",
            plan.levels_count,
            plan.spacing,
            plan.notional_per_level,
            plan.usable_leverage
        );

        let long = GridExecutor::new(Direction::Long, cfg.symbol.clone(), long_session.clone(), rules.clone(), plan.clone(), admission_policy(&cfg, rules.tick_size))
            .with_event_log(event_log.clone());
        let short = GridExecutor::new(Direction::Short, cfg.symbol.clone(), short_session.clone(), rules.clone(), plan.clone(), admission_policy(&cfg, rules.tick_size))
            .with_event_log(event_log.clone());
        let controller_accounts = DualAccountManager::new(long_session.clone(), short_session.clone(), cfg.symbol.clone(), cfg.quote_asset.clone());

        let mut controller = SyncController::new(long, short, controller_accounts, cfg.clone(), total_equity).with_event_log(event_log.clone());

        let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            log::warn!("[main] SIGINT received, draining");
            let _ = shutdown_tx.send(()).await;
        });

        controller.run(shutdown_rx).await;

        if !matches!(controller.state(), ControllerState::AwaitingReset) {
            log::info!("[main] engine stopped: {:?}", controller.state());
            break;
        }

        log::warn!("[main] channel breakout unwound; recomputing a fresh plan for the next epoch");
        epoch_id += 1;

        let bars = match long_session.fetch_ohlcv(&cfg.symbol, &cfg.atr_timeframe, cfg.atr_length + cfg.atr_lookback + 1).await {
            Ok(b) => b,
            Err(e) => {
                log::error!("[main] failed to refresh OHLCV history for epoch reset: {e}");
                break;
            }
        };
        let atr_result = match channel.compute(&bars) {
            Some(r) => r,
            None => {
                log::error!("[main] insufficient bars for epoch reset");
                break;
            }
        };
        let min_balance = accounts.min_balance().await.unwrap_or(min_balance);
        plan = match SharedGridEngine::compute_plan(&atr_result, min_balance, &rules, &cfg, epoch_id) {
            Ok(p) => p,
            Err(e) => {
                log::error!("[main] could not recompute a feasible plan for epoch {epoch_id}: {e}");
                break;
            }
        };
    }
}
