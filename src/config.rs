// ─────────────────────────────────────────────────────────────────────────────
// config.rs — GridConfig
//
// Collects what would otherwise be scattered `env::var("X").unwrap_or(...)`
// reads in main.rs into one struct, loaded and validated as a group (a
// malformed config is cheaper to fix all at once than one field at a time).
// ─────────────────────────────────────────────────────────────────────────────
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::str::FromStr;

use crate::errors::EngineError;

#[derive(Debug, Clone)]
pub struct GridConfig {
    pub long_api_key: String,
    pub long_api_secret: String,
    pub short_api_key: String,
    pub short_api_secret: String,

    pub symbol: String,
    pub quote_asset: String,

    pub atr_length: u32,
    pub atr_multiplier: f64,
    pub atr_timeframe: String,
    pub atr_lookback: u32,

    pub spacing_multiplier: Decimal,
    pub max_open_orders: u32,
    pub max_orders_per_batch: u32,
    pub order_frequency_s: f64,
    pub activation_bounds_pct: Decimal,
    pub upper_lower_ratio: Decimal,
    pub safety_factor: Decimal,
    pub max_leverage_limit: u32,
    pub utilization_ratio: Decimal,

    pub risk_check_interval_s: f64,
    pub max_margin_ratio: Decimal,
    pub max_drawdown_pct: Decimal,
    pub balance_tolerance_pct: Decimal,
    pub order_timeout_s: u64,
    pub disconnect_grace_s: u64,
    pub safe_extra_spread_ticks: u32,

    pub force_flatten_on_start: bool,
    pub reset_on_channel_breakout: bool,

    pub log_level: String,
    pub event_log_path: Option<String>,
    pub mock: bool,
}

impl GridConfig {
    /// Loads configuration from process environment variables, optionally
    /// after `dotenvy::dotenv()` has populated them from a local `.env` file,
    /// applying documented per-field defaults, then validates the result as
    /// a whole.
    pub fn from_env() -> Result<Self, EngineError> {
        let _ = dotenvy::dotenv();

        let cfg = GridConfig {
            long_api_key: env_string("LONG_API_KEY", ""),
            long_api_secret: env_string("LONG_API_SECRET", ""),
            short_api_key: env_string("SHORT_API_KEY", ""),
            short_api_secret: env_string("SHORT_API_SECRET", ""),

            symbol: env_string("SYMBOL", "DOGE/USDC:USDC"),
            quote_asset: env_string("QUOTE_ASSET", "USDC"),

            atr_length: env_parse("ATR_LENGTH", 14)?,
            atr_multiplier: env_parse("ATR_MULTIPLIER", 2.0)?,
            atr_timeframe: env_string("ATR_TIMEFRAME", "1h"),
            atr_lookback: env_parse("ATR_LOOKBACK", 20)?,

            spacing_multiplier: env_decimal("SPACING_MULTIPLIER", dec!(0.26))?,
            max_open_orders: env_parse("MAX_OPEN_ORDERS", 4)?,
            max_orders_per_batch: env_parse("MAX_ORDERS_PER_BATCH", 2)?,
            order_frequency_s: env_parse("ORDER_FREQUENCY_S", 3.0)?,
            activation_bounds_pct: env_decimal("ACTIVATION_BOUNDS_PCT", dec!(0.05))?,
            upper_lower_ratio: env_decimal("UPPER_LOWER_RATIO", dec!(0.5))?,
            safety_factor: env_decimal("SAFETY_FACTOR", dec!(0.8))?,
            max_leverage_limit: env_parse("MAX_LEVERAGE_LIMIT", 20)?,
            utilization_ratio: env_decimal("UTILIZATION_RATIO", dec!(0.8))?,

            risk_check_interval_s: env_parse("RISK_CHECK_INTERVAL_S", 1.0)?,
            max_margin_ratio: env_decimal("MAX_MARGIN_RATIO", dec!(0.8))?,
            max_drawdown_pct: env_decimal("MAX_DRAWDOWN_PCT", dec!(0.15))?,
            balance_tolerance_pct: env_decimal("BALANCE_TOLERANCE_PCT", dec!(0.05))?,
            order_timeout_s: env_parse("ORDER_TIMEOUT_S", 600)?,
            disconnect_grace_s: env_parse("DISCONNECT_GRACE_S", 30)?,
            safe_extra_spread_ticks: env_parse("SAFE_EXTRA_SPREAD_TICKS", 2)?,

            force_flatten_on_start: env_parse("FORCE_FLATTEN_ON_START", false)?,
            reset_on_channel_breakout: env_parse("RESET_ON_CHANNEL_BREAKOUT", false)?,

            log_level: env_string("LOG_LEVEL", "info"),
            event_log_path: env::var("EVENT_LOG_PATH").ok(),
            mock: env_parse("MOCK", false)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Cross-field validation. Collects every violation rather than bailing
    /// on the first, since config mistakes are cheapest to fix all at once.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut problems = Vec::new();

        if self.symbol.trim().is_empty() {
            problems.push("symbol must not be empty".to_string());
        }
        if !self.mock && (self.long_api_key.is_empty() || self.long_api_secret.is_empty()) {
            problems.push("long_api_key/long_api_secret required unless mock=true".to_string());
        }
        if !self.mock && (self.short_api_key.is_empty() || self.short_api_secret.is_empty()) {
            problems.push("short_api_key/short_api_secret required unless mock=true".to_string());
        }
        if self.atr_length == 0 {
            problems.push("atr_length must be >= 1".to_string());
        }
        if self.atr_multiplier <= 0.0 {
            problems.push("atr_multiplier must be > 0".to_string());
        }
        if self.atr_lookback == 0 {
            problems.push("atr_lookback must be >= 1".to_string());
        }
        if self.spacing_multiplier <= Decimal::ZERO {
            problems.push("spacing_multiplier must be > 0".to_string());
        }
        if self.upper_lower_ratio < Decimal::ZERO || self.upper_lower_ratio > Decimal::ONE {
            problems.push("upper_lower_ratio must be in [0, 1]".to_string());
        }
        if self.safety_factor <= Decimal::ZERO || self.safety_factor > Decimal::ONE {
            problems.push("safety_factor must be in (0, 1]".to_string());
        }
        if self.max_leverage_limit == 0 {
            problems.push("max_leverage_limit must be >= 1".to_string());
        }
        if self.utilization_ratio <= Decimal::ZERO || self.utilization_ratio > Decimal::ONE {
            problems.push("utilization_ratio must be in (0, 1]".to_string());
        }
        if self.risk_check_interval_s <= 0.0 {
            problems.push("risk_check_interval_s must be > 0".to_string());
        }
        if self.max_margin_ratio <= Decimal::ZERO || self.max_margin_ratio > Decimal::ONE {
            problems.push("max_margin_ratio must be in (0, 1]".to_string());
        }
        if self.max_drawdown_pct <= Decimal::ZERO || self.max_drawdown_pct > Decimal::ONE {
            problems.push("max_drawdown_pct must be in (0, 1]".to_string());
        }
        if self.activation_bounds_pct < Decimal::ZERO {
            problems.push("activation_bounds_pct must be >= 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::ConfigError(problems.join("; ")))
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, EngineError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| EngineError::ConfigError(format!("{key} is not valid: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn env_decimal(key: &str, default: Decimal) -> Result<Decimal, EngineError> {
    match env::var(key) {
        Ok(raw) => Decimal::from_str(&raw)
            .map_err(|_| EngineError::ConfigError(format!("{key} is not a valid decimal: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_config() -> GridConfig {
        GridConfig {
            long_api_key: String::new(),
            long_api_secret: String::new(),
            short_api_key: String::new(),
            short_api_secret: String::new(),
            symbol: "DOGE/USDC:USDC".into(),
            quote_asset: "USDC".into(),
            atr_length: 14,
            atr_multiplier: 2.0,
            atr_timeframe: "1h".into(),
            atr_lookback: 20,
            spacing_multiplier: dec!(0.26),
            max_open_orders: 4,
            max_orders_per_batch: 2,
            order_frequency_s: 3.0,
            activation_bounds_pct: dec!(0.05),
            upper_lower_ratio: dec!(0.5),
            safety_factor: dec!(0.8),
            max_leverage_limit: 20,
            utilization_ratio: dec!(0.8),
            risk_check_interval_s: 1.0,
            max_margin_ratio: dec!(0.8),
            max_drawdown_pct: dec!(0.15),
            balance_tolerance_pct: dec!(0.05),
            order_timeout_s: 600,
            disconnect_grace_s: 30,
            safe_extra_spread_ticks: 2,
            force_flatten_on_start: false,
            reset_on_channel_breakout: false,
            log_level: "info".into(),
            event_log_path: None,
            mock: true,
        }
    }

    #[test]
    fn default_mock_config_is_valid() {
        assert!(mock_config().validate().is_ok());
    }

    #[test]
    fn missing_credentials_without_mock_is_rejected() {
        let mut cfg = mock_config();
        cfg.mock = false;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, EngineError::ConfigError(_)));
    }

    #[test]
    fn out_of_range_ratio_is_rejected() {
        let mut cfg = mock_config();
        cfg.upper_lower_ratio = dec!(1.5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_collects_multiple_problems() {
        let mut cfg = mock_config();
        cfg.upper_lower_ratio = dec!(-1);
        cfg.atr_length = 0;
        match cfg.validate() {
            Err(EngineError::ConfigError(msg)) => {
                assert!(msg.contains("upper_lower_ratio"));
                assert!(msg.contains("atr_length"));
            }
            _ => panic!("expected ConfigError"),
        }
    }
}
