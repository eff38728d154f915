// ─────────────────────────────────────────────────────────────────────────────
// grid_plan.rs — SharedGridEngine: fuses ATR channel, balance, symbol rules,
// and config into a single immutable GridPlan.
//
// A pure, config-driven function returning an immutable plan struct, with a
// self-adapting notional-per-level loop layered on top.
// ─────────────────────────────────────────────────────────────────────────────
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::atr::ATRResult;
use crate::config::GridConfig;
use crate::errors::{EngineError, EngineResult};
use crate::symbol::SymbolRules;

const MAX_ADAPTATION_ITERATIONS: u32 = 10;
const MAX_SPACING_MULTIPLIER: Decimal = dec!(5.0);

#[derive(Debug, Clone, PartialEq)]
pub struct GridPlan {
    pub upper: Decimal,
    pub lower: Decimal,
    pub spacing: Decimal,
    pub levels_count: u32,
    pub notional_per_level: Decimal,
    pub usable_leverage: u32,
    pub stop_upper: Decimal,
    pub stop_lower: Decimal,
    pub computed_at: DateTime<Utc>,
    pub epoch_id: u64,
}

impl GridPlan {
    pub fn mid(&self) -> Decimal {
        (self.upper + self.lower) / dec!(2)
    }
}

fn f64_to_decimal(v: f64) -> EngineResult<Decimal> {
    Decimal::try_from(v).map_err(|e| EngineError::ConfigError(format!("non-finite decimal input: {e}")))
}

fn round_to_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick.is_zero() {
        return value;
    }
    (value / tick).round() * tick
}

pub struct SharedGridEngine;

impl SharedGridEngine {
    /// Pure function of its inputs — same (ATRResult, balance, rules, config)
    /// always yields the same GridPlan.
    pub fn compute_plan(
        atr: &ATRResult,
        balance: Decimal,
        rules: &SymbolRules,
        config: &GridConfig,
        epoch_id: u64,
    ) -> EngineResult<GridPlan> {
        let upper = f64_to_decimal(atr.upper_bound)?;
        let lower = f64_to_decimal(atr.lower_bound)?;
        let atr_dec = f64_to_decimal(atr.atr)?;
        if lower >= upper {
            return Err(EngineError::InfeasiblePlan(
                "ATR channel lower bound is not below upper bound".into(),
            ));
        }
        let mid = (upper + lower) / dec!(2);

        let mut spacing_multiplier = config.spacing_multiplier;
        let mut iterations = 0u32;

        loop {
            if spacing_multiplier > MAX_SPACING_MULTIPLIER || iterations >= MAX_ADAPTATION_ITERATIONS {
                return Err(EngineError::InfeasiblePlan(format!(
                    "could not reach min_notional={} within {} iterations (last spacing_multiplier={})",
                    rules.min_notional, MAX_ADAPTATION_ITERATIONS, spacing_multiplier
                )));
            }

            // Step 1: spacing, snapped to tick, clamped to anti-degeneracy bounds.
            let spacing_raw = atr_dec * spacing_multiplier;
            let mut spacing = round_to_tick(spacing_raw, rules.tick_size).max(rules.tick_size);
            let floor_spacing = mid * dec!(0.001);
            let cap_spacing = mid * dec!(0.05);
            if spacing < floor_spacing {
                spacing = floor_spacing;
            }
            if spacing > cap_spacing {
                spacing = cap_spacing;
            }

            // Step 2: level count.
            let raw_levels = ((upper - lower) / spacing)
                .floor()
                .to_u32()
                .unwrap_or(0);
            let levels = raw_levels.clamp(1, config.max_open_orders * 2);

            // Step 3: leverage.
            let total_notional_estimate = balance * config.utilization_ratio;
            let bracket = rules
                .bracket_for_notional(total_notional_estimate)
                .ok_or_else(|| EngineError::InfeasiblePlan("no leverage bracket available".into()))?;
            let lower_over_mid = lower / mid;
            let denom = dec!(1) + bracket.maintenance_margin_ratio - lower_over_mid;
            if denom <= Decimal::ZERO {
                return Err(EngineError::InfeasiblePlan(
                    "leverage denominator non-positive; channel too wide relative to mid".into(),
                ));
            }
            let l_max = dec!(1) / denom;
            let usable_leverage_dec = (l_max * config.safety_factor).floor();
            let usable_leverage = usable_leverage_dec
                .to_u32()
                .unwrap_or(1)
                .clamp(1, config.max_leverage_limit.min(bracket.max_leverage));

            // Step 4: notional per level, with self-adaptation on shortfall.
            let total_notional = balance * config.utilization_ratio * Decimal::from(usable_leverage);
            let notional_per_level = total_notional / Decimal::from(levels);

            if notional_per_level < rules.min_notional {
                spacing_multiplier *= dec!(1.1);
                iterations += 1;
                continue;
            }

            return Ok(GridPlan {
                upper,
                lower,
                spacing,
                levels_count: levels,
                notional_per_level,
                usable_leverage,
                stop_upper: upper,
                stop_lower: lower,
                computed_at: atr.computed_at,
                epoch_id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::LeverageBracket;

    fn rules() -> SymbolRules {
        SymbolRules {
            symbol: "DOGEUSDC".into(),
            tick_size: dec!(0.00001),
            lot_size: dec!(1),
            min_notional: dec!(5),
            leverage_brackets: vec![LeverageBracket {
                notional_floor: dec!(0),
                notional_cap: dec!(1_000_000),
                maintenance_margin_ratio: dec!(0.01),
                max_leverage: 20,
            }],
        }
    }

    fn config() -> GridConfig {
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

    fn atr_result() -> ATRResult {
        ATRResult {
            atr: 0.01,
            upper_bound: 1.05,
            lower_bound: 0.95,
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn plan_is_pure_function_of_inputs() {
        let atr = atr_result();
        let a = SharedGridEngine::compute_plan(&atr, dec!(1000), &rules(), &config(), 1).unwrap();
        let b = SharedGridEngine::compute_plan(&atr, dec!(1000), &rules(), &config(), 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn usable_leverage_is_at_least_one_and_capped() {
        let plan = SharedGridEngine::compute_plan(&atr_result(), dec!(1000), &rules(), &config(), 1).unwrap();
        assert!(plan.usable_leverage >= 1);
        assert!(plan.usable_leverage <= 20);
    }

    #[test]
    fn notional_per_level_meets_min_notional_after_adaptation() {
        // Tiny balance forces several adaptation iterations.
        let plan = SharedGridEngine::compute_plan(&atr_result(), dec!(50), &rules(), &config(), 1).unwrap();
        assert!(plan.notional_per_level >= rules().min_notional);
    }

    #[test]
    fn infeasible_when_balance_is_far_too_small() {
        let result = SharedGridEngine::compute_plan(&atr_result(), dec!(0.01), &rules(), &config(), 1);
        assert!(matches!(result, Err(EngineError::InfeasiblePlan(_))));
    }

    #[test]
    fn leverage_tier_adaptation_reduces_to_bracket_cap() {
        let mut r = rules();
        r.leverage_brackets = vec![LeverageBracket {
            notional_floor: dec!(0),
            notional_cap: dec!(1_000_000),
            maintenance_margin_ratio: dec!(0.01),
            max_leverage: 10,
        }];
        let mut cfg = config();
        cfg.max_leverage_limit = 20;
        let plan = SharedGridEngine::compute_plan(&atr_result(), dec!(1000), &r, &cfg, 1).unwrap();
        assert!(plan.usable_leverage <= 10);
    }

    #[test]
    fn levels_count_clamped_to_max_open_orders_times_two() {
        let mut cfg = config();
        cfg.max_open_orders = 2;
        cfg.spacing_multiplier = dec!(0.001); // force a tiny spacing -> many raw levels
        let plan = SharedGridEngine::compute_plan(&atr_result(), dec!(100_000), &rules(), &cfg, 1).unwrap();
        assert!(plan.levels_count <= 4);
    }
}
