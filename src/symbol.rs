// ─────────────────────────────────────────────────────────────────────────────
// symbol.rs — exchange symbol metadata
//
// Generalizes ad hoc per-coin precision caching into an explicit,
// immutable-per-run struct fetched once during DualAccountManager::initialize.
// ─────────────────────────────────────────────────────────────────────────────
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One tier of a leverage-bracket table: within [notional_floor, notional_cap),
/// `maintenance_margin_ratio` applies and leverage may not exceed `max_leverage`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeverageBracket {
    pub notional_floor: Decimal,
    pub notional_cap: Decimal,
    pub maintenance_margin_ratio: Decimal,
    pub max_leverage: u32,
}

/// Immutable-per-run exchange metadata for the traded symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRules {
    pub symbol: String,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub min_notional: Decimal,
    pub leverage_brackets: Vec<LeverageBracket>,
}

impl SymbolRules {
    /// Looks up the maintenance margin ratio and max leverage for a given
    /// notional, per step 3 of SharedGridEngine's leverage-sizing algorithm.
    pub fn bracket_for_notional(&self, notional: Decimal) -> Option<&LeverageBracket> {
        self.leverage_brackets
            .iter()
            .find(|b| notional >= b.notional_floor && notional < b.notional_cap)
            .or_else(|| self.leverage_brackets.last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rules() -> SymbolRules {
        SymbolRules {
            symbol: "DOGEUSDC".into(),
            tick_size: dec!(0.00001),
            lot_size: dec!(1),
            min_notional: dec!(5),
            leverage_brackets: vec![
                LeverageBracket {
                    notional_floor: dec!(0),
                    notional_cap: dec!(10000),
                    maintenance_margin_ratio: dec!(0.005),
                    max_leverage: 20,
                },
                LeverageBracket {
                    notional_floor: dec!(10000),
                    notional_cap: dec!(100000),
                    maintenance_margin_ratio: dec!(0.01),
                    max_leverage: 10,
                },
            ],
        }
    }

    #[test]
    fn bracket_lookup_picks_correct_tier() {
        let r = rules();
        assert_eq!(r.bracket_for_notional(dec!(500)).unwrap().max_leverage, 20);
        assert_eq!(r.bracket_for_notional(dec!(50000)).unwrap().max_leverage, 10);
    }

    #[test]
    fn bracket_lookup_falls_back_to_last_tier_above_range() {
        let r = rules();
        assert_eq!(r.bracket_for_notional(dec!(1_000_000)).unwrap().max_leverage, 10);
    }
}
