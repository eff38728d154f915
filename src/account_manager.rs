// ─────────────────────────────────────────────────────────────────────────────
// account_manager.rs — DualAccountManager
//
// A wrapper-around-one-session idiom generalized to own a pair of
// ExchangeSessions, exposing the pre-flight / cancel-all / close-all
// operations the sync controller and main need before either executor may
// start.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::errors::{EngineError, EngineResult};
use crate::exchange::ExchangeSession;
use crate::grid_level::Side;
use crate::symbol::SymbolRules;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SessionTag {
    Long,
    Short,
}

pub struct DualAccountManager {
    pub long_session: Arc<dyn ExchangeSession>,
    pub short_session: Arc<dyn ExchangeSession>,
    pub symbol: String,
    pub quote_asset: String,
}

impl DualAccountManager {
    pub fn new(
        long_session: Arc<dyn ExchangeSession>,
        short_session: Arc<dyn ExchangeSession>,
        symbol: String,
        quote_asset: String,
    ) -> Self {
        Self {
            long_session,
            short_session,
            symbol,
            quote_asset,
        }
    }

    fn session(&self, tag: SessionTag) -> &Arc<dyn ExchangeSession> {
        match tag {
            SessionTag::Long => &self.long_session,
            SessionTag::Short => &self.short_session,
        }
    }

    /// Validates connectivity, sets hedge position mode on both sessions, sets
    /// the requested leverage on both, and fetches symbol rules — which must
    /// agree across sessions, since both grids trade the same instrument.
    pub async fn initialize(&self, leverage: u32) -> EngineResult<SymbolRules> {
        self.long_session.set_position_mode(true).await?;
        self.short_session.set_position_mode(true).await?;

        self.long_session.set_leverage(&self.symbol, leverage).await?;
        self.short_session.set_leverage(&self.symbol, leverage).await?;

        let long_rules = self.long_session.symbol_rules(&self.symbol).await?;
        let short_rules = self.short_session.symbol_rules(&self.symbol).await?;

        if long_rules != short_rules {
            return Err(EngineError::PreconditionFailed(format!(
                "symbol rules diverge between sessions for {}: long={:?} short={:?}",
                self.symbol, long_rules, short_rules
            )));
        }

        log::info!("[account_manager] initialized both sessions for {} at {}x leverage", self.symbol, leverage);
        Ok(long_rules)
    }

    /// Requires both sessions flat (no position, no open orders) before the
    /// strategy may start. With `force_flatten=true`, cancels and closes
    /// instead of failing.
    pub async fn pre_flight(&self, force_flatten: bool) -> EngineResult<()> {
        let long_clear = self.is_flat(SessionTag::Long).await?;
        let short_clear = self.is_flat(SessionTag::Short).await?;

        if long_clear && short_clear {
            return Ok(());
        }

        if !force_flatten {
            return Err(EngineError::PreconditionFailed(format!(
                "accounts not flat before start (long_flat={long_clear}, short_flat={short_clear})"
            )));
        }

        log::warn!("[account_manager] pre-flight found non-flat accounts; force_flatten is set, flattening both");
        self.cancel_all(SessionTag::Long).await;
        self.cancel_all(SessionTag::Short).await;
        self.close_all(SessionTag::Long).await;
        self.close_all(SessionTag::Short).await;

        let long_clear = self.is_flat(SessionTag::Long).await?;
        let short_clear = self.is_flat(SessionTag::Short).await?;
        if long_clear && short_clear {
            Ok(())
        } else {
            Err(EngineError::PreconditionFailed(
                "force_flatten could not bring both accounts flat".into(),
            ))
        }
    }

    async fn is_flat(&self, tag: SessionTag) -> EngineResult<bool> {
        let session = self.session(tag);
        let orders = session.open_orders(&self.symbol).await?;
        let positions = session.positions(&self.symbol).await?;
        Ok(orders.is_empty() && positions.iter().all(|p| p.size.is_zero()))
    }

    pub async fn balance(&self, tag: SessionTag) -> EngineResult<Decimal> {
        self.session(tag).balance(&self.quote_asset).await
    }

    /// True if both sessions' balances are within `tolerance_pct` of each
    /// other relative to the larger balance.
    pub async fn balances_equal_within(&self, tolerance_pct: Decimal) -> EngineResult<bool> {
        let long_bal = self.balance(SessionTag::Long).await?;
        let short_bal = self.balance(SessionTag::Short).await?;
        let larger = long_bal.max(short_bal);
        if larger.is_zero() {
            return Ok(true);
        }
        let skew = (long_bal - short_bal).abs() / larger;
        Ok(skew <= tolerance_pct)
    }

    /// The smaller of the two balances, so both accounts can commit
    /// symmetrically — SharedGridEngine sizes the plan off the smaller side.
    pub async fn min_balance(&self) -> EngineResult<Decimal> {
        let long_bal = self.balance(SessionTag::Long).await?;
        let short_bal = self.balance(SessionTag::Short).await?;
        Ok(long_bal.min(short_bal))
    }

    /// Best-effort, idempotent cancel-all for one session.
    pub async fn cancel_all(&self, tag: SessionTag) -> u32 {
        match self.session(tag).cancel_all(&self.symbol).await {
            Ok(n) => n,
            Err(e) => {
                log::error!("[account_manager] cancel_all failed for {tag:?}: {e}");
                0
            }
        }
    }

    /// Best-effort, idempotent flatten of any residual position via
    /// reduce-only market close.
    pub async fn close_all(&self, tag: SessionTag) {
        let session = self.session(tag);
        let positions = match session.positions(&self.symbol).await {
            Ok(p) => p,
            Err(e) => {
                log::error!("[account_manager] close_all: could not fetch positions for {tag:?}: {e}");
                return;
            }
        };
        for position in positions {
            if position.size.is_zero() {
                continue;
            }
            let side = if position.size > dec!(0) { Side::Sell } else { Side::Buy };
            let qty = position.size.abs();
            match session.close_market(&self.symbol, side, qty).await {
                Ok(_) => log::warn!("[account_manager] {tag:?} flattened {} {} via market close", qty, self.symbol),
                Err(e) => log::error!("[account_manager] {tag:?} failed to flatten position: {e}"),
            }
        }
    }
}

impl std::fmt::Debug for SessionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionTag::Long => write!(f, "LONG"),
            SessionTag::Short => write!(f, "SHORT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimExchange;
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

    fn manager(long_balance: Decimal, short_balance: Decimal) -> DualAccountManager {
        let long = Arc::new(SimExchange::new("DOGEUSDC", long_balance, dec!(1.0), rules()));
        let short = Arc::new(SimExchange::new("DOGEUSDC", short_balance, dec!(1.0), rules()));
        DualAccountManager::new(long, short, "DOGEUSDC".into(), "USDC".into())
    }

    #[tokio::test]
    async fn pre_flight_passes_when_both_flat() {
        let mgr = manager(dec!(1000), dec!(1000));
        assert!(mgr.pre_flight(false).await.is_ok());
    }

    #[tokio::test]
    async fn pre_flight_fails_when_order_resting_without_force_flatten() {
        let mgr = manager(dec!(1000), dec!(1000));
        mgr.long_session
            .place_limit_order("DOGEUSDC", Side::Buy, dec!(100), dec!(0.99), crate::exchange::PositionAction::Open, "c1".into())
            .await
            .unwrap();
        let result = mgr.pre_flight(false).await;
        assert!(matches!(result, Err(EngineError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn min_balance_takes_the_smaller_account() {
        let mgr = manager(dec!(1000), dec!(800));
        assert_eq!(mgr.min_balance().await.unwrap(), dec!(800));
    }

    #[tokio::test]
    async fn balances_equal_within_respects_tolerance() {
        let mgr = manager(dec!(1000), dec!(800));
        assert!(!mgr.balances_equal_within(dec!(0.05)).await.unwrap());
        assert!(mgr.balances_equal_within(dec!(0.25)).await.unwrap());
    }
}
