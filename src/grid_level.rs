// ─────────────────────────────────────────────────────────────────────────────
// grid_level.rs — grid level state machine
//
// Generalized from a simpler Empty/Pending/Active/Filled/Cancelled level into
// a 6-state machine, with an explicit FAILED terminal-within-epoch state and
// fill accumulation for partial fills.
// ─────────────────────────────────────────────────────────────────────────────
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decimal::qty_within_lot_tolerance;

/// Order side as actually sent to the exchange. Distinct from `Direction`
/// (which account a level belongs to) — see executor.rs for the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Which account/grid a level belongs to. Fixed for the lifetime of an
/// executor; see executor.rs::open_side/close_side for the direction's
/// effect on order sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

/// Lifecycle state of one grid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelState {
    NotActive,
    OpenOrderPlaced,
    OpenOrderFilled,
    CloseOrderPlaced,
    Complete,
    /// Terminal within this epoch; recoverable only at the next epoch reset.
    Failed,
}

/// An order the executor has placed and is tracking against exchange acks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub exchange_order_id: Option<String>,
    pub client_order_id: String,
    pub level_id: u32,
    pub side: Side,
    pub intended_price: Decimal,
    pub intended_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub placed_at: DateTime<Utc>,
}

impl TrackedOrder {
    pub fn new(client_order_id: String, level_id: u32, side: Side, price: Decimal, qty: Decimal) -> Self {
        Self {
            exchange_order_id: None,
            client_order_id,
            level_id,
            side,
            intended_price: price,
            intended_qty: qty,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            placed_at: Utc::now(),
        }
    }

    /// Folds in a fill, recomputing the cumulative volume-weighted average price.
    pub fn apply_fill(&mut self, fill_price: Decimal, fill_qty: Decimal) {
        let prior_notional = self.avg_fill_price * self.filled_qty;
        let new_notional = prior_notional + fill_price * fill_qty;
        self.filled_qty += fill_qty;
        if !self.filled_qty.is_zero() {
            self.avg_fill_price = new_notional / self.filled_qty;
        }
    }
}

/// One discrete price point in the ladder, with its own lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLevel {
    pub level_id: u32,
    pub price: Decimal,
    pub quantity: Decimal,
    pub direction: Direction,
    pub state: LevelState,
    pub open_order: Option<TrackedOrder>,
    pub close_order: Option<TrackedOrder>,
    pub filled_at_price: Option<Decimal>,
    pub filled_qty: Option<Decimal>,
    pub filled_at_time: Option<DateTime<Utc>>,
    /// Bumped each time this level's open order is cancelled and resubmitted;
    /// embedded in client order ids for idempotence.
    pub generation: u32,
}

impl GridLevel {
    pub fn new(level_id: u32, price: Decimal, quantity: Decimal, direction: Direction) -> Self {
        Self {
            level_id,
            price,
            quantity,
            direction,
            state: LevelState::NotActive,
            open_order: None,
            close_order: None,
            filled_at_price: None,
            filled_qty: None,
            filled_at_time: None,
            generation: 0,
        }
    }

    pub fn is_eligible_for_open(&self) -> bool {
        matches!(self.state, LevelState::NotActive)
    }

    pub fn has_resting_open_order(&self) -> bool {
        matches!(self.state, LevelState::OpenOrderPlaced)
    }

    /// Client order id embedding (epoch_id, level_id, generation) so a
    /// resubmitted order after a cancel never collides with a stale one.
    pub fn client_order_id(&self, epoch_id: u64) -> String {
        format!("grid-{epoch_id}-{}-{}", self.level_id, self.generation)
    }

    pub fn mark_open_order_placed(&mut self, order: TrackedOrder) {
        self.open_order = Some(order);
        self.state = LevelState::OpenOrderPlaced;
    }

    /// Applies a fill event to the resting open order. Moves the level to
    /// OPEN_ORDER_FILLED only once the accumulated fill is within lot
    /// tolerance of the intended quantity — partial fills below tolerance
    /// remain OPEN_ORDER_PLACED, never rounded up early.
    pub fn apply_open_fill(&mut self, fill_price: Decimal, fill_qty: Decimal, lot: Decimal) {
        let Some(order) = self.open_order.as_mut() else {
            return;
        };
        order.apply_fill(fill_price, fill_qty);
        if qty_within_lot_tolerance(order.filled_qty, order.intended_qty, lot) {
            self.filled_at_price = Some(order.avg_fill_price);
            self.filled_qty = Some(order.filled_qty);
            self.filled_at_time = Some(Utc::now());
            self.state = LevelState::OpenOrderFilled;
        }
    }

    pub fn mark_close_order_placed(&mut self, order: TrackedOrder) {
        self.close_order = Some(order);
        self.state = LevelState::CloseOrderPlaced;
    }

    /// Applies a fill event to the resting close order; completes the level
    /// once fully filled within lot tolerance.
    pub fn apply_close_fill(&mut self, fill_price: Decimal, fill_qty: Decimal, lot: Decimal) {
        let Some(order) = self.close_order.as_mut() else {
            return;
        };
        order.apply_fill(fill_price, fill_qty);
        if qty_within_lot_tolerance(order.filled_qty, order.intended_qty, lot) {
            self.state = LevelState::Complete;
        }
    }

    /// Cancels a resting open order, reverting the level to NOT_ACTIVE (the
    /// one reversible arc in the state machine) and bumping the generation
    /// counter for the next client order id.
    pub fn cancel_open_order(&mut self) {
        self.open_order = None;
        self.generation += 1;
        self.state = LevelState::NotActive;
    }

    /// Recycles a COMPLETE level back to NOT_ACTIVE so it can trade again
    /// within the same epoch.
    pub fn recycle(&mut self) {
        debug_assert!(matches!(self.state, LevelState::Complete));
        self.open_order = None;
        self.close_order = None;
        self.filled_at_price = None;
        self.filled_qty = None;
        self.filled_at_time = None;
        self.state = LevelState::NotActive;
    }

    pub fn mark_failed(&mut self) {
        self.state = LevelState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level() -> GridLevel {
        GridLevel::new(1, dec!(1.0), dec!(10), Direction::Long)
    }

    #[test]
    fn full_lifecycle_round_trips_to_not_active() {
        let mut lvl = level();
        assert!(lvl.is_eligible_for_open());

        let open = TrackedOrder::new(lvl.client_order_id(1), lvl.level_id, Side::Buy, dec!(1.0), dec!(10));
        lvl.mark_open_order_placed(open);
        assert_eq!(lvl.state, LevelState::OpenOrderPlaced);

        lvl.apply_open_fill(dec!(1.0), dec!(10), dec!(1));
        assert_eq!(lvl.state, LevelState::OpenOrderFilled);

        let close = TrackedOrder::new("c1".into(), lvl.level_id, Side::Sell, dec!(1.05), dec!(10));
        lvl.mark_close_order_placed(close);
        assert_eq!(lvl.state, LevelState::CloseOrderPlaced);

        lvl.apply_close_fill(dec!(1.05), dec!(10), dec!(1));
        assert_eq!(lvl.state, LevelState::Complete);

        lvl.recycle();
        assert_eq!(lvl.state, LevelState::NotActive);
        assert!(lvl.open_order.is_none());
    }

    #[test]
    fn partial_fill_below_lot_tolerance_stays_open_order_placed() {
        let mut lvl = level();
        let open = TrackedOrder::new(lvl.client_order_id(1), lvl.level_id, Side::Buy, dec!(1.0), dec!(10));
        lvl.mark_open_order_placed(open);
        lvl.apply_open_fill(dec!(1.0), dec!(8), dec!(1));
        assert_eq!(lvl.state, LevelState::OpenOrderPlaced);
    }

    #[test]
    fn cancel_reverts_to_not_active_and_bumps_generation() {
        let mut lvl = level();
        let open = TrackedOrder::new(lvl.client_order_id(1), lvl.level_id, Side::Buy, dec!(1.0), dec!(10));
        lvl.mark_open_order_placed(open);
        lvl.cancel_open_order();
        assert_eq!(lvl.state, LevelState::NotActive);
        assert_eq!(lvl.generation, 1);
    }

    #[test]
    fn close_anchors_to_actual_average_fill_price_not_nominal_level_price() {
        let mut lvl = level();
        let open = TrackedOrder::new(lvl.client_order_id(1), lvl.level_id, Side::Buy, dec!(1.0), dec!(10));
        lvl.mark_open_order_placed(open);
        // Slips to 0.995 instead of the nominal 1.0
        lvl.apply_open_fill(dec!(0.995), dec!(10), dec!(1));
        assert_eq!(lvl.filled_at_price, Some(dec!(0.995)));
    }
}
