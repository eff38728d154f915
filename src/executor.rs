// ─────────────────────────────────────────────────────────────────────────────
// executor.rs — GridExecutor, the direction-polymorphic grid state machine
//
// The LONG/SHORT duality is handled by a Direction tag plus four pure
// functions (open_side/close_side/close_price/crossing_check) rather than
// inheritance — see grid_level::Direction. The control-tick sequencing
// (reconcile, transition closes, recycle, admit, place, cancel-stale) is
// small async methods over owned state, warn!/error! on exchange pushback,
// no panics.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::decimal::{snap_price, snap_qty};
use crate::errors::EngineResult;
use crate::exchange::{AccountStatus, BookTicker, ExchangeSession, OrderStatus, OrderUpdate, PositionAction, StreamEvent};
use crate::grid_level::{Direction, GridLevel, LevelState, Side};
use crate::grid_plan::GridPlan;
use crate::persistence::{AuditEvent, EventLog};
use crate::symbol::SymbolRules;

/// The order side an executor of this direction places to open a position.
pub fn open_side(dir: Direction) -> Side {
    match dir {
        Direction::Long => Side::Buy,
        Direction::Short => Side::Sell,
    }
}

/// The order side used to close a position opened in this direction.
pub fn close_side(dir: Direction) -> Side {
    open_side(dir).opposite()
}

/// The nominal close price anchored to the actual entry fill, per direction.
pub fn close_price(dir: Direction, entry: Decimal, spacing: Decimal) -> Decimal {
    match dir {
        Direction::Long => entry + spacing,
        Direction::Short => entry - spacing,
    }
}

/// Nudges a candidate open price away from the book if placing it would
/// immediately cross and take liquidity instead of resting as a maker order.
pub fn crossing_check(dir: Direction, limit: Decimal, book: &BookTicker, safe_extra_spread: Decimal) -> Decimal {
    match dir {
        Direction::Long => {
            if limit >= book.best_ask {
                limit.min(book.best_bid - safe_extra_spread)
            } else {
                limit
            }
        }
        Direction::Short => {
            if limit <= book.best_bid {
                limit.max(book.best_ask + safe_extra_spread)
            } else {
                limit
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    pub max_open_orders: u32,
    pub max_orders_per_batch: u32,
    pub order_frequency_s: f64,
    pub activation_bounds_pct: Decimal,
    pub upper_lower_ratio: Decimal,
    pub safe_extra_spread: Decimal,
    pub order_timeout_s: u64,
}

pub struct GridExecutor {
    pub direction: Direction,
    symbol: String,
    session: Arc<dyn ExchangeSession>,
    rules: SymbolRules,
    plan: GridPlan,
    levels: Vec<GridLevel>,
    policy: AdmissionPolicy,
    last_batch_ts: DateTime<Utc>,
    execution_enabled: bool,
    last_book: Option<BookTicker>,
    connected: bool,
    disconnected_since: Option<DateTime<Utc>>,
    stream_rx: mpsc::Receiver<StreamEvent>,
    book_rx: mpsc::Receiver<BookTicker>,
    event_log: Arc<EventLog>,
}

impl GridExecutor {
    pub fn new(
        direction: Direction,
        symbol: String,
        session: Arc<dyn ExchangeSession>,
        rules: SymbolRules,
        plan: GridPlan,
        policy: AdmissionPolicy,
    ) -> Self {
        let levels = Self::build_levels(&plan, &rules, direction);
        let stream_rx = session.clone().subscribe_user_stream();
        let book_rx = session.clone().subscribe_book_ticker(symbol.clone());
        Self {
            direction,
            symbol,
            session,
            rules,
            plan,
            levels,
            policy,
            last_batch_ts: DateTime::<Utc>::MIN_UTC,
            execution_enabled: true,
            last_book: None,
            connected: true,
            disconnected_since: None,
            stream_rx,
            book_rx,
            event_log: Arc::new(EventLog::open(None)),
        }
    }

    /// Routes fills and state transitions to an audit log. Optional
    /// — without calling this, `GridExecutor` keeps behaving identically.
    pub fn with_event_log(mut self, event_log: Arc<EventLog>) -> Self {
        self.event_log = event_log;
        self
    }

    fn build_levels(plan: &GridPlan, rules: &SymbolRules, direction: Direction) -> Vec<GridLevel> {
        let mut levels = Vec::with_capacity(plan.levels_count as usize);
        for i in 0..plan.levels_count {
            let price = snap_price(plan.lower + Decimal::from(i) * plan.spacing, rules.tick_size, Side::Buy);
            if price.is_zero() {
                continue;
            }
            let raw_qty = plan.notional_per_level / price;
            let qty = snap_qty(raw_qty, rules.lot_size).max(rules.lot_size);
            levels.push(GridLevel::new(i, price, qty, direction));
        }
        levels
    }

    pub fn epoch_id(&self) -> u64 {
        self.plan.epoch_id
    }

    pub fn mid(&self) -> Decimal {
        self.plan.mid()
    }

    pub fn stop_bounds(&self) -> (Decimal, Decimal) {
        (self.plan.stop_lower, self.plan.stop_upper)
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn last_mid(&self) -> Option<Decimal> {
        self.last_book.map(|b| b.mid())
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn disconnected_since(&self) -> Option<DateTime<Utc>> {
        self.disconnected_since
    }

    pub fn set_execution_enabled(&mut self, enabled: bool) {
        self.execution_enabled = enabled;
    }

    pub async fn account_status(&self) -> EngineResult<AccountStatus> {
        self.session.account_status(&self.symbol).await
    }

    /// One full control tick: reconcile fills, transition closes, recycle
    /// completed levels, admit new opens, cancel stale resting orders.
    pub async fn control_tick(&mut self) {
        self.reconcile().await;
        if !self.execution_enabled {
            return;
        }
        self.transition_close_orders().await;
        self.recycle_completed();
        self.admit_new_opens().await;
        self.cancel_stale_orders().await;
    }

    /// Drains pending stream events without placing new orders — used while
    /// execution is disabled (drain) but fills must still be tracked.
    async fn reconcile(&mut self) {
        while let Ok(ticker) = self.book_rx.try_recv() {
            self.last_book = Some(ticker);
        }

        while let Ok(event) = self.stream_rx.try_recv() {
            match event {
                StreamEvent::Order(update) => {
                    self.connected = true;
                    self.disconnected_since = None;
                    self.apply_order_update(update);
                }
                StreamEvent::Resync => {
                    self.connected = true;
                    self.disconnected_since = None;
                    self.resync().await;
                }
                StreamEvent::Balance(_) | StreamEvent::Position(_) => {
                    self.connected = true;
                    self.disconnected_since = None;
                }
                StreamEvent::Disconnected => {
                    if self.disconnected_since.is_none() {
                        self.connected = false;
                        self.disconnected_since = Some(Utc::now());
                    }
                }
            }
        }

        // Permanent teardown (receiver dropped, malformed URL) closes the
        // channel outright rather than looping in backoff — the reconnect
        // loop itself signals a recoverable outage via `Disconnected` above.
        if self.stream_rx.is_closed() && self.disconnected_since.is_none() {
            self.connected = false;
            self.disconnected_since = Some(Utc::now());
        }
    }

    fn apply_order_update(&mut self, update: OrderUpdate) {
        let dir = self.direction.as_str().to_string();
        for level in self.levels.iter_mut() {
            if let Some(order) = level.open_order.as_ref() {
                if order.client_order_id == update.client_order_id {
                    let delta = (update.filled_qty - order.filled_qty).max(Decimal::ZERO);
                    if delta > Decimal::ZERO {
                        level.apply_open_fill(update.avg_fill_price, delta, self.rules.lot_size);
                        self.event_log.record(AuditEvent::OrderFilled {
                            direction: dir.clone(),
                            level_id: level.level_id,
                            price: update.avg_fill_price,
                            qty: delta,
                        });
                    }
                    if matches!(update.status, OrderStatus::Rejected | OrderStatus::Cancelled) && delta.is_zero() {
                        level.mark_failed();
                        self.event_log.record(AuditEvent::LevelFailed {
                            direction: dir,
                            level_id: level.level_id,
                            reason: "open order rejected or cancelled off-exchange".into(),
                        });
                    }
                    return;
                }
            }
            if let Some(order) = level.close_order.as_ref() {
                if order.client_order_id == update.client_order_id {
                    let delta = (update.filled_qty - order.filled_qty).max(Decimal::ZERO);
                    if delta > Decimal::ZERO {
                        level.apply_close_fill(update.avg_fill_price, delta, self.rules.lot_size);
                        self.event_log.record(AuditEvent::OrderFilled {
                            direction: dir.clone(),
                            level_id: level.level_id,
                            price: update.avg_fill_price,
                            qty: delta,
                        });
                    }
                    if matches!(update.status, OrderStatus::Rejected | OrderStatus::Cancelled) && delta.is_zero() {
                        // No reversible arc out of CLOSE_ORDER_PLACED; a lost close
                        // order strands the position and must surface as a failure.
                        level.mark_failed();
                        self.event_log.record(AuditEvent::LevelFailed {
                            direction: dir,
                            level_id: level.level_id,
                            reason: "close order rejected or cancelled off-exchange".into(),
                        });
                    }
                    return;
                }
            }
        }
    }

    /// On stream resync, re-snapshots resting orders from the exchange and
    /// marks any level locally believed resting but absent on the exchange
    /// as `FAILED`. Known orders are left untouched — they will keep
    /// reconciling normally as fills continue to arrive.
    async fn resync(&mut self) {
        let live = match self.session.open_orders(&self.symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                log::error!("[executor:{:?}] resync open_orders query failed: {e}", self.direction);
                return;
            }
        };
        let live_ids: std::collections::HashSet<&str> = live.iter().map(|o| o.client_order_id.as_str()).collect();

        for level in self.levels.iter_mut() {
            if matches!(level.state, LevelState::OpenOrderPlaced) {
                if let Some(order) = level.open_order.as_ref() {
                    if !live_ids.contains(order.client_order_id.as_str()) {
                        log::warn!(
                            "[executor:{:?}] resync: level {} open order missing on exchange, marking FAILED",
                            self.direction,
                            level.level_id
                        );
                        level.mark_failed();
                    }
                }
            }
        }
    }

    async fn transition_close_orders(&mut self) {
        let tick = self.rules.tick_size;
        let spacing = self.plan.spacing;
        let epoch_id = self.plan.epoch_id;
        let dir = self.direction;

        for idx in 0..self.levels.len() {
            let needs_close = matches!(self.levels[idx].state, LevelState::OpenOrderFilled) && self.levels[idx].close_order.is_none();
            if !needs_close {
                continue;
            }
            let entry = match self.levels[idx].filled_at_price {
                Some(p) => p,
                None => continue,
            };
            let qty = self.levels[idx].filled_qty.unwrap_or(self.levels[idx].quantity);
            let raw_close = close_price(dir, entry, spacing);
            let side = close_side(dir);
            let price = snap_price(raw_close, tick, side);
            let client_id = format!("{}-close", self.levels[idx].client_order_id(epoch_id));

            match self
                .session
                .place_limit_order(&self.symbol, side, qty, price, PositionAction::Close, client_id)
                .await
            {
                Ok(order) => {
                    let mut order = order;
                    order.level_id = self.levels[idx].level_id;
                    let client_order_id = order.client_order_id.clone();
                    self.levels[idx].mark_close_order_placed(order);
                    self.event_log.record(AuditEvent::OrderPlaced {
                        direction: dir.as_str().into(),
                        level_id: self.levels[idx].level_id,
                        side: side.as_str().into(),
                        price,
                        qty,
                        client_order_id,
                    });
                }
                Err(e) => {
                    log::warn!(
                        "[executor:{:?}] failed to place close order for level {}: {e}",
                        dir,
                        self.levels[idx].level_id
                    );
                }
            }
        }
    }

    fn recycle_completed(&mut self) {
        let dir = self.direction.as_str().to_string();
        for level in self.levels.iter_mut() {
            if matches!(level.state, LevelState::Complete) {
                level.recycle();
                self.event_log.record(AuditEvent::LevelRecycled {
                    direction: dir.clone(),
                    level_id: level.level_id,
                });
            }
        }
    }

    async fn admit_new_opens(&mut self) {
        let now = Utc::now();
        let elapsed_s = (now - self.last_batch_ts).num_milliseconds() as f64 / 1000.0;
        if elapsed_s < self.policy.order_frequency_s {
            return;
        }

        let resting = self.levels.iter().filter(|l| l.has_resting_open_order()).count() as u32;
        if resting >= self.policy.max_open_orders {
            return;
        }
        let slots = (self.policy.max_open_orders - resting).min(self.policy.max_orders_per_batch);
        if slots == 0 {
            return;
        }

        let upper_slots = (Decimal::from(slots) * self.policy.upper_lower_ratio)
            .floor()
            .to_u32()
            .unwrap_or(0)
            .min(slots);
        let lower_slots = slots - upper_slots;

        let mid = self.plan.mid();
        let bounds = self.policy.activation_bounds_pct;

        let mut upper: Vec<usize> = self
            .levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.price > mid && l.is_eligible_for_open() && ((l.price - mid) / mid) <= bounds)
            .map(|(i, _)| i)
            .collect();
        upper.sort_by(|&a, &b| {
            let da = self.levels[a].price - mid;
            let db = self.levels[b].price - mid;
            da.cmp(&db).then(self.levels[a].level_id.cmp(&self.levels[b].level_id))
        });
        upper.truncate(upper_slots as usize);

        let mut lower: Vec<usize> = self
            .levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.price < mid && l.is_eligible_for_open() && ((mid - l.price) / mid) <= bounds)
            .map(|(i, _)| i)
            .collect();
        lower.sort_by(|&a, &b| {
            let da = mid - self.levels[a].price;
            let db = mid - self.levels[b].price;
            da.cmp(&db).then(self.levels[a].level_id.cmp(&self.levels[b].level_id))
        });
        lower.truncate(lower_slots as usize);

        let mut candidates = upper;
        candidates.extend(lower);
        if candidates.is_empty() {
            return;
        }

        for idx in candidates {
            self.place_open_order(idx).await;
        }
        self.last_batch_ts = now;
    }

    async fn place_open_order(&mut self, idx: usize) {
        let dir = self.direction;
        let side = open_side(dir);
        let mut limit = self.levels[idx].price;
        if let Some(book) = self.last_book {
            limit = crossing_check(dir, limit, &book, self.policy.safe_extra_spread);
            limit = snap_price(limit, self.rules.tick_size, side);
        }
        let qty = self.levels[idx].quantity;
        let client_id = self.levels[idx].client_order_id(self.plan.epoch_id);

        match self
            .session
            .place_limit_order(&self.symbol, side, qty, limit, PositionAction::Open, client_id)
            .await
        {
            Ok(order) => {
                let mut order = order;
                order.level_id = self.levels[idx].level_id;
                let client_order_id = order.client_order_id.clone();
                self.levels[idx].mark_open_order_placed(order);
                self.event_log.record(AuditEvent::OrderPlaced {
                    direction: dir.as_str().into(),
                    level_id: self.levels[idx].level_id,
                    side: side.as_str().into(),
                    price: limit,
                    qty,
                    client_order_id,
                });
            }
            Err(e) if e.is_fatal() || matches!(e, crate::errors::EngineError::ExchangeRejected(_)) => {
                log::warn!(
                    "[executor:{:?}] level {} rejected, marking FAILED: {e}",
                    dir,
                    self.levels[idx].level_id
                );
                self.levels[idx].mark_failed();
                self.event_log.record(AuditEvent::LevelFailed {
                    direction: dir.as_str().into(),
                    level_id: self.levels[idx].level_id,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                log::warn!(
                    "[executor:{:?}] level {} open order failed (will retry next tick): {e}",
                    dir,
                    self.levels[idx].level_id
                );
            }
        }
    }

    async fn cancel_stale_orders(&mut self) {
        let mid = self.plan.mid();
        let bounds = self.policy.activation_bounds_pct;
        let timeout = chrono::Duration::seconds(self.policy.order_timeout_s as i64);
        let now = Utc::now();

        for idx in 0..self.levels.len() {
            if !self.levels[idx].has_resting_open_order() {
                continue;
            }
            let out_of_bounds = ((self.levels[idx].price - mid).abs() / mid) > bounds;
            let timed_out = self
                .levels[idx]
                .open_order
                .as_ref()
                .map(|o| now - o.placed_at > timeout)
                .unwrap_or(false);

            if out_of_bounds || timed_out {
                let mut client_order_id = String::new();
                if let Some(order) = self.levels[idx].open_order.clone() {
                    client_order_id = order.client_order_id.clone();
                    if let Some(exchange_id) = order.exchange_order_id.as_ref() {
                        if let Err(e) = self.session.cancel_order(&self.symbol, exchange_id).await {
                            log::warn!("[executor:{:?}] cancel_order failed for level {}: {e}", self.direction, self.levels[idx].level_id);
                            continue;
                        }
                    }
                }
                let level_id = self.levels[idx].level_id;
                self.levels[idx].cancel_open_order();
                self.event_log.record(AuditEvent::OrderCancelled {
                    direction: self.direction.as_str().into(),
                    level_id,
                    client_order_id,
                });
            }
        }
    }

    /// Cancels every resting open and close order; used by `SyncController`
    /// during drain and emergency unwind. Idempotent.
    pub async fn cancel_all_resting(&mut self) {
        match self.session.cancel_all(&self.symbol).await {
            Ok(n) => log::warn!("[executor:{:?}] cancel_all cancelled {n} resting orders", self.direction),
            Err(e) => log::error!("[executor:{:?}] cancel_all failed: {e}", self.direction),
        }
        for level in self.levels.iter_mut() {
            if matches!(level.state, LevelState::OpenOrderPlaced) {
                level.cancel_open_order();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimExchange;
    use crate::symbol::LeverageBracket;
    use rust_decimal_macros::dec;

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

    fn plan() -> GridPlan {
        GridPlan {
            upper: dec!(1.0052),
            lower: dec!(0.9948),
            spacing: dec!(0.0026),
            levels_count: 4,
            notional_per_level: dec!(10),
            usable_leverage: 5,
            stop_upper: dec!(1.0052),
            stop_lower: dec!(0.9948),
            computed_at: Utc::now(),
            epoch_id: 1,
        }
    }

    fn policy() -> AdmissionPolicy {
        AdmissionPolicy {
            max_open_orders: 4,
            max_orders_per_batch: 2,
            order_frequency_s: 0.0,
            activation_bounds_pct: dec!(0.05),
            upper_lower_ratio: dec!(0.5),
            safe_extra_spread: dec!(0.00002),
            order_timeout_s: 600,
        }
    }

    fn executor() -> GridExecutor {
        let session = Arc::new(SimExchange::new("DOGEUSDC", dec!(1000), dec!(1.0), rules()));
        GridExecutor::new(Direction::Long, "DOGEUSDC".into(), session, rules(), plan(), policy())
    }

    #[test]
    fn open_close_side_are_opposite_for_each_direction() {
        assert_eq!(open_side(Direction::Long), Side::Buy);
        assert_eq!(close_side(Direction::Long), Side::Sell);
        assert_eq!(open_side(Direction::Short), Side::Sell);
        assert_eq!(close_side(Direction::Short), Side::Buy);
    }

    #[test]
    fn close_price_moves_with_direction() {
        assert_eq!(close_price(Direction::Long, dec!(1.0), dec!(0.01)), dec!(1.01));
        assert_eq!(close_price(Direction::Short, dec!(1.0), dec!(0.01)), dec!(0.99));
    }

    #[test]
    fn crossing_check_backs_off_a_marketable_long_limit() {
        let book = BookTicker { best_bid: dec!(1.0), best_ask: dec!(1.0001), ts: Utc::now() };
        let adjusted = crossing_check(Direction::Long, dec!(1.0005), &book, dec!(0.0001));
        assert!(adjusted < book.best_ask);
    }

    #[test]
    fn crossing_check_leaves_a_resting_limit_untouched() {
        let book = BookTicker { best_bid: dec!(1.0), best_ask: dec!(1.0001), ts: Utc::now() };
        let unchanged = crossing_check(Direction::Long, dec!(0.999), &book, dec!(0.0001));
        assert_eq!(unchanged, dec!(0.999));
    }

    #[tokio::test]
    async fn control_tick_places_opens_up_to_admission_limits() {
        let mut ex = executor();
        ex.control_tick().await;
        let resting = ex.levels().iter().filter(|l| l.has_resting_open_order()).count();
        assert!(resting <= policy().max_orders_per_batch as usize);
        assert!(resting > 0);
    }

    #[tokio::test]
    async fn zero_max_open_orders_never_places_anything() {
        let mut pol = policy();
        pol.max_open_orders = 0;
        let session = Arc::new(SimExchange::new("DOGEUSDC", dec!(1000), dec!(1.0), rules()));
        let mut ex = GridExecutor::new(Direction::Long, "DOGEUSDC".into(), session, rules(), plan(), pol);
        ex.control_tick().await;
        assert!(ex.levels().iter().all(|l| !l.has_resting_open_order()));
    }

    #[tokio::test]
    async fn zero_activation_bounds_never_places_anything() {
        let mut pol = policy();
        pol.activation_bounds_pct = dec!(0);
        let session = Arc::new(SimExchange::new("DOGEUSDC", dec!(1000), dec!(1.0), rules()));
        let mut ex = GridExecutor::new(Direction::Long, "DOGEUSDC".into(), session, rules(), plan(), pol);
        ex.control_tick().await;
        assert!(ex.levels().iter().all(|l| !l.has_resting_open_order()));
    }

    #[tokio::test]
    async fn cancel_all_resting_reverts_placed_levels_to_not_active() {
        let mut ex = executor();
        ex.control_tick().await;
        ex.cancel_all_resting().await;
        assert!(ex.levels().iter().all(|l| matches!(l.state, LevelState::NotActive | LevelState::Failed)));
    }

    #[tokio::test]
    async fn disconnected_stream_event_marks_executor_disconnected_without_closing_the_channel() {
        let session = Arc::new(SimExchange::new("DOGEUSDC", dec!(1000), dec!(1.0), rules()));
        let mut ex = GridExecutor::new(Direction::Long, "DOGEUSDC".into(), session.clone(), rules(), plan(), policy());
        assert!(ex.is_connected());

        session.push_stream_event(StreamEvent::Disconnected).await;
        ex.control_tick().await;

        assert!(!ex.is_connected());
        assert!(ex.disconnected_since().is_some());
    }

    #[tokio::test]
    async fn resync_after_disconnected_restores_connected_state() {
        let session = Arc::new(SimExchange::new("DOGEUSDC", dec!(1000), dec!(1.0), rules()));
        let mut ex = GridExecutor::new(Direction::Long, "DOGEUSDC".into(), session.clone(), rules(), plan(), policy());

        session.push_stream_event(StreamEvent::Disconnected).await;
        ex.control_tick().await;
        assert!(!ex.is_connected());

        session.push_stream_event(StreamEvent::Resync).await;
        ex.control_tick().await;
        assert!(ex.is_connected());
        assert!(ex.disconnected_since().is_none());
    }
}
