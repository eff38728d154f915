// ─────────────────────────────────────────────────────────────────────────────
// exchange.rs — ExchangeSession: the uniform per-account API
//
// Two implementations satisfy the trait: SimExchange (in-process, deterministic,
// used by the test harness and mock=true runs) and LiveExchange (signed REST +
// WebSocket transport for one perpetual-futures venue). Nothing outside this
// file and signing.rs/ingestor.rs knows about HTTP endpoints, JSON wire shapes,
// or request signing. SimExchange holds its book behind an Arc<Mutex<..>>
// and hands out order ids from an AtomicU64 counter.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::atr::OhlcBar;
use crate::errors::{EngineError, EngineResult};
use crate::grid_level::{Side, TrackedOrder};
use crate::ingestor;
use crate::signing;
use crate::symbol::SymbolRules;

/// Whether a placed order opens or closes exposure. Distinct from `Side`:
/// an order can BUY to open (LONG) or BUY to close (SHORT's close side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionAction {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// One fill/ack event for a tracked order, as delivered on the user stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub asset: String,
    pub balance: Decimal,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub symbol: String,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub ts: DateTime<Utc>,
}

/// Everything a consumer of the private user stream may observe, including
/// the synthetic `Resync` emitted after a reconnect and the `Disconnected`
/// marker emitted while a reconnect attempt is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    Order(OrderUpdate),
    Balance(BalanceUpdate),
    Position(PositionUpdate),
    Resync,
    /// The stream reader has entered its backoff-reconnect loop; no further
    /// events will arrive until `Resync`. Distinct from the channel closing,
    /// which only happens on permanent teardown.
    Disconnected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookTicker {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub ts: DateTime<Utc>,
}

impl BookTicker {
    pub fn mid(&self) -> Decimal {
        (self.best_bid + self.best_ask) / dec!(2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    /// Signed: positive for LONG exposure, negative for SHORT.
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Account-level snapshot used by SyncController's risk loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStatus {
    pub balance: Decimal,
    pub open_order_count: u32,
    pub position_size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub margin_ratio: Decimal,
    pub connected: bool,
    pub last_heartbeat: DateTime<Utc>,
}

/// Uniform per-account API over one exchange session. All
/// price/qty inputs arriving here must already be snapped to tick/lot;
/// implementations surface exchange rejections as `EngineError` variants,
/// never a raw library error.
#[async_trait]
pub trait ExchangeSession: Send + Sync {
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        action: PositionAction,
        client_id: String,
    ) -> EngineResult<TrackedOrder>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> EngineResult<()>;

    async fn cancel_all(&self, symbol: &str) -> EngineResult<u32>;

    async fn open_orders(&self, symbol: &str) -> EngineResult<Vec<TrackedOrder>>;

    async fn positions(&self, symbol: &str) -> EngineResult<Vec<PositionInfo>>;

    async fn balance(&self, asset: &str) -> EngineResult<Decimal>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()>;

    async fn set_position_mode(&self, hedge: bool) -> EngineResult<()>;

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32) -> EngineResult<Vec<OhlcBar>>;

    async fn symbol_rules(&self, symbol: &str) -> EngineResult<SymbolRules>;

    /// Reduce-only market close of residual position; used only by
    /// `emergency_unwind`.
    async fn close_market(&self, symbol: &str, side: Side, qty: Decimal) -> EngineResult<TrackedOrder>;

    async fn account_status(&self, symbol: &str) -> EngineResult<AccountStatus>;

    /// Self-healing: reconnects with exponential backoff, re-keys
    /// authentication, and emits a synthetic `Resync` on reconnect so
    /// consumers reconcile via snapshot queries.
    fn subscribe_user_stream(self: Arc<Self>) -> mpsc::Receiver<StreamEvent>;

    fn subscribe_book_ticker(self: Arc<Self>, symbol: String) -> mpsc::Receiver<BookTicker>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SimExchange — in-process, deterministic mock used by tests and mock=true runs
// ─────────────────────────────────────────────────────────────────────────────

struct SimInner {
    balances: HashMap<String, Decimal>,
    open_orders: HashMap<String, TrackedOrder>, // keyed by client_order_id
    position: PositionInfo,
    mid_price: Decimal,
    rules: SymbolRules,
    leverage: u32,
    hedge_mode: bool,
    event_tx: Option<mpsc::Sender<StreamEvent>>,
    ohlcv: Vec<OhlcBar>,
}

/// Deterministic in-process exchange. Orders rest until `set_mid_price`
/// moves the simulated market through their price, at which point they fill
/// and an `OrderUpdate` is pushed to any subscribed user stream. This is
/// enough to exercise `GridExecutor`/`SyncController` end-to-end without a
/// network.
pub struct SimExchange {
    inner: Mutex<SimInner>,
    next_oid: AtomicU64,
}

impl SimExchange {
    pub fn new(symbol: &str, initial_balance: Decimal, mid_price: Decimal, rules: SymbolRules) -> Self {
        let mut balances = HashMap::new();
        balances.insert("quote".to_string(), initial_balance);
        Self {
            inner: Mutex::new(SimInner {
                balances,
                open_orders: HashMap::new(),
                position: PositionInfo {
                    symbol: symbol.to_string(),
                    size: Decimal::ZERO,
                    entry_price: Decimal::ZERO,
                    unrealized_pnl: Decimal::ZERO,
                },
                mid_price,
                rules,
                leverage: 1,
                hedge_mode: false,
                event_tx: None,
                ohlcv: Vec::new(),
            }),
            next_oid: AtomicU64::new(1),
        }
    }

    pub fn with_ohlcv(self, bars: Vec<OhlcBar>) -> Self {
        // Only used at construction time in tests, before any concurrent access.
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.ohlcv = bars;
        }
        self
    }

    pub async fn mid_price(&self) -> Decimal {
        self.inner.lock().await.mid_price
    }

    /// Moves the simulated market, filling any resting order the new price
    /// crosses. Test-only entry point; not part of `ExchangeSession`.
    pub async fn set_mid_price(&self, price: Decimal) {
        let mut inner = self.inner.lock().await;
        inner.mid_price = price;
        let crossed: Vec<String> = inner
            .open_orders
            .iter()
            .filter(|(_, o)| match o.side {
                Side::Buy => price <= o.intended_price,
                Side::Sell => price >= o.intended_price,
            })
            .map(|(id, _)| id.clone())
            .collect();

        for client_id in crossed {
            let order = inner.open_orders.remove(&client_id).unwrap();
            let fill_qty = order.intended_qty - order.filled_qty;
            Self::apply_fill_locked(&mut inner, &order, order.intended_price, fill_qty);
            let update = OrderUpdate {
                client_order_id: order.client_order_id.clone(),
                exchange_order_id: order.exchange_order_id.clone().unwrap_or_default(),
                symbol: inner.position.symbol.clone(),
                side: order.side,
                status: OrderStatus::Filled,
                filled_qty: order.intended_qty,
                avg_fill_price: order.intended_price,
                ts: Utc::now(),
            };
            if let Some(tx) = &inner.event_tx {
                let _ = tx.try_send(StreamEvent::Order(update));
            }
        }
    }

    /// Pushes a `StreamEvent` directly to the subscribed user stream, for
    /// exercising reconnect/resync/disconnect handling without a real
    /// network. Test-only entry point; not part of `ExchangeSession`.
    pub async fn push_stream_event(&self, event: StreamEvent) {
        if let Some(tx) = &self.inner.lock().await.event_tx {
            let _ = tx.try_send(event);
        }
    }

    fn apply_fill_locked(inner: &mut SimInner, order: &TrackedOrder, price: Decimal, qty: Decimal) {
        let signed_qty = match order.side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };
        let prior_size = inner.position.size;
        let new_size = prior_size + signed_qty;
        if prior_size.is_zero() || prior_size.signum() == signed_qty.signum() {
            let prior_notional = inner.position.entry_price * prior_size.abs();
            let added_notional = price * qty;
            let total_size = prior_size.abs() + qty;
            if !total_size.is_zero() {
                inner.position.entry_price = (prior_notional + added_notional) / total_size;
            }
        } else {
            // Reducing or flipping: realize PnL against the prior entry price.
            let closed_qty = qty.min(prior_size.abs());
            let pnl = match order.side {
                Side::Buy => (inner.position.entry_price - price) * closed_qty,
                Side::Sell => (price - inner.position.entry_price) * closed_qty,
            };
            if let Some(bal) = inner.balances.get_mut("quote") {
                *bal += pnl;
            }
        }
        inner.position.size = new_size;
    }
}

#[async_trait]
impl ExchangeSession for SimExchange {
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        _action: PositionAction,
        client_id: String,
    ) -> EngineResult<TrackedOrder> {
        let mut inner = self.inner.lock().await;
        if qty < inner.rules.lot_size {
            return Err(EngineError::ExchangeRejected(format!(
                "qty {qty} below lot size {}",
                inner.rules.lot_size
            )));
        }
        if price * qty < inner.rules.min_notional {
            return Err(EngineError::ExchangeRejected(format!(
                "notional {} below min_notional {}",
                price * qty,
                inner.rules.min_notional
            )));
        }
        debug_assert_eq!(symbol, inner.position.symbol, "SimExchange is single-symbol");
        let oid = self.next_oid.fetch_add(1, Ordering::SeqCst);
        let mut order = TrackedOrder::new(client_id.clone(), 0, side, price, qty);
        order.exchange_order_id = Some(format!("sim-{oid}"));
        inner.open_orders.insert(client_id, order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        inner.open_orders.retain(|_, o| o.exchange_order_id.as_deref() != Some(order_id));
        Ok(())
    }

    async fn cancel_all(&self, _symbol: &str) -> EngineResult<u32> {
        let mut inner = self.inner.lock().await;
        let n = inner.open_orders.len() as u32;
        inner.open_orders.clear();
        Ok(n)
    }

    async fn open_orders(&self, _symbol: &str) -> EngineResult<Vec<TrackedOrder>> {
        Ok(self.inner.lock().await.open_orders.values().cloned().collect())
    }

    async fn positions(&self, _symbol: &str) -> EngineResult<Vec<PositionInfo>> {
        let inner = self.inner.lock().await;
        if inner.position.size.is_zero() {
            Ok(Vec::new())
        } else {
            Ok(vec![inner.position.clone()])
        }
    }

    async fn balance(&self, asset: &str) -> EngineResult<Decimal> {
        let key = if asset.is_empty() { "quote" } else { asset };
        Ok(self.inner.lock().await.balances.get(key).copied().unwrap_or_default())
    }

    async fn set_leverage(&self, _symbol: &str, leverage: u32) -> EngineResult<()> {
        self.inner.lock().await.leverage = leverage;
        Ok(())
    }

    async fn set_position_mode(&self, hedge: bool) -> EngineResult<()> {
        self.inner.lock().await.hedge_mode = hedge;
        Ok(())
    }

    async fn fetch_ohlcv(&self, _symbol: &str, _timeframe: &str, limit: u32) -> EngineResult<Vec<OhlcBar>> {
        let inner = self.inner.lock().await;
        let n = inner.ohlcv.len();
        let take = (limit as usize).min(n);
        Ok(inner.ohlcv[n - take..].to_vec())
    }

    async fn symbol_rules(&self, _symbol: &str) -> EngineResult<SymbolRules> {
        Ok(self.inner.lock().await.rules.clone())
    }

    async fn close_market(&self, _symbol: &str, side: Side, qty: Decimal) -> EngineResult<TrackedOrder> {
        let mut inner = self.inner.lock().await;
        let price = inner.mid_price;
        let order = TrackedOrder::new(format!("close-{}", uuid::Uuid::new_v4()), 0, side, price, qty);
        Self::apply_fill_locked(&mut inner, &order, price, qty);
        Ok(order)
    }

    async fn account_status(&self, _symbol: &str) -> EngineResult<AccountStatus> {
        let inner = self.inner.lock().await;
        let balance = inner.balances.get("quote").copied().unwrap_or_default();
        let margin_ratio = if balance.is_zero() {
            Decimal::ZERO
        } else {
            (inner.position.size.abs() * inner.position.entry_price / Decimal::from(inner.leverage.max(1))) / balance
        };
        Ok(AccountStatus {
            balance,
            open_order_count: inner.open_orders.len() as u32,
            position_size: inner.position.size,
            entry_price: inner.position.entry_price,
            unrealized_pnl: inner.position.unrealized_pnl,
            margin_ratio,
            connected: true,
            last_heartbeat: Utc::now(),
        })
    }

    fn subscribe_user_stream(self: Arc<Self>) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(256);
        let this = self.clone();
        tokio::spawn(async move {
            this.inner.lock().await.event_tx = Some(tx);
        });
        rx
    }

    fn subscribe_book_ticker(self: Arc<Self>, _symbol: String) -> mpsc::Receiver<BookTicker> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let mid = this.mid_price().await;
                let half_tick = this.inner.lock().await.rules.tick_size;
                let ticker = BookTicker {
                    best_bid: mid - half_tick,
                    best_ask: mid + half_tick,
                    ts: Utc::now(),
                };
                if tx.send(ticker).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        rx
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LiveExchange — signed REST + WebSocket transport for one venue
//
// Request builders and asset metadata caching, signed with a generic
// Binance-style HMAC-over-query-string scheme; real request signing lives
// entirely in signing.rs.
// ─────────────────────────────────────────────────────────────────────────────

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LiveExchange {
    client: reqwest::Client,
    base_url: String,
    ws_base_url: String,
    api_key: String,
    api_secret: String,
    rules_cache: Mutex<HashMap<String, SymbolRules>>,
}

impl LiveExchange {
    pub fn new(base_url: String, ws_base_url: String, api_key: String, api_secret: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("reqwest client with static config builds");
        Self {
            client,
            base_url,
            ws_base_url,
            api_key,
            api_secret,
            rules_cache: Mutex::new(HashMap::new()),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    async fn signed_get(&self, path: &str, params: &str) -> EngineResult<serde_json::Value> {
        let signed = signing::build_signed_query(&self.api_secret, params, Self::now_ms());
        let url = format!("{}{path}?{signed}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await?;
        Self::parse_response(resp).await
    }

    async fn signed_post(&self, path: &str, params: &str) -> EngineResult<serde_json::Value> {
        let signed = signing::build_signed_query(&self.api_secret, params, Self::now_ms());
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(signed)
            .send()
            .await?;
        Self::parse_response(resp).await
    }

    async fn signed_delete(&self, path: &str, params: &str) -> EngineResult<serde_json::Value> {
        let signed = signing::build_signed_query(&self.api_secret, params, Self::now_ms());
        let url = format!("{}{path}?{signed}", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await?;
        Self::parse_response(resp).await
    }

    async fn parse_response(resp: reqwest::Response) -> EngineResult<serde_json::Value> {
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;
        if status.is_success() {
            Ok(body)
        } else if status.as_u16() == 429 || status.is_server_error() {
            Err(EngineError::Transient(format!("http {status}: {body}")))
        } else {
            Err(EngineError::ExchangeRejected(format!("http {status}: {body}")))
        }
    }

    /// Decimal fields arrive as JSON strings on this class of venue; parsing
    /// via string preserves exact value instead of round-tripping through a
    /// binary float.
    fn decimal_field(value: &serde_json::Value, field: &str) -> EngineResult<Decimal> {
        let raw = value
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Transient(format!("missing field {field} in response")))?;
        Decimal::from_str(raw).map_err(|e| EngineError::Transient(format!("bad decimal {field}={raw}: {e}")))
    }
}

#[async_trait]
impl ExchangeSession for LiveExchange {
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        action: PositionAction,
        client_id: String,
    ) -> EngineResult<TrackedOrder> {
        let position_side = match action {
            PositionAction::Open => "OPEN",
            PositionAction::Close => "CLOSE",
        };
        let params = format!(
            "symbol={symbol}&side={}&type=LIMIT&timeInForce=GTX&quantity={qty}&price={price}&positionSide={position_side}&newClientOrderId={client_id}",
            side.as_str(),
        );
        let resp = self.signed_post("/fapi/v1/order", &params).await?;
        let exchange_order_id = resp
            .get("orderId")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let mut order = TrackedOrder::new(client_id, 0, side, price, qty);
        order.exchange_order_id = Some(exchange_order_id);
        Ok(order)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> EngineResult<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.signed_delete("/fapi/v1/order", &params).await?;
        Ok(())
    }

    async fn cancel_all(&self, symbol: &str) -> EngineResult<u32> {
        let params = format!("symbol={symbol}");
        let resp = self.signed_delete("/fapi/v1/allOpenOrders", &params).await?;
        Ok(resp.get("cancelCount").and_then(|v| v.as_u64()).unwrap_or(0) as u32)
    }

    async fn open_orders(&self, symbol: &str) -> EngineResult<Vec<TrackedOrder>> {
        let params = format!("symbol={symbol}");
        let resp = self.signed_get("/fapi/v1/openOrders", &params).await?;
        let entries = resp.as_array().cloned().unwrap_or_default();
        let mut orders = Vec::with_capacity(entries.len());
        for entry in entries {
            let side = if entry.get("side").and_then(|v| v.as_str()) == Some("BUY") {
                Side::Buy
            } else {
                Side::Sell
            };
            let price = Self::decimal_field(&entry, "price")?;
            let qty = Self::decimal_field(&entry, "origQty")?;
            let filled = Self::decimal_field(&entry, "executedQty").unwrap_or(Decimal::ZERO);
            let client_id = entry
                .get("clientOrderId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let mut order = TrackedOrder::new(client_id, 0, side, price, qty);
            order.exchange_order_id = entry.get("orderId").map(|v| v.to_string());
            order.filled_qty = filled;
            orders.push(order);
        }
        Ok(orders)
    }

    async fn positions(&self, symbol: &str) -> EngineResult<Vec<PositionInfo>> {
        let params = format!("symbol={symbol}");
        let resp = self.signed_get("/fapi/v2/positionRisk", &params).await?;
        let entries = resp.as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let size = Self::decimal_field(&entry, "positionAmt")?;
            if size.is_zero() {
                continue;
            }
            out.push(PositionInfo {
                symbol: symbol.to_string(),
                size,
                entry_price: Self::decimal_field(&entry, "entryPrice")?,
                unrealized_pnl: Self::decimal_field(&entry, "unRealizedProfit").unwrap_or(Decimal::ZERO),
            });
        }
        Ok(out)
    }

    async fn balance(&self, asset: &str) -> EngineResult<Decimal> {
        let resp = self.signed_get("/fapi/v2/balance", "").await?;
        let entries = resp.as_array().cloned().unwrap_or_default();
        entries
            .iter()
            .find(|e| e.get("asset").and_then(|v| v.as_str()) == Some(asset))
            .map(|e| Self::decimal_field(e, "balance"))
            .transpose()?
            .ok_or_else(|| EngineError::ExchangeRejected(format!("no balance entry for asset {asset}")))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.signed_post("/fapi/v1/leverage", &params).await?;
        Ok(())
    }

    async fn set_position_mode(&self, hedge: bool) -> EngineResult<()> {
        let params = format!("dualSidePosition={}", hedge);
        self.signed_post("/fapi/v1/positionSide/dual", &params).await?;
        Ok(())
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32) -> EngineResult<Vec<OhlcBar>> {
        let params = format!("symbol={symbol}&interval={timeframe}&limit={limit}");
        let url = format!("{}/fapi/v1/klines?{params}", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let rows: Vec<serde_json::Value> = resp.json().await?;
        rows.iter()
            .map(|row| {
                let arr = row.as_array().ok_or_else(|| EngineError::Transient("malformed kline row".into()))?;
                let high: f64 = arr.get(2).and_then(|v| v.as_str()).unwrap_or("0").parse().unwrap_or(0.0);
                let low: f64 = arr.get(3).and_then(|v| v.as_str()).unwrap_or("0").parse().unwrap_or(0.0);
                let close: f64 = arr.get(4).and_then(|v| v.as_str()).unwrap_or("0").parse().unwrap_or(0.0);
                Ok(OhlcBar { high, low, close })
            })
            .collect()
    }

    async fn symbol_rules(&self, symbol: &str) -> EngineResult<SymbolRules> {
        if let Some(cached) = self.rules_cache.lock().await.get(symbol) {
            return Ok(cached.clone());
        }
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let body: serde_json::Value = resp.json().await?;
        let entry = body
            .get("symbols")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.iter().find(|s| s.get("symbol").and_then(|v| v.as_str()) == Some(symbol)))
            .ok_or_else(|| EngineError::ExchangeRejected(format!("unknown symbol {symbol}")))?;

        let filters = entry.get("filters").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let find_filter = |kind: &str| filters.iter().find(|f| f.get("filterType").and_then(|v| v.as_str()) == Some(kind));

        let tick_size = find_filter("PRICE_FILTER")
            .map(|f| Self::decimal_field(f, "tickSize"))
            .transpose()?
            .unwrap_or(dec!(0.01));
        let lot_size = find_filter("LOT_SIZE")
            .map(|f| Self::decimal_field(f, "stepSize"))
            .transpose()?
            .unwrap_or(dec!(1));
        let min_notional = find_filter("MIN_NOTIONAL")
            .map(|f| Self::decimal_field(f, "notional"))
            .transpose()?
            .unwrap_or(dec!(5));

        let brackets_url = format!("{}/fapi/v1/leverageBracket?symbol={symbol}", self.base_url);
        let signed = signing::build_signed_query(&self.api_secret, "", Self::now_ms());
        let brackets_resp = self
            .client
            .get(format!("{brackets_url}&{signed}"))
            .header("X-API-KEY", &self.api_key)
            .send()
            .await?;
        let brackets_body: serde_json::Value = brackets_resp.json().await?;
        let leverage_brackets = brackets_body
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|entry| entry.get("brackets"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|b| {
                        Ok(crate::symbol::LeverageBracket {
                            notional_floor: Self::decimal_field(b, "notionalFloor").unwrap_or(Decimal::ZERO),
                            notional_cap: Self::decimal_field(b, "notionalCap").unwrap_or(dec!(1_000_000_000)),
                            maintenance_margin_ratio: Self::decimal_field(b, "maintMarginRatio").unwrap_or(dec!(0.01)),
                            max_leverage: b.get("initialLeverage").and_then(|v| v.as_u64()).unwrap_or(1) as u32,
                        })
                    })
                    .collect::<EngineResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let rules = SymbolRules {
            symbol: symbol.to_string(),
            tick_size,
            lot_size,
            min_notional,
            leverage_brackets,
        };
        self.rules_cache.lock().await.insert(symbol.to_string(), rules.clone());
        Ok(rules)
    }

    async fn close_market(&self, symbol: &str, side: Side, qty: Decimal) -> EngineResult<TrackedOrder> {
        let params = format!(
            "symbol={symbol}&side={}&type=MARKET&quantity={qty}&reduceOnly=true",
            side.as_str()
        );
        let resp = self.signed_post("/fapi/v1/order", &params).await?;
        let mut order = TrackedOrder::new(format!("unwind-{}", uuid::Uuid::new_v4()), 0, side, Decimal::ZERO, qty);
        order.exchange_order_id = resp.get("orderId").map(|v| v.to_string());
        Ok(order)
    }

    async fn account_status(&self, symbol: &str) -> EngineResult<AccountStatus> {
        let balance = self.balance("USDC").await.unwrap_or(Decimal::ZERO);
        let positions = self.positions(symbol).await.unwrap_or_default();
        let open_orders = self.open_orders(symbol).await.unwrap_or_default();
        let position = positions.into_iter().next();
        Ok(AccountStatus {
            balance,
            open_order_count: open_orders.len() as u32,
            position_size: position.as_ref().map(|p| p.size).unwrap_or(Decimal::ZERO),
            entry_price: position.as_ref().map(|p| p.entry_price).unwrap_or(Decimal::ZERO),
            unrealized_pnl: position.as_ref().map(|p| p.unrealized_pnl).unwrap_or(Decimal::ZERO),
            margin_ratio: Decimal::ZERO,
            connected: true,
            last_heartbeat: Utc::now(),
        })
    }

    fn subscribe_user_stream(self: Arc<Self>) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(256);
        let ws_base = self.ws_base_url.clone();
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();
        tokio::spawn(async move {
            ingestor::run_user_stream(ws_base, base_url, api_key, tx).await;
        });
        rx
    }

    fn subscribe_book_ticker(self: Arc<Self>, symbol: String) -> mpsc::Receiver<BookTicker> {
        let (tx, rx) = mpsc::channel(256);
        let ws_base = self.ws_base_url.clone();
        tokio::spawn(async move {
            ingestor::run_book_ticker_stream(ws_base, symbol, tx).await;
        });
        rx
    }
}
