// ─────────────────────────────────────────────────────────────────────────────
// ingestor.rs — self-healing WebSocket readers for LiveExchange
//
// Exponential-backoff reconnection loop (1s doubling to 32s, ping/pong
// heartbeat touch) over a generic book-ticker and user-data stream pair,
// plus the Resync-on-reconnect and Disconnected-on-outage contract.
// ─────────────────────────────────────────────────────────────────────────────
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::exchange::{BalanceUpdate, BookTicker, OrderStatus, OrderUpdate, PositionUpdate, StreamEvent};
use crate::grid_level::Side;

const MIN_RETRY_DELAY_SECS: u64 = 1;
const MAX_RETRY_DELAY_SECS: u64 = 32;

#[derive(Debug, Deserialize)]
struct RawBookTicker {
    #[serde(rename = "b")]
    best_bid: String,
    #[serde(rename = "a")]
    best_ask: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum RawUserEvent {
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTradeUpdate { o: RawOrder },
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate { a: RawAccountPayload },
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    s: String,
    c: String,
    i: u64,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "X")]
    status: String,
    z: String,
    #[serde(rename = "ap")]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
struct RawAccountPayload {
    #[serde(rename = "B")]
    balances: Vec<RawBalance>,
    #[serde(rename = "P")]
    positions: Vec<RawPosition>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    a: String,
    wb: String,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    s: String,
    pa: String,
    ep: String,
    up: String,
}

fn parse_decimal(raw: &str) -> Decimal {
    Decimal::from_str(raw).unwrap_or(Decimal::ZERO)
}

/// Parses a raw order status code into the engine's status taxonomy,
/// defaulting unknown codes to `New` rather than panicking on venue drift.
fn parse_status(raw: &str) -> OrderStatus {
    match raw {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "CANCELLED" | "EXPIRED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::New,
    }
}

/// Connects to `{ws_base}/ws/{symbol_lower}@bookTicker`, emitting a
/// `BookTicker` per update and reconnecting with exponential backoff on any
/// disconnect. Runs until the receiving end is dropped.
pub async fn run_book_ticker_stream(ws_base: String, symbol: String, tx: mpsc::Sender<BookTicker>) {
    let url = format!("{ws_base}/ws/{}@bookTicker", symbol.to_lowercase());
    let mut retry_delay = MIN_RETRY_DELAY_SECS;

    loop {
        if tx.is_closed() {
            return;
        }
        info!("[ingestor] connecting book ticker stream: {url}");
        match connect_async(match Url::parse(&url) {
            Ok(u) => u,
            Err(e) => {
                error!("[ingestor] malformed book ticker url {url}: {e}");
                return;
            }
        })
        .await
        {
            Ok((ws_stream, _)) => {
                info!("[ingestor] book ticker stream connected");
                retry_delay = MIN_RETRY_DELAY_SECS;
                let (mut write, mut read) = ws_stream.split();

                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            if let Ok(raw) = serde_json::from_str::<RawBookTicker>(&text) {
                                let ticker = BookTicker {
                                    best_bid: parse_decimal(&raw.best_bid),
                                    best_ask: parse_decimal(&raw.best_ask),
                                    ts: chrono::Utc::now(),
                                };
                                if tx.send(ticker).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(_)) => {
                            warn!("[ingestor] book ticker stream closed by server");
                            break;
                        }
                        Err(e) => {
                            warn!("[ingestor] book ticker stream error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => {
                error!("[ingestor] book ticker connect failed: {e}, retrying in {retry_delay}s");
            }
        }

        tokio::time::sleep(tokio::time::Duration::from_secs(retry_delay)).await;
        retry_delay = std::cmp::min(retry_delay * 2, MAX_RETRY_DELAY_SECS);
    }
}

/// Connects to the authenticated user-data stream, translating raw order and
/// account events into `StreamEvent`s. Every reconnect emits a synthetic
/// `StreamEvent::Resync` first so callers reconcile against a fresh snapshot
/// rather than trust any gap-spanning state. The first lost connection in a
/// given outage emits `StreamEvent::Disconnected` before entering the
/// backoff loop, since the loop itself never closes `tx` — a plain
/// `try_recv` against the channel can't otherwise distinguish "still
/// reconnecting" from "caught up" during a multi-minute outage.
pub async fn run_user_stream(ws_base: String, rest_base: String, api_key: String, tx: mpsc::Sender<StreamEvent>) {
    let listen_key = match obtain_listen_key(&rest_base, &api_key).await {
        Ok(key) => key,
        Err(e) => {
            error!("[ingestor] failed to obtain listen key: {e}");
            return;
        }
    };
    let url = format!("{ws_base}/ws/{listen_key}");
    let mut retry_delay = MIN_RETRY_DELAY_SECS;
    let mut first_connection = true;
    let mut was_connected = false;

    loop {
        if tx.is_closed() {
            return;
        }
        info!("[ingestor] connecting user stream");
        match connect_async(match Url::parse(&url) {
            Ok(u) => u,
            Err(e) => {
                error!("[ingestor] malformed user stream url: {e}");
                return;
            }
        })
        .await
        {
            Ok((ws_stream, _)) => {
                info!("[ingestor] user stream connected");
                retry_delay = MIN_RETRY_DELAY_SECS;
                was_connected = true;

                if !first_connection && tx.send(StreamEvent::Resync).await.is_err() {
                    return;
                }
                first_connection = false;

                let (mut write, mut read) = ws_stream.split();

                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            if let Some(event) = parse_user_event(&text) {
                                for e in event {
                                    if tx.send(e).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(_)) => {
                            warn!("[ingestor] user stream closed by server");
                            break;
                        }
                        Err(e) => {
                            warn!("[ingestor] user stream error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => {
                error!("[ingestor] user stream connect failed: {e}, retrying in {retry_delay}s");
            }
        }

        if was_connected {
            was_connected = false;
            if tx.send(StreamEvent::Disconnected).await.is_err() {
                return;
            }
        }

        tokio::time::sleep(tokio::time::Duration::from_secs(retry_delay)).await;
        retry_delay = std::cmp::min(retry_delay * 2, MAX_RETRY_DELAY_SECS);
    }
}

fn parse_user_event(text: &str) -> Option<Vec<StreamEvent>> {
    let raw: RawUserEvent = serde_json::from_str(text).ok()?;
    match raw {
        RawUserEvent::OrderTradeUpdate { o } => {
            let side = if o.side == "BUY" { Side::Buy } else { Side::Sell };
            Some(vec![StreamEvent::Order(OrderUpdate {
                client_order_id: o.c,
                exchange_order_id: o.i.to_string(),
                symbol: o.s,
                side,
                status: parse_status(&o.status),
                filled_qty: parse_decimal(&o.z),
                avg_fill_price: parse_decimal(&o.avg_price),
                ts: chrono::Utc::now(),
            })])
        }
        RawUserEvent::AccountUpdate { a } => {
            let now = chrono::Utc::now();
            let mut events: Vec<StreamEvent> = a
                .balances
                .into_iter()
                .map(|b| {
                    StreamEvent::Balance(BalanceUpdate {
                        asset: b.a,
                        balance: parse_decimal(&b.wb),
                        ts: now,
                    })
                })
                .collect();
            events.extend(a.positions.into_iter().map(|p| {
                StreamEvent::Position(PositionUpdate {
                    symbol: p.s,
                    size: parse_decimal(&p.pa),
                    entry_price: parse_decimal(&p.ep),
                    unrealized_pnl: parse_decimal(&p.up),
                    ts: now,
                })
            }));
            Some(events)
        }
    }
}

async fn obtain_listen_key(rest_base: &str, api_key: &str) -> Result<String, reqwest::Error> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{rest_base}/fapi/v1/listenKey"))
        .header("X-API-KEY", api_key)
        .send()
        .await?;
    let body: serde_json::Value = resp.json().await?;
    Ok(body
        .get("listenKey")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_defaults_unknown_codes_to_new() {
        assert!(matches!(parse_status("SOMETHING_NEW"), OrderStatus::New));
        assert!(matches!(parse_status("FILLED"), OrderStatus::Filled));
        assert!(matches!(parse_status("CANCELED"), OrderStatus::Cancelled));
    }

    #[test]
    fn parse_user_event_decodes_order_trade_update() {
        let text = r#"{"e":"ORDER_TRADE_UPDATE","o":{"s":"DOGEUSDC","c":"grid-1-0-0","i":42,"S":"BUY","X":"FILLED","z":"100","ap":"1.0001"}}"#;
        let events = parse_user_event(text).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Order(update) => {
                assert_eq!(update.client_order_id, "grid-1-0-0");
                assert_eq!(update.exchange_order_id, "42");
                assert!(matches!(update.status, OrderStatus::Filled));
            }
            _ => panic!("expected order event"),
        }
    }

    #[test]
    fn parse_user_event_decodes_account_update_into_balance_and_position() {
        let text = r#"{"e":"ACCOUNT_UPDATE","a":{"B":[{"a":"USDC","wb":"1000.5"}],"P":[{"s":"DOGEUSDC","pa":"100","ep":"1.0","up":"2.5"}]}}"#;
        let events = parse_user_event(text).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Balance(_)));
        assert!(matches!(events[1], StreamEvent::Position(_)));
    }
}
