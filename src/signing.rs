// ─────────────────────────────────────────────────────────────────────────────
// signing.rs — REST request signing
//
// HMAC-SHA256-over-query-string signing, the scheme common to Binance-style
// perpetual-futures REST APIs.
// ─────────────────────────────────────────────────────────────────────────────
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs a canonical query string with the account's API secret, returning
/// the lowercase hex digest to attach as the `signature` query parameter.
pub fn sign_query_string(secret: &str, query: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Builds the full signed query string (`params&timestamp=...&signature=...`)
/// for a REST request, given the already-encoded parameter string and the
/// millisecond timestamp to bind against replay.
pub fn build_signed_query(secret: &str, params: &str, timestamp_ms: i64) -> String {
    let with_ts = if params.is_empty() {
        format!("timestamp={timestamp_ms}")
    } else {
        format!("{params}&timestamp={timestamp_ms}")
    };
    let signature = sign_query_string(secret, &with_ts);
    format!("{with_ts}&signature={signature}")
}
