// ─────────────────────────────────────────────────────────────────────────────
// atr.rs — Average True Range channel, Wilder's RMA smoothing
//
// Floating point is intentionally used here and nowhere else on the order
// path: ATR is a volatility estimate, not a tradable quantity.
// ─────────────────────────────────────────────────────────────────────────────
use chrono::{DateTime, Utc};

/// One OHLC bar as fetched from `ExchangeSession::fetch_ohlcv`.
#[derive(Debug, Clone, Copy)]
pub struct OhlcBar {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ATRResult {
    pub atr: f64,
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub computed_at: DateTime<Utc>,
}

/// Computes true-range values for a bar series (requires the prior bar's
/// close, so the first bar is skipped).
fn true_ranges(bars: &[OhlcBar]) -> Vec<f64> {
    bars.windows(2)
        .map(|w| {
            let (prev, cur) = (w[0], w[1]);
            let a = cur.high - cur.low;
            let b = (cur.high - prev.close).abs();
            let c = (cur.low - prev.close).abs();
            a.max(b).max(c)
        })
        .collect()
}

/// Wilder's RMA-smoothed ATR: seed with the mean of the first `period` true
/// ranges, then recurrence ATR_i = ((period-1)*ATR_{i-1} + TR_i) / period.
pub fn compute_atr(bars: &[OhlcBar], period: u32) -> Option<f64> {
    let trs = true_ranges(bars);
    let period = period as usize;
    if trs.len() < period || period == 0 {
        return None;
    }

    let seed: f64 = trs[..period].iter().sum::<f64>() / period as f64;
    let mut atr = seed;
    for tr in &trs[period..] {
        atr = ((period - 1) as f64 * atr + tr) / period as f64;
    }
    Some(atr)
}

pub struct ATRChannel {
    pub length: u32,
    pub multiplier: f64,
    pub lookback: u32,
}

impl ATRChannel {
    pub fn new(length: u32, multiplier: f64, lookback: u32) -> Self {
        Self {
            length,
            multiplier,
            lookback,
        }
    }

    /// Computes the ATR and derives channel bounds from the most recent
    /// `lookback` bars' high/low extremes. `bars` must contain
    /// at least `length + 1` bars for the ATR seed plus `lookback` bars for
    /// the channel; callers should fetch `atr_length + atr_lookback + 1`.
    pub fn compute(&self, bars: &[OhlcBar]) -> Option<ATRResult> {
        let atr = compute_atr(bars, self.length)?;
        if bars.len() < self.lookback as usize || self.lookback == 0 {
            return None;
        }
        let window = &bars[bars.len() - self.lookback as usize..];
        let max_high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let min_low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);

        Some(ATRResult {
            atr,
            upper_bound: max_high + self.multiplier * atr,
            lower_bound: min_low - self.multiplier * atr,
            computed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_bars(n: usize, price: f64, range: f64) -> Vec<OhlcBar> {
        (0..n)
            .map(|_| OhlcBar {
                high: price + range / 2.0,
                low: price - range / 2.0,
                close: price,
            })
            .collect()
    }

    #[test]
    fn atr_of_constant_range_bars_converges_to_the_range() {
        let bars = flat_bars(30, 100.0, 1.0);
        let atr = compute_atr(&bars, 14).unwrap();
        assert!((atr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn channel_bounds_respect_invariant() {
        let bars = flat_bars(40, 100.0, 1.0);
        let channel = ATRChannel::new(14, 2.0, 20);
        let result = channel.compute(&bars).unwrap();
        assert!(result.lower_bound < result.upper_bound);
        assert!(result.upper_bound - result.lower_bound >= 2.0 * result.atr * 2.0 - 1e-9);
    }

    #[test]
    fn insufficient_bars_returns_none() {
        let bars = flat_bars(5, 100.0, 1.0);
        let channel = ATRChannel::new(14, 2.0, 20);
        assert!(channel.compute(&bars).is_none());
    }
}
