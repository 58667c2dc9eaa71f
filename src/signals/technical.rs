//! Technical indicator battery.
//!
//! Computes RSI(14), MACD(12,26,9), Bollinger(20,2), MA(20/50), ATR(14),
//! OBV, Stochastic(14,3) and VWAP over a candle window. Each indicator
//! yields a directional contribution in [0, 100] (50 neutral, above 50
//! long-biased); the technical subscore is their fixed-weight sum.

use rust_decimal::prelude::ToPrimitive;

use crate::exchange::Candle;

// Indicator weights; must sum to 1.0.
const WEIGHT_RSI: f64 = 0.10;
const WEIGHT_MACD: f64 = 0.15;
const WEIGHT_BOLLINGER: f64 = 0.10;
const WEIGHT_MA: f64 = 0.15;
const WEIGHT_OBV: f64 = 0.10;
const WEIGHT_STOCH: f64 = 0.10;
const WEIGHT_VWAP: f64 = 0.10;
const WEIGHT_ATR: f64 = 0.05;
const WEIGHT_VOLUME: f64 = 0.15;

const RSI_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const BB_PERIOD: usize = 20;
const BB_STD: f64 = 2.0;
const MA_SHORT: usize = 20;
const MA_MEDIUM: usize = 50;
const ATR_PERIOD: usize = 14;
const STOCH_K: usize = 14;
const STOCH_D: usize = 3;

/// Simple trend direction derived from moving averages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

/// Result of one technical analysis pass.
#[derive(Debug, Clone)]
pub struct TechnicalRead {
    /// Weighted composite in [0, 100]
    pub score: f64,
    /// ATR as a fraction of the last close (volatility input for sizing)
    pub atr_pct: f64,
    pub rsi: f64,
    pub trend: Trend,
}

impl TechnicalRead {
    /// Neutral read used when there is not enough candle history.
    pub fn neutral() -> Self {
        Self {
            score: 50.0,
            atr_pct: 0.0,
            rsi: 50.0,
            trend: Trend::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bar {
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

fn to_bars(candles: &[Candle]) -> Vec<Bar> {
    candles
        .iter()
        .filter_map(|c| {
            Some(Bar {
                high: c.high.to_f64()?,
                low: c.low.to_f64()?,
                close: c.close.to_f64()?,
                volume: c.volume.to_f64()?,
            })
        })
        .collect()
}

/// Analyze a candle window (oldest first).
pub fn analyze(candles: &[Candle]) -> TechnicalRead {
    let bars = to_bars(candles);
    if bars.len() < MACD_SLOW + MACD_SIGNAL {
        return TechnicalRead::neutral();
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let last = *closes.last().expect("non-empty");

    let rsi = rsi(&closes, RSI_PERIOD);
    let macd = macd_contribution(&closes);
    let bb = bollinger_contribution(&closes);
    let (ma, trend) = ma_contribution(&closes);
    let obv = obv_contribution(&bars);
    let stoch = stoch_contribution(&bars);
    let vwap = vwap_contribution(&bars);
    let atr_pct = atr(&bars, ATR_PERIOD) / last;
    let atr_contrib = atr_contribution(atr_pct);
    let volume = volume_contribution(&bars);

    let score = rsi_contribution(rsi) * WEIGHT_RSI
        + macd * WEIGHT_MACD
        + bb * WEIGHT_BOLLINGER
        + ma * WEIGHT_MA
        + obv * WEIGHT_OBV
        + stoch * WEIGHT_STOCH
        + vwap * WEIGHT_VWAP
        + atr_contrib * WEIGHT_ATR
        + volume * WEIGHT_VOLUME;

    TechnicalRead {
        score: score.clamp(0.0, 100.0),
        atr_pct,
        rsi,
        trend,
    }
}

/// ATR as a fraction of the last close; exposed for stop-loss sizing.
pub fn atr_fraction(candles: &[Candle]) -> f64 {
    let bars = to_bars(candles);
    let Some(last) = bars.last() else {
        return 0.0;
    };
    if bars.len() < ATR_PERIOD + 1 || last.close <= 0.0 {
        return 0.0;
    }
    atr(&bars, ATR_PERIOD) / last.close
}

/// Trend direction for a bare close series (used per-timeframe by the
/// multi-timeframe confirmation).
pub fn trend_direction(closes: &[f64]) -> Trend {
    if closes.len() < MA_SHORT {
        return Trend::Neutral;
    }
    let last = *closes.last().expect("non-empty");
    let short = sma_last(closes, MA_SHORT);
    let slope = short_slope(closes, MA_SHORT);

    if last > short && slope > 0.0 {
        Trend::Bullish
    } else if last < short && slope < 0.0 {
        Trend::Bearish
    } else {
        Trend::Neutral
    }
}

fn sma_last(values: &[f64], period: usize) -> f64 {
    let window = &values[values.len() - period..];
    window.iter().sum::<f64>() / period as f64
}

/// Slope of the short SMA over the last few bars, normalized by price.
fn short_slope(closes: &[f64], period: usize) -> f64 {
    if closes.len() < period + 3 {
        return 0.0;
    }
    let now = sma_last(closes, period);
    let then = sma_last(&closes[..closes.len() - 3], period);
    if then == 0.0 {
        0.0
    } else {
        (now - then) / then
    }
}

fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if values.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len() - period + 1);
    let mut current = values[..period].iter().sum::<f64>() / period as f64;
    out.push(current);
    for v in &values[period..] {
        current = v * k + current * (1.0 - k);
        out.push(current);
    }
    out
}

/// Wilder-smoothed RSI. Returns 50 when history is too short.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if closes.len() < period + 1 {
        return 50.0;
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let mut avg_gain = deltas[..period].iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
    let mut avg_loss = -deltas[..period].iter().filter(|d| **d < 0.0).sum::<f64>() / period as f64;

    for d in &deltas[period..] {
        avg_gain = (avg_gain * (period as f64 - 1.0) + d.max(0.0)) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + (-d).max(0.0)) / period as f64;
    }

    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

fn rsi_contribution(rsi: f64) -> f64 {
    // Oversold reads as a long opportunity, overbought as exhaustion
    if rsi <= 30.0 {
        50.0 + ((30.0 - rsi) / 30.0).min(1.0) * 50.0
    } else if rsi >= 70.0 {
        50.0 - ((rsi - 70.0) / 30.0).min(1.0) * 50.0
    } else if rsi > 50.0 {
        50.0 + (rsi - 50.0) / 50.0 * 25.0
    } else {
        50.0 - (50.0 - rsi) / 50.0 * 25.0
    }
}

fn macd_contribution(closes: &[f64]) -> f64 {
    let fast = ema(closes, MACD_FAST);
    let slow = ema(closes, MACD_SLOW);
    if slow.len() < 2 || fast.len() < slow.len() {
        return 50.0;
    }
    // Align: ema() outputs start at index (period - 1)
    let offset = fast.len() - slow.len();
    let macd_line: Vec<f64> = slow
        .iter()
        .enumerate()
        .map(|(i, s)| fast[i + offset] - s)
        .collect();
    let signal = ema(&macd_line, MACD_SIGNAL);
    if signal.is_empty() {
        return 50.0;
    }
    let hist = macd_line.last().expect("non-empty") - signal.last().expect("non-empty");
    let prev_hist = if macd_line.len() >= 2 && signal.len() >= 2 {
        macd_line[macd_line.len() - 2] - signal[signal.len() - 2]
    } else {
        0.0
    };

    let price = *closes.last().expect("non-empty");
    let strength = (hist.abs() / price * 2000.0).min(1.0);
    let expanding = hist.abs() > prev_hist.abs();

    if hist > 0.0 {
        50.0 + strength * if expanding { 50.0 } else { 35.0 }
    } else {
        50.0 - strength * if expanding { 50.0 } else { 35.0 }
    }
}

fn bollinger_contribution(closes: &[f64]) -> f64 {
    if closes.len() < BB_PERIOD {
        return 50.0;
    }
    let middle = sma_last(closes, BB_PERIOD);
    let window = &closes[closes.len() - BB_PERIOD..];
    let std = (window.iter().map(|p| (p - middle).powi(2)).sum::<f64>() / BB_PERIOD as f64).sqrt();
    let upper = middle + BB_STD * std;
    let lower = middle - BB_STD * std;
    let price = *closes.last().expect("non-empty");

    if price < lower {
        50.0 + ((lower - price) / lower).min(1.0) * 50.0
    } else if price > upper {
        50.0 - ((price - upper) / upper).min(1.0) * 50.0
    } else if upper > lower {
        // Inside the bands a touch of the lower band is a dip-buy signal
        let pct_b = (price - lower) / (upper - lower);
        50.0 + (0.5 - pct_b) * 40.0
    } else {
        50.0
    }
}

fn ma_contribution(closes: &[f64]) -> (f64, Trend) {
    if closes.len() < MA_MEDIUM {
        return (50.0, trend_direction(closes));
    }
    let short = sma_last(closes, MA_SHORT);
    let medium = sma_last(closes, MA_MEDIUM);
    let price = *closes.last().expect("non-empty");

    let score = if price > short && short > medium {
        75.0 + ((price - short) / short * 500.0).min(25.0)
    } else if price > short {
        62.0
    } else if price < short && short < medium {
        25.0 - ((short - price) / short * 500.0).min(25.0)
    } else {
        42.0
    };

    let trend = if price > short && short > medium {
        Trend::Bullish
    } else if price < short && short < medium {
        Trend::Bearish
    } else {
        Trend::Neutral
    };

    (score.clamp(0.0, 100.0), trend)
}

fn obv_contribution(bars: &[Bar]) -> f64 {
    if bars.len() < 11 {
        return 50.0;
    }
    let mut obv = vec![0.0f64];
    for w in bars.windows(2) {
        let prev = *obv.last().expect("non-empty");
        let next = if w[1].close > w[0].close {
            prev + w[1].volume
        } else if w[1].close < w[0].close {
            prev - w[1].volume
        } else {
            prev
        };
        obv.push(next);
    }
    let recent = &obv[obv.len() - 10..];
    let base = recent[0].abs().max(1.0);
    let drift = (recent[recent.len() - 1] - recent[0]) / base;
    50.0 + (drift * 10.0).clamp(-1.0, 1.0) * 50.0
}

fn stoch_contribution(bars: &[Bar]) -> f64 {
    if bars.len() < STOCH_K + STOCH_D {
        return 50.0;
    }
    let k_at = |end: usize| -> f64 {
        let window = &bars[end - STOCH_K..end];
        let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        if high == low {
            50.0
        } else {
            (bars[end - 1].close - low) / (high - low) * 100.0
        }
    };

    let k = k_at(bars.len());
    let d = (0..STOCH_D).map(|i| k_at(bars.len() - i)).sum::<f64>() / STOCH_D as f64;

    if k <= 20.0 {
        50.0 + ((20.0 - k) / 20.0).min(1.0) * 50.0
    } else if k >= 80.0 {
        50.0 - ((k - 80.0) / 20.0).min(1.0) * 50.0
    } else if k > d {
        50.0 + ((k - d) / 20.0).min(1.0) * 30.0
    } else {
        50.0 - ((d - k) / 20.0).min(1.0) * 30.0
    }
}

fn vwap_contribution(bars: &[Bar]) -> f64 {
    let mut tpv = 0.0;
    let mut vol = 0.0;
    for b in bars {
        tpv += (b.high + b.low + b.close) / 3.0 * b.volume;
        vol += b.volume;
    }
    if vol <= 0.0 {
        return 50.0;
    }
    let vwap = tpv / vol;
    let price = bars.last().expect("non-empty").close;
    // Price above session VWAP confirms demand
    50.0 + ((price - vwap) / vwap * 10.0).clamp(-1.0, 1.0) * 50.0
}

fn atr(bars: &[Bar], period: usize) -> f64 {
    if bars.len() < period + 1 {
        return 0.0;
    }
    let trs: Vec<f64> = bars
        .windows(2)
        .map(|w| {
            (w[1].high - w[1].low)
                .max((w[1].high - w[0].close).abs())
                .max((w[1].low - w[0].close).abs())
        })
        .collect();
    let mut atr = trs[..period].iter().sum::<f64>() / period as f64;
    for tr in &trs[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
    }
    atr
}

fn atr_contribution(atr_pct: f64) -> f64 {
    // Tradable volatility sweet spot is 3-8%; extremes are penalized
    if (0.03..=0.08).contains(&atr_pct) {
        70.0
    } else if atr_pct < 0.01 {
        45.0
    } else if atr_pct < 0.03 {
        55.0
    } else if atr_pct > 0.15 {
        20.0
    } else {
        40.0
    }
}

fn volume_contribution(bars: &[Bar]) -> f64 {
    if bars.len() < 25 {
        return 50.0;
    }
    let recent = bars[bars.len() - 5..].iter().map(|b| b.volume).sum::<f64>() / 5.0;
    let base = bars[bars.len() - 25..bars.len() - 5]
        .iter()
        .map(|b| b.volume)
        .sum::<f64>()
        / 20.0;
    if base <= 0.0 {
        return 50.0;
    }
    let ratio = recent / base;
    let rising_price = bars[bars.len() - 1].close >= bars[bars.len() - 5].close;

    // Expanding volume confirms the move in its direction
    let push = ((ratio - 1.0) * 50.0).clamp(-40.0, 40.0);
    if rising_price {
        50.0 + push
    } else {
        50.0 - push
    }
}
