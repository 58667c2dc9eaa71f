//! Position sizing, take-profit/stop-loss derivation, trailing stops.
//!
//! Sizing starts from a base fraction of available capital, scaled by the
//! opportunity tier and the regime multiplier, clamped to the configured
//! per-trade band. A take-profit that cannot clear fees plus the profit
//! buffer rejects the opportunity outright: micro-profit trades lose money.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::debug;

use crate::config::{FeeConfig, RiskConfig, TradingConfig};
use crate::exchange::SymbolRule;
use crate::regime::Regime;
use crate::scoring::{Opportunity, Tier};
use crate::state::Position;
use crate::utils::decimal::{ceil_to_tick, floor_to_lot, floor_to_tick};

/// Why an opportunity was refused at the sizing stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizingRejection {
    #[error("regime blocks new entries")]
    RegimeBlocked,

    #[error("available capital below per-trade minimum")]
    InsufficientCapital,

    #[error("order below exchange minimum after rounding")]
    BelowMinimum,

    #[error("projected profit does not clear fees")]
    MicroProfit,
}

/// A fully normalized entry plan.
#[derive(Debug, Clone)]
pub struct TradePlan {
    pub symbol: String,
    /// Tick-normalized limit price
    pub entry_price: Decimal,
    /// Lot-normalized quantity
    pub quantity: Decimal,
    /// entry_price * quantity
    pub notional: Decimal,
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
}

/// Derives sizes and protective levels from config, tier and regime.
pub struct RiskSizer {
    trading: TradingConfig,
    risk: RiskConfig,
    fees: FeeConfig,
}

impl RiskSizer {
    pub fn new(trading: TradingConfig, risk: RiskConfig, fees: FeeConfig) -> Self {
        Self { trading, risk, fees }
    }

    /// Take-profit distance for a tier. The Standard tier uses the
    /// configured base; higher tiers get progressively wider targets.
    pub fn take_profit_pct(&self, tier: Tier) -> Decimal {
        let base = self.risk.take_profit_pct;
        match tier {
            Tier::Standard => base,
            Tier::Good => base + dec!(0.005),
            Tier::StrongSetup | Tier::HighConfidence => base + dec!(0.010),
            Tier::GodTier => base + dec!(0.015),
        }
    }

    /// ATR-adaptive stop distance, clamped to the configured band. Falls
    /// back to the fixed stop percentage when no ATR reading is available.
    pub fn stop_loss_pct(&self, atr_pct: f64) -> Decimal {
        let Some(atr) = Decimal::from_f64(atr_pct).filter(|a| *a > Decimal::ZERO) else {
            return self
                .risk
                .stop_loss_pct
                .clamp(self.risk.min_sl_pct, self.risk.max_sl_pct);
        };

        let multiplier = if atr < dec!(0.02) {
            dec!(1.0)
        } else if atr < dec!(0.05) {
            dec!(1.5)
        } else {
            dec!(2.0)
        };

        (atr * multiplier).clamp(self.risk.min_sl_pct, self.risk.max_sl_pct)
    }

    /// Round-trip fee estimate for an entry at `entry` and exit at `exit`.
    pub fn expected_fees(&self, quantity: Decimal, entry: Decimal, exit: Decimal) -> Decimal {
        quantity * entry * self.fees.taker_fee + quantity * exit * self.fees.maker_fee
    }

    /// Build a complete entry plan, or explain why there is none.
    pub fn plan_entry(
        &self,
        opportunity: &Opportunity,
        rule: &SymbolRule,
        regime: Regime,
        available: Decimal,
    ) -> Result<TradePlan, SizingRejection> {
        let regime_multiplier = regime.size_multiplier();
        if regime_multiplier == Decimal::ZERO {
            return Err(SizingRejection::RegimeBlocked);
        }
        if available < self.trading.min_capital_per_trade {
            return Err(SizingRejection::InsufficientCapital);
        }

        let raw_notional = self.trading.base_position_pct
            * opportunity.tier.size_multiplier()
            * regime_multiplier
            * available;
        let notional = raw_notional
            .clamp(
                self.trading.min_capital_per_trade,
                self.trading.max_capital_per_trade,
            )
            // Leave headroom for taker fees on the reservation
            .min(available * dec!(0.995));

        let entry_price = floor_to_tick(opportunity.price, rule.tick_size);
        if entry_price <= Decimal::ZERO {
            return Err(SizingRejection::BelowMinimum);
        }

        let mut quantity = floor_to_lot(notional / entry_price, rule.lot_size);
        if quantity <= Decimal::ZERO {
            return Err(SizingRejection::BelowMinimum);
        }
        // Rounding can drop the order under the exchange floor; one lot
        // increment restores it
        if quantity * entry_price < rule.min_notional {
            quantity += rule.lot_size;
        }
        let notional = quantity * entry_price;
        if notional < rule.min_notional || notional > available {
            return Err(SizingRejection::BelowMinimum);
        }

        let tp_pct = self.take_profit_pct(opportunity.tier);
        let take_profit = ceil_to_tick(entry_price * (Decimal::ONE + tp_pct), rule.tick_size);

        let sl_pct = self.stop_loss_pct(opportunity.atr_pct);
        let stop_loss = floor_to_tick(entry_price * (Decimal::ONE - sl_pct), rule.tick_size);

        // Fee viability: the take-profit must clear costs plus the buffer
        let gross = quantity * (take_profit - entry_price);
        let required = self.risk.min_profit_buffer + self.expected_fees(quantity, entry_price, take_profit);
        if gross < required {
            debug!(
                symbol = %opportunity.symbol,
                %gross,
                %required,
                "Rejected: projected profit below fee floor"
            );
            return Err(SizingRejection::MicroProfit);
        }

        Ok(TradePlan {
            symbol: opportunity.symbol.clone(),
            entry_price,
            quantity,
            notional,
            take_profit,
            stop_loss,
        })
    }

    /// Trailing-stop ratchet. Returns the new stop when the position's
    /// high-water gain justifies a raise; never lowers the stop.
    pub fn advance_stop(&self, position: &Position, tick_size: Decimal) -> Option<Decimal> {
        let gain = position.high_water_gain_pct;
        if gain < self.risk.trailing_activation_pct {
            return None;
        }

        let locked_fraction = if gain >= dec!(0.03) {
            dec!(0.70)
        } else if gain >= dec!(0.02) {
            dec!(0.50)
        } else {
            Decimal::ZERO // activation zone: move to break-even
        };

        let candidate = position.entry_price * (Decimal::ONE + gain * locked_fraction);
        let candidate = floor_to_tick(candidate, tick_size);

        // Ratchet only upward, and never across the current price
        if candidate > position.stop_loss && candidate < position.current_price {
            Some(candidate)
        } else {
            None
        }
    }
}
