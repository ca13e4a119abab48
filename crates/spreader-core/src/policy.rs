//! Spend policy: which entries qualify and how a target is split

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use spreader_types::{truncate_amount, Result, SpreaderError};

/// How the fan-out amounts are sized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanOutMode {
    /// Move the whole target, minus the fee buffer, split evenly
    #[default]
    Sweep,
    /// Pay exactly `amount_per_split` to each destination; the wallet keeps change
    Fixed,
}

impl FromStr for FanOutMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sweep" => Ok(Self::Sweep),
            "fixed" => Ok(Self::Fixed),
            other => Err(format!("unknown fan-out mode '{}', expected sweep or fixed", other)),
        }
    }
}

impl fmt::Display for FanOutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sweep => write!(f, "sweep"),
            Self::Fixed => write!(f, "fixed"),
        }
    }
}

/// Filter the selector applies: depth `M` and amount threshold `T`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub min_confirmations: u32,
    pub min_amount: Decimal,
}

impl SelectionPolicy {
    pub fn new(min_confirmations: u32, min_amount: Decimal) -> Self {
        Self {
            min_confirmations,
            min_amount,
        }
    }
}

/// Everything that decides what one round spends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadPolicy {
    /// Value each new destination should hold
    pub amount_per_split: Decimal,
    /// Number of destinations per transaction (`k`)
    pub fan_out_width: usize,
    /// Reserved for the transaction fee
    pub fee_buffer: Decimal,
    /// Minimum confirmation depth (`M`)
    pub min_confirmations: u32,
    pub mode: FanOutMode,
}

impl SpreadPolicy {
    pub const DEFAULT_FAN_OUT_WIDTH: usize = 5;

    pub fn new(amount_per_split: Decimal) -> Self {
        Self {
            amount_per_split,
            fan_out_width: Self::DEFAULT_FAN_OUT_WIDTH,
            fee_buffer: Decimal::new(1, 2),
            min_confirmations: 1,
            mode: FanOutMode::Sweep,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.amount_per_split <= Decimal::ZERO {
            return Err(SpreaderError::invalid_policy("amount per split must be positive"));
        }
        if self.fan_out_width == 0 {
            return Err(SpreaderError::invalid_policy("fan-out width must be at least 1"));
        }
        if self.fee_buffer < Decimal::ZERO {
            return Err(SpreaderError::invalid_policy("fee buffer cannot be negative"));
        }
        if truncate_amount(self.amount_per_split) != self.amount_per_split {
            return Err(SpreaderError::invalid_policy("amount per split has more than 8 decimal places"));
        }
        Ok(())
    }

    /// `T`: the fan-out total plus the fee buffer
    pub fn threshold(&self) -> Decimal {
        self.amount_per_split * Decimal::from(self.fan_out_width) + self.fee_buffer
    }

    pub fn selection(&self) -> SelectionPolicy {
        SelectionPolicy::new(self.min_confirmations, self.threshold())
    }

    /// Per-destination amounts for a target holding `source`
    pub fn split_amounts(&self, source: Decimal) -> Result<Vec<Decimal>> {
        let each = match self.mode {
            FanOutMode::Fixed => self.amount_per_split,
            FanOutMode::Sweep => {
                truncate_amount((source - self.fee_buffer) / Decimal::from(self.fan_out_width))
            }
        };
        if each <= Decimal::ZERO || each * Decimal::from(self.fan_out_width) + self.fee_buffer > source {
            return Err(SpreaderError::invalid_policy(format!(
                "{} cannot fund {} outputs of {} plus fee buffer {}",
                source, self.fan_out_width, each, self.fee_buffer
            )));
        }
        Ok(vec![each; self.fan_out_width])
    }
}
