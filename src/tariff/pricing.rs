//! Load-tiered pricing.

use serde::{Deserialize, Serialize};

/// Pricing tier derived from regional load percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadTier {
    /// Load > 90 %: +25 %.
    Critical,
    /// Load 75–90 %: +10 %.
    High,
    /// Load 50–75 %: base price.
    Normal,
    /// Load 25–50 %: −10 %.
    Low,
    /// Load < 25 %: −20 %.
    VeryLow,
}

impl LoadTier {
    pub fn from_load(load_percentage: f64) -> Self {
        if load_percentage > 90.0 {
            Self::Critical
        } else if load_percentage >= 75.0 {
            Self::High
        } else if load_percentage >= 50.0 {
            Self::Normal
        } else if load_percentage >= 25.0 {
            Self::Low
        } else {
            Self::VeryLow
        }
    }

    pub fn multiplier(self) -> f64 {
        match self {
            Self::Critical => 1.25,
            Self::High => 1.10,
            Self::Normal => 1.0,
            Self::Low => 0.90,
            Self::VeryLow => 0.80,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Critical => "Critical",
            Self::High => "High",
            Self::Normal => "Normal",
            Self::Low => "Low",
            Self::VeryLow => "Very low",
        }
    }
}

/// Price for a load level, rounded to paise so hysteresis comparisons are
/// exact.
pub fn price_for_load(base_price: f64, load_percentage: f64) -> (LoadTier, f64) {
    let tier = LoadTier::from_load(load_percentage);
    let price = base_price * tier.multiplier();
    (tier, (price * 100.0).round() / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_boundaries() {
        assert_eq!(LoadTier::from_load(95.0), LoadTier::Critical);
        assert_eq!(LoadTier::from_load(90.0), LoadTier::High);
        assert_eq!(LoadTier::from_load(75.0), LoadTier::High);
        assert_eq!(LoadTier::from_load(74.9), LoadTier::Normal);
        assert_eq!(LoadTier::from_load(50.0), LoadTier::Normal);
        assert_eq!(LoadTier::from_load(49.9), LoadTier::Low);
        assert_eq!(LoadTier::from_load(25.0), LoadTier::Low);
        assert_eq!(LoadTier::from_load(10.0), LoadTier::VeryLow);
    }

    #[test]
    fn critical_price_from_spec_example() {
        let (tier, price) = price_for_load(5.0, 92.0);
        assert_eq!(tier, LoadTier::Critical);
        assert!((price - 6.25).abs() < 1e-9);
    }

    #[test]
    fn discount_tiers_round_to_paise() {
        let (_, low) = price_for_load(5.0, 30.0);
        assert!((low - 4.5).abs() < 1e-9);
        let (_, very_low) = price_for_load(5.0, 10.0);
        assert!((very_low - 4.0).abs() < 1e-9);
    }
}
