//! Per-session cost ledger.
//!
//! Three tiers with fixed per-1k-unit rates. The ledger is rebuilt each turn
//! from the persisted `budget_cents_left` and written back after the turn,
//! so it carries no state of its own between requests.

use serde::{Deserialize, Serialize};

pub const DEFAULT_BUDGET_CENTS: f64 = 100.0;
/// Escalations are blocked once the remaining budget falls to this floor.
pub const ESCALATION_RESERVE_CENTS: f64 = 10.0;
/// Below this, everything routes to the cheap tier.
pub const CHEAP_MODE_FLOOR_CENTS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    Cheap,
    Embed,
    Thinker,
}

impl CostTier {
    /// Cents per 1000 units.
    pub fn rate_cents_per_1k(self) -> f64 {
        match self {
            CostTier::Cheap => 0.5,
            CostTier::Embed => 0.1,
            CostTier::Thinker => 2.5,
        }
    }

    /// Default unit estimate when the caller has no actual count.
    pub fn default_units(self) -> u64 {
        match self {
            CostTier::Cheap => 150,
            CostTier::Embed => 50,
            CostTier::Thinker => 200,
        }
    }

    pub fn estimated_cost_cents(self) -> f64 {
        cost_cents(self, self.default_units())
    }
}

fn cost_cents(tier: CostTier, units: u64) -> f64 {
    tier.rate_cents_per_1k() * units as f64 / 1000.0
}

/// Snapshot returned to clients when adaptive mode is on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetMetrics {
    pub budget_cents_left: f64,
    pub total_cost_cents: f64,
    pub cheap_units: u64,
    pub embed_units: u64,
    pub thinker_units: u64,
    pub can_escalate: bool,
    pub force_cheap_mode: bool,
}

#[derive(Debug, Clone)]
pub struct BudgetManager {
    initial_cents: f64,
    cents_left: f64,
    cheap_units: u64,
    embed_units: u64,
    thinker_units: u64,
}

impl BudgetManager {
    pub fn from_cents(cents: f64) -> Self {
        let cents = cents.max(0.0);
        Self {
            initial_cents: cents,
            cents_left: cents,
            cheap_units: 0,
            embed_units: 0,
            thinker_units: 0,
        }
    }

    pub fn cents_left(&self) -> f64 {
        self.cents_left
    }

    pub fn total_cost_cents(&self) -> f64 {
        self.initial_cents - self.cents_left
    }

    /// Whether the estimated cost of one call at this tier still fits.
    pub fn can_use_tier(&self, tier: CostTier) -> bool {
        self.cents_left >= tier.estimated_cost_cents()
    }

    /// Escalation needs headroom above the reserve, not just the call cost.
    pub fn can_escalate(&self) -> bool {
        self.can_use_tier(CostTier::Thinker) && self.cents_left > ESCALATION_RESERVE_CENTS
    }

    pub fn force_cheap_mode(&self) -> bool {
        self.cents_left < CHEAP_MODE_FLOOR_CENTS
    }

    /// Debits one call. `units` falls back to the tier estimate; the balance
    /// clamps at zero and never goes negative. Returns the cost in cents.
    pub fn record_usage(&mut self, tier: CostTier, units: Option<u64>) -> f64 {
        let units = units.unwrap_or_else(|| tier.default_units());
        let cost = cost_cents(tier, units);
        self.cents_left = (self.cents_left - cost).max(0.0);
        match tier {
            CostTier::Cheap => self.cheap_units += units,
            CostTier::Embed => self.embed_units += units,
            CostTier::Thinker => self.thinker_units += units,
        }
        cost
    }

    pub fn metrics(&self) -> BudgetMetrics {
        BudgetMetrics {
            budget_cents_left: self.cents_left,
            total_cost_cents: self.total_cost_cents(),
            cheap_units: self.cheap_units,
            embed_units: self.embed_units,
            thinker_units: self.thinker_units,
            can_escalate: self.can_escalate(),
            force_cheap_mode: self.force_cheap_mode(),
        }
    }
}

impl Default for BudgetManager {
    fn default() -> Self {
        Self::from_cents(DEFAULT_BUDGET_CENTS)
    }
}
