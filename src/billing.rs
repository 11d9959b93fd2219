//! Monthly bill derived from the detection log.
//!
//! The bill is recomputed from the store on every request and never cached:
//! `total_bill = base_fee + violation_count * penalty_per_violation`.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::error::MonitorError;
use crate::storage::SharedStore;

pub const DEFAULT_BASE_FEE: f64 = 1350.0;
pub const DEFAULT_PENALTY_PER_VIOLATION: f64 = 50.0;
pub const DEFAULT_CURRENCY: &str = "INR";

#[derive(Clone, Debug, PartialEq)]
pub struct BillingConfig {
    pub base_fee: f64,
    pub penalty_per_violation: f64,
    pub currency: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            base_fee: DEFAULT_BASE_FEE,
            penalty_per_violation: DEFAULT_PENALTY_PER_VIOLATION,
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }
}

impl BillingConfig {
    pub fn validate(&self) -> Result<()> {
        validate_amount("base_fee", self.base_fee)?;
        validate_amount("penalty_per_violation", self.penalty_per_violation)?;
        if self.currency.trim().is_empty() {
            return Err(anyhow!("billing currency must not be empty"));
        }
        Ok(())
    }
}

fn validate_amount(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!("{name} must be a finite, non-negative amount"));
    }
    Ok(())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BillingSnapshot {
    pub base_fee: f64,
    pub violation_count: u64,
    pub penalty_per_violation: f64,
    pub penalty_total: f64,
    pub total_bill: f64,
    pub total_items: u64,
    /// Share of detected items disposed correctly, in percent.
    pub accuracy_rate: f64,
    pub currency: String,
}

impl BillingSnapshot {
    pub fn compute(config: &BillingConfig, violation_count: u64, total_items: u64) -> Self {
        let penalty_total = violation_count as f64 * config.penalty_per_violation;
        Self {
            base_fee: config.base_fee,
            violation_count,
            penalty_per_violation: config.penalty_per_violation,
            penalty_total,
            total_bill: config.base_fee + penalty_total,
            total_items,
            accuracy_rate: accuracy_rate(violation_count, total_items),
            currency: config.currency.clone(),
        }
    }
}

fn accuracy_rate(violation_count: u64, total_items: u64) -> f64 {
    if total_items == 0 {
        return 100.0;
    }
    let correct = total_items.saturating_sub(violation_count) as f64;
    correct / total_items as f64 * 100.0
}

#[derive(Clone)]
pub struct BillingAggregator {
    store: SharedStore,
    config: BillingConfig,
}

impl BillingAggregator {
    pub fn new(store: SharedStore, config: BillingConfig) -> Self {
        Self { store, config }
    }

    pub fn compute_bill(&self) -> Result<BillingSnapshot, MonitorError> {
        self.compute_bill_with(&self.config)
    }

    /// Either count failing aborts the bill.
    pub fn compute_bill_with(&self, config: &BillingConfig) -> Result<BillingSnapshot, MonitorError> {
        let (violation_count, total_items) = self
            .store
            .billing_counts()
            .map_err(MonitorError::BillingUnavailable)?;
        Ok(BillingSnapshot::compute(config, violation_count, total_items))
    }
}
