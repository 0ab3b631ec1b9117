//! Budget admission: denial reasons, status and in-flight reservations.

use std::fmt;

use serde::Serialize;

use super::{TokenTracker, UsageRecord};
use crate::tracker::period::BudgetPeriod;

/// Admission refused because the projected cost does not fit the ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetDenied {
    pub ceiling: f64,
    pub spent: f64,
    /// Cost reserved by calls still in flight.
    pub reserved: f64,
    pub projected: f64,
    pub period: BudgetPeriod,
}

impl BudgetDenied {
    /// How far the request would take spend past the ceiling.
    pub fn overage(&self) -> f64 {
        (self.spent + self.reserved + self.projected - self.ceiling).max(0.0)
    }
}

impl fmt::Display for BudgetDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Budget exceeded for {} period: spent ${:.4} + reserved ${:.4} + projected ${:.4} \
             exceeds ceiling ${:.4} by ${:.4}",
            self.period,
            self.spent,
            self.reserved,
            self.projected,
            self.ceiling,
            self.overage()
        )
    }
}

impl std::error::Error for BudgetDenied {}

/// Spend against the configured ceiling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub enabled: bool,
    pub period: BudgetPeriod,
    pub ceiling: Option<f64>,
    pub spent: f64,
    pub reserved: f64,
    pub remaining: Option<f64>,
    pub percent_used: Option<f64>,
    pub exceeded: bool,
}

/// Projected cost held against the budget while a call is in flight.
///
/// The reservation is released when it is committed with the real usage,
/// or when it is dropped (failed, cancelled or abandoned call).
#[must_use = "dropping a reservation releases it immediately"]
pub struct BudgetReservation<'a> {
    tracker: &'a TokenTracker,
    amount: f64,
    settled: bool,
}

impl<'a> BudgetReservation<'a> {
    pub(super) fn new(tracker: &'a TokenTracker, amount: f64) -> Self {
        Self {
            tracker,
            amount,
            settled: false,
        }
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Record the real usage and release the reservation atomically.
    pub fn commit(mut self, record: UsageRecord) {
        self.settled = true;
        self.tracker.commit_reserved(self.amount, record);
    }
}

impl Drop for BudgetReservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.release(self.amount);
        }
    }
}
