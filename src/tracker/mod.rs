//! Token and cost accounting with budget enforcement.
//!
//! Every completed upstream call produces one [`UsageRecord`], appended to an
//! in-memory ledger. Running aggregates (totals, per provider, per model, per
//! caller, per UTC day) are updated in the same short critical section, so
//! spend queries never rescan the ledger for the common periods.
//!
//! Budget admission is reservation based: a request reserves its projected
//! cost before any provider is called, and the reservation is swapped for the
//! real cost when the usage is recorded. Concurrent admissions therefore see
//! each other, and overshoot is bounded by how far real costs exceed their
//! projections.

mod budget;
pub mod period;

pub use budget::{BudgetDenied, BudgetReservation, BudgetStatus};
pub use period::{resolve_period, BudgetPeriod, RangePreset, SpendPeriod};

use period::start_of_month;

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BudgetConfig;
use crate::pricing::{PricingNotFound, PricingTable};
use crate::storage::UsageQueue;

/// What to do when a call has no pricing entry at request time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnpricedPolicy {
    /// Treat the missing entry as a configuration error.
    #[default]
    Refuse,
    /// Account the call at zero cost and log a warning.
    ZeroCost,
}

/// One completed upstream call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub caller: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    /// The caller cancelled after the provider had already billed the call.
    pub cancelled: bool,
}

impl UsageRecord {
    pub fn new(
        provider: &str,
        model: &str,
        caller: &str,
        input_tokens: u32,
        output_tokens: u32,
        cost: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            provider: provider.to_string(),
            model: model.to_string(),
            caller: caller.to_string(),
            input_tokens,
            output_tokens,
            cost,
            cancelled: false,
        }
    }

    pub fn mark_cancelled(mut self) -> Self {
        self.cancelled = true;
        self
    }
}

/// Request, token and cost totals for one slice of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregate {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl Aggregate {
    fn add(&mut self, record: &UsageRecord) {
        self.requests += 1;
        self.input_tokens += record.input_tokens as u64;
        self.output_tokens += record.output_tokens as u64;
        self.cost += record.cost;
    }
}

/// Aggregated usage over a period.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub total: Aggregate,
    pub avg_tokens_per_request: f64,
    pub avg_cost_per_request: f64,
    pub by_provider: BTreeMap<String, Aggregate>,
    pub by_model: BTreeMap<String, Aggregate>,
    pub by_caller: BTreeMap<String, Aggregate>,
}

impl UsageSummary {
    fn add(&mut self, record: &UsageRecord) {
        self.total.add(record);
        self.by_provider
            .entry(record.provider.clone())
            .or_default()
            .add(record);
        self.by_model
            .entry(record.model.clone())
            .or_default()
            .add(record);
        self.by_caller
            .entry(record.caller.clone())
            .or_default()
            .add(record);
    }

    fn finish(mut self) -> Self {
        if self.total.requests > 0 {
            let n = self.total.requests as f64;
            self.avg_tokens_per_request =
                (self.total.input_tokens + self.total.output_tokens) as f64 / n;
            self.avg_cost_per_request = self.total.cost / n;
        }
        self
    }
}

#[derive(Default)]
struct Ledger {
    records: Vec<UsageRecord>,
    all_time: UsageSummary,
    daily_cost: BTreeMap<NaiveDate, f64>,
    reserved: f64,
    in_flight: usize,
}

impl Ledger {
    fn apply(&mut self, record: UsageRecord) {
        self.all_time.add(&record);
        *self
            .daily_cost
            .entry(record.timestamp.date_naive())
            .or_insert(0.0) += record.cost;
        self.records.push(record);
    }

    fn spend(&self, period: SpendPeriod, now: DateTime<Utc>) -> f64 {
        match period {
            SpendPeriod::AllTime => self.all_time.total.cost,
            SpendPeriod::Today => self
                .daily_cost
                .get(&now.date_naive())
                .copied()
                .unwrap_or(0.0),
            SpendPeriod::ThisMonth => {
                let first = start_of_month(now).date_naive();
                self.daily_cost
                    .range(first..=now.date_naive())
                    .map(|(_, cost)| cost)
                    .sum()
            }
            SpendPeriod::Range { .. } => self
                .records
                .iter()
                .filter(|r| period.contains(r.timestamp, now))
                .map(|r| r.cost)
                .sum(),
        }
    }

    fn release(&mut self, amount: f64) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.reserved = if self.in_flight == 0 {
            0.0
        } else {
            (self.reserved - amount).max(0.0)
        };
    }
}

/// Usage ledger, aggregates and budget gate.
pub struct TokenTracker {
    pricing: PricingTable,
    budget: BudgetConfig,
    unpriced: UnpricedPolicy,
    ledger: Mutex<Ledger>,
    sink: Option<UsageQueue>,
}

impl TokenTracker {
    pub fn new(pricing: PricingTable, budget: BudgetConfig, unpriced: UnpricedPolicy) -> Self {
        Self {
            pricing,
            budget,
            unpriced,
            ledger: Mutex::new(Ledger::default()),
            sink: None,
        }
    }

    /// Forward every recorded usage to the persistence queue.
    pub fn with_sink(mut self, sink: UsageQueue) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn budget(&self) -> &BudgetConfig {
        &self.budget
    }

    pub fn unpriced_policy(&self) -> UnpricedPolicy {
        self.unpriced
    }

    /// Exact cost from the pricing table. Ignores the unpriced policy.
    pub fn estimate_cost(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Result<f64, PricingNotFound> {
        self.pricing
            .estimate_cost(provider, model, input_tokens, output_tokens)
    }

    /// Cost to account for a call, applying the unpriced policy.
    pub fn cost_for(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Result<f64, PricingNotFound> {
        match self.estimate_cost(provider, model, input_tokens, output_tokens) {
            Ok(cost) => Ok(cost),
            Err(_) if self.unpriced == UnpricedPolicy::ZeroCost => {
                tracing::warn!(
                    provider = %provider,
                    model = %model,
                    "no pricing entry, accounting call at zero cost"
                );
                Ok(0.0)
            }
            Err(err) => Err(err),
        }
    }

    /// Check that every `(provider, model)` pair can be priced.
    pub fn validate_pricing<'a>(
        &self,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<(), PricingNotFound> {
        if self.unpriced == UnpricedPolicy::ZeroCost {
            return Ok(());
        }
        for (provider, model) in pairs {
            self.pricing.get(provider, model)?;
        }
        Ok(())
    }

    /// Append a usage record and update aggregates.
    pub fn record(&self, record: UsageRecord) {
        self.ledger.lock().apply(record.clone());
        self.after_record(record);
    }

    /// Price a call and record it.
    pub fn record_usage(
        &self,
        provider: &str,
        model: &str,
        caller: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Result<UsageRecord, PricingNotFound> {
        let cost = self.cost_for(provider, model, input_tokens, output_tokens)?;
        let record = UsageRecord::new(provider, model, caller, input_tokens, output_tokens, cost);
        self.record(record.clone());
        Ok(record)
    }

    /// Load historical records (e.g. from storage) without re-persisting them.
    pub fn restore(&self, records: impl IntoIterator<Item = UsageRecord>) -> usize {
        let mut ledger = self.ledger.lock();
        let mut count = 0;
        for record in records {
            ledger.apply(record);
            count += 1;
        }
        count
    }

    fn after_record(&self, record: UsageRecord) {
        tracing::info!(
            provider = %record.provider,
            model = %record.model,
            caller = %record.caller,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cost = record.cost,
            cancelled = record.cancelled,
            "usage recorded"
        );
        if let Some(sink) = &self.sink {
            sink.enqueue(record);
        }
    }

    pub(crate) fn commit_reserved(&self, amount: f64, record: UsageRecord) {
        {
            let mut ledger = self.ledger.lock();
            ledger.release(amount);
            ledger.apply(record.clone());
        }
        self.after_record(record);
    }

    pub(crate) fn release(&self, amount: f64) {
        self.ledger.lock().release(amount);
    }

    pub fn current_spend(&self, period: SpendPeriod) -> f64 {
        self.ledger.lock().spend(period, Utc::now())
    }

    fn decide(&self, ledger: &Ledger, projected: f64) -> Result<(), BudgetDenied> {
        let Some(ceiling) = self.budget.ceiling else {
            return Ok(());
        };
        let spent = ledger.spend(self.budget.period.spend_period(), Utc::now());
        let committed = spent + ledger.reserved;

        if committed >= ceiling || committed + projected > ceiling {
            return Err(BudgetDenied {
                ceiling,
                spent,
                reserved: ledger.reserved,
                projected,
                period: self.budget.period,
            });
        }
        Ok(())
    }

    /// Whether a call projected to cost `projected` would be admitted now.
    /// Does not reserve anything.
    pub fn check_budget(&self, projected: f64) -> Result<(), BudgetDenied> {
        let ledger = self.ledger.lock();
        self.decide(&ledger, projected)
    }

    /// Admit a call and hold its projected cost until it is committed or dropped.
    pub fn reserve(&self, projected: f64) -> Result<BudgetReservation<'_>, BudgetDenied> {
        let mut ledger = self.ledger.lock();
        self.decide(&ledger, projected)?;
        ledger.reserved += projected;
        ledger.in_flight += 1;
        Ok(BudgetReservation::new(self, projected))
    }

    pub fn budget_status(&self) -> BudgetStatus {
        let ledger = self.ledger.lock();
        let spent = ledger.spend(self.budget.period.spend_period(), Utc::now());
        let ceiling = self.budget.ceiling;

        BudgetStatus {
            enabled: ceiling.is_some(),
            period: self.budget.period,
            ceiling,
            spent,
            reserved: ledger.reserved,
            remaining: ceiling.map(|c| (c - spent).max(0.0)),
            percent_used: ceiling
                .filter(|c| *c > 0.0)
                .map(|c| spent / c * 100.0),
            exceeded: ceiling.is_some_and(|c| spent >= c),
        }
    }

    /// Totals and breakdowns for `period`.
    pub fn summary(&self, period: SpendPeriod) -> UsageSummary {
        let ledger = self.ledger.lock();
        if period == SpendPeriod::AllTime {
            return ledger.all_time.clone().finish();
        }
        let now = Utc::now();
        let mut summary = UsageSummary::default();
        for record in ledger.records.iter().filter(|r| period.contains(r.timestamp, now)) {
            summary.add(record);
        }
        summary.finish()
    }

    pub fn record_count(&self) -> usize {
        self.ledger.lock().records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::TokenPrice;
    use chrono::Duration;
    use std::sync::Arc;

    fn pricing() -> PricingTable {
        let mut table = PricingTable::new();
        table.insert("alpha", "gpt-4", TokenPrice::per_token(0.01, 0.02));
        table.insert("beta", "claude", TokenPrice::per_token(0.001, 0.002));
        table
    }

    fn tracker(ceiling: Option<f64>) -> TokenTracker {
        TokenTracker::new(
            pricing(),
            BudgetConfig {
                ceiling,
                period: BudgetPeriod::Daily,
            },
            UnpricedPolicy::Refuse,
        )
    }

    fn spend(tracker: &TokenTracker, cost: f64) {
        tracker.record(UsageRecord::new("alpha", "gpt-4", "seed", 0, 0, cost));
    }

    #[test]
    fn test_estimate_cost_exact() {
        let t = tracker(None);
        assert_eq!(
            t.estimate_cost("alpha", "gpt-4", 100, 50).unwrap(),
            100.0 * 0.01 + 50.0 * 0.02
        );
        assert!(t.estimate_cost("alpha", "unknown", 1, 1).is_err());
    }

    #[test]
    fn test_record_updates_aggregates() {
        let t = tracker(None);
        t.record_usage("alpha", "gpt-4", "team-a", 100, 50).unwrap();
        t.record_usage("beta", "claude", "team-a", 1000, 500).unwrap();
        t.record_usage("beta", "claude", "team-b", 10, 5).unwrap();

        let summary = t.summary(SpendPeriod::AllTime);
        assert_eq!(summary.total.requests, 3);
        assert_eq!(summary.total.input_tokens, 1110);
        assert_eq!(summary.total.output_tokens, 555);
        assert_eq!(summary.by_provider["beta"].requests, 2);
        assert_eq!(summary.by_caller["team-a"].requests, 2);
        assert!((summary.by_model["gpt-4"].cost - 2.0).abs() < 1e-9);
        assert_eq!(summary.avg_tokens_per_request, 1665.0 / 3.0);
        assert_eq!(t.record_count(), 3);

        // Read-after-write
        assert!((t.current_spend(SpendPeriod::Today) - summary.total.cost).abs() < 1e-12);
    }

    #[test]
    fn test_unpriced_policy() {
        let t = tracker(None);
        assert!(t.record_usage("alpha", "mystery", "c", 1, 1).is_err());
        assert_eq!(t.record_count(), 0);

        let lenient = TokenTracker::new(
            pricing(),
            BudgetConfig::default(),
            UnpricedPolicy::ZeroCost,
        );
        let record = lenient.record_usage("alpha", "mystery", "c", 1, 1).unwrap();
        assert_eq!(record.cost, 0.0);
        assert!(lenient
            .validate_pricing([("nobody", "nothing")])
            .is_ok());
        assert!(t.validate_pricing([("alpha", "gpt-4"), ("nobody", "nothing")]).is_err());
    }

    #[test]
    fn test_periods_split_by_day_and_month() {
        let t = tracker(None);
        let now = Utc::now();
        spend(&t, 1.0);

        let mut old = UsageRecord::new("alpha", "gpt-4", "c", 0, 0, 5.0);
        old.timestamp = now - Duration::days(400);
        t.restore([old]);

        assert_eq!(t.current_spend(SpendPeriod::Today), 1.0);
        assert_eq!(t.current_spend(SpendPeriod::ThisMonth), 1.0);
        assert_eq!(t.current_spend(SpendPeriod::AllTime), 6.0);
        assert_eq!(
            t.current_spend(SpendPeriod::Range {
                since: now - Duration::days(401),
                until: now - Duration::days(399),
            }),
            5.0
        );
        assert_eq!(t.summary(SpendPeriod::Today).total.requests, 1);
    }

    #[test]
    fn test_budget_ceiling_scenario() {
        let t = tracker(Some(10.0));
        spend(&t, 9.5);

        let denied = t.check_budget(1.0).unwrap_err();
        assert_eq!(denied.ceiling, 10.0);
        assert_eq!(denied.spent, 9.5);
        assert!((denied.overage() - 0.5).abs() < 1e-9);
        assert!(denied.to_string().contains("daily"));

        assert!(t.check_budget(0.40).is_ok());
    }

    #[test]
    fn test_spend_at_ceiling_refuses_everything() {
        let t = tracker(Some(10.0));
        spend(&t, 10.0);
        assert!(t.check_budget(0.0).is_err());
        assert!(t.budget_status().exceeded);
    }

    #[test]
    fn test_no_ceiling_always_admits() {
        let t = tracker(None);
        spend(&t, 1_000_000.0);
        assert!(t.reserve(1_000.0).is_ok());
        assert!(!t.budget_status().enabled);
    }

    #[test]
    fn test_reservations_are_visible_to_later_checks() {
        let t = tracker(Some(10.0));
        spend(&t, 9.0);

        let first = t.reserve(0.6).unwrap();
        // 9.0 + 0.6 reserved + 0.6 > 10
        assert!(t.reserve(0.6).is_err());
        assert_eq!(t.budget_status().reserved, 0.6);

        drop(first);
        assert_eq!(t.budget_status().reserved, 0.0);
        assert!(t.reserve(0.6).is_ok());
    }

    #[test]
    fn test_commit_swaps_reservation_for_real_cost() {
        let t = tracker(Some(10.0));
        let reservation = t.reserve(2.0).unwrap();
        assert_eq!(reservation.amount(), 2.0);

        reservation.commit(UsageRecord::new("alpha", "gpt-4", "c", 10, 10, 0.3));

        let status = t.budget_status();
        assert_eq!(status.reserved, 0.0);
        assert_eq!(status.spent, 0.3);
        assert!((status.remaining.unwrap() - 9.7).abs() < 1e-9);
        assert_eq!(t.record_count(), 1);
    }

    #[test]
    fn test_concurrent_reservations_respect_ceiling() {
        let t = Arc::new(tracker(Some(10.0)));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let t = t.clone();
                std::thread::spawn(move || {
                    if let Ok(reservation) = t.reserve(1.0) {
                        reservation.commit(UsageRecord::new("alpha", "gpt-4", "c", 0, 0, 1.0));
                        true
                    } else {
                        false
                    }
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 10);
        assert_eq!(t.current_spend(SpendPeriod::Today), 10.0);
    }

    #[test]
    fn test_concurrent_overshoot_bounded_by_underestimate() {
        let t = Arc::new(tracker(Some(10.0)));
        let barrier = Arc::new(std::sync::Barrier::new(50));

        // Every caller projects 1.0 but really spends 1.5. All reservations
        // are held until every caller has asked for one.
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let t = t.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let reservation = t.reserve(1.0).ok();
                    barrier.wait();
                    match reservation {
                        Some(reservation) => {
                            reservation
                                .commit(UsageRecord::new("alpha", "gpt-4", "c", 0, 0, 1.5));
                            true
                        }
                        None => false,
                    }
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 10);
        let spent = t.current_spend(SpendPeriod::Today);
        assert!(spent > 10.0, "real costs above projection overshoot: {}", spent);
        // ceiling + sum over admitted calls of (actual - projected)
        assert!(spent <= 10.0 + admitted as f64 * 0.5 + 1e-9, "spent {}", spent);

        let status = t.budget_status();
        assert!(status.exceeded);
        assert_eq!(status.reserved, 0.0);
        assert!(t.reserve(0.01).is_err());
    }

    #[test]
    fn test_budget_status_percent() {
        let t = tracker(Some(4.0));
        spend(&t, 1.0);
        let status = t.budget_status();
        assert_eq!(status.percent_used, Some(25.0));
        assert_eq!(status.remaining, Some(3.0));
        assert!(!status.exceeded);
    }
}
