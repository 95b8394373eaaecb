//! Token and cost accounting with per-run and per-day caps.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{BudgetConfig, ModelRate};
use crate::{Error, Result};

/// One committed usage record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReceipt {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub day: NaiveDate,
}

impl UsageReceipt {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSnapshot {
    pub request_tokens: u64,
    pub daily_tokens: u64,
    pub cost_usd: f64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Ledger {
    request_used: u64,
    daily: HashMap<NaiveDate, u64>,
    entries: Vec<UsageReceipt>,
    cost_usd: f64,
}

/// Accounts model usage for one run.
///
/// Check and commit happen under one lock, so concurrent lanes can never
/// jointly overshoot a cap.
#[derive(Debug)]
pub struct BudgetTracker {
    config: BudgetConfig,
    rates: HashMap<String, ModelRate>,
    ledger: Mutex<Ledger>,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig, rates: HashMap<String, ModelRate>) -> Self {
        Self {
            config,
            rates,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Record usage against today's UTC date.
    pub fn record_usage(&self, model: &str, input_tokens: i64, output_tokens: i64) -> Result<UsageReceipt> {
        self.record_usage_on(Utc::now().date_naive(), model, input_tokens, output_tokens)
    }

    /// Record usage against an explicit calendar day.
    ///
    /// # Errors
    /// `BudgetExhausted` when either projected total would exceed its cap;
    /// nothing is committed in that case.
    pub fn record_usage_on(
        &self,
        day: NaiveDate,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<UsageReceipt> {
        let input = input_tokens.max(0) as u64;
        let output = output_tokens.max(0) as u64;
        let total = input + output;

        let cost_usd = self.cost(model, input, output);
        let mut ledger = self.lock();
        self.check(&ledger, day, total, cost_usd)?;

        let receipt = UsageReceipt {
            model: model.to_string(),
            input_tokens: input,
            output_tokens: output,
            cost_usd,
            day,
        };
        ledger.request_used += total;
        *ledger.daily.entry(day).or_insert(0) += total;
        ledger.cost_usd += receipt.cost_usd;
        ledger.entries.push(receipt.clone());
        Ok(receipt)
    }

    /// Whether `estimated_tokens` more would still fit under both caps today.
    pub fn can_afford(&self, model: &str, estimated_tokens: u64) -> bool {
        self.ensure_affordable(model, estimated_tokens).is_ok()
    }

    /// Like [`can_afford`](Self::can_afford), but reports which cap would break.
    ///
    /// The estimate is priced as input tokens at `model`'s rate when a cost
    /// cap is configured.
    pub fn ensure_affordable(&self, model: &str, estimated_tokens: u64) -> Result<()> {
        let cost_usd = self.cost(model, estimated_tokens, 0);
        let ledger = self.lock();
        self.check(&ledger, Utc::now().date_naive(), estimated_tokens, cost_usd)
    }

    fn check(&self, ledger: &Ledger, day: NaiveDate, requested: u64, cost_usd: f64) -> Result<()> {
        let request_used = ledger.request_used;
        let daily_used = ledger.daily.get(&day).copied().unwrap_or(0);
        if request_used.saturating_add(requested) > self.config.per_request_tokens {
            return Err(Error::BudgetExhausted {
                scope: "per-request".to_string(),
                used: request_used,
                requested,
                cap: self.config.per_request_tokens,
            });
        }
        if daily_used.saturating_add(requested) > self.config.daily_tokens {
            return Err(Error::BudgetExhausted {
                scope: "daily".to_string(),
                used: daily_used,
                requested,
                cap: self.config.daily_tokens,
            });
        }
        if let Some(cap) = self.config.max_cost_usd {
            if ledger.cost_usd + cost_usd > cap {
                return Err(Error::CostCapExceeded {
                    spent: ledger.cost_usd,
                    requested: cost_usd,
                    cap,
                });
            }
        }
        Ok(())
    }

    /// Estimated USD cost; zero for models without a configured rate.
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.rates.get(model) {
            Some(rate) => {
                input_tokens as f64 / 1e6 * rate.input + output_tokens as f64 / 1e6 * rate.output
            }
            None => 0.0,
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let ledger = self.lock();
        let today = Utc::now().date_naive();
        BudgetSnapshot {
            request_tokens: ledger.request_used,
            daily_tokens: ledger.daily.get(&today).copied().unwrap_or(0),
            cost_usd: ledger.cost_usd,
            entries: ledger.entries.len(),
        }
    }

    pub fn daily_used(&self, day: NaiveDate) -> u64 {
        self.lock().daily.get(&day).copied().unwrap_or(0)
    }

    pub fn entries(&self) -> Vec<UsageReceipt> {
        self.lock().entries.clone()
    }

    /// Largest fraction of either cap used so far today.
    pub fn usage_ratio(&self) -> f64 {
        let snap = self.snapshot();
        let ratio = |used: u64, cap: u64| {
            if cap == 0 {
                1.0
            } else {
                used as f64 / cap as f64
            }
        };
        ratio(snap.request_tokens, self.config.per_request_tokens)
            .max(ratio(snap.daily_tokens, self.config.daily_tokens))
    }

    pub fn should_warn(&self) -> bool {
        self.usage_ratio() >= self.config.warn_ratio
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        // Ledger updates never panic mid-way, so a poisoned lock still holds
        // consistent totals.
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }
}
