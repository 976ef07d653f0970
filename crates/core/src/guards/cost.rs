//! Pre-flight cost estimation with per-request and per-agent daily caps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::domain::request::RequestEnvelope;
use crate::errors::ErrorCode;
use crate::pricing::{naive_token_estimate, PriceTable};

/// Per-request estimate. Recomputed on every call, never stored.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardContext {
    pub model_id: String,
    pub estimated_prompt_tokens: u64,
    pub estimated_completion_tokens: u64,
    #[serde(rename = "estimatedCostEUR")]
    pub estimated_cost_eur: f64,
    #[serde(rename = "requestCapEUR")]
    pub request_cost_cap: f64,
    #[serde(rename = "dailyCapEUR", skip_serializing_if = "Option::is_none")]
    pub daily_budget_cap: Option<f64>,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum CostGuardError {
    #[error(
        "estimated cost {:.6} EUR exceeds the request cap of {:.6} EUR",
        .context.estimated_cost_eur,
        .context.request_cost_cap
    )]
    CostCapExceeded { context: GuardContext },
    #[error(
        "daily budget for agent `{agent_id}` would be exceeded (spent {spent_eur:.6} EUR today)"
    )]
    DailyBudgetExceeded { agent_id: String, spent_eur: f64, context: GuardContext },
}

impl CostGuardError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CostCapExceeded { .. } => ErrorCode::CostCapExceeded,
            Self::DailyBudgetExceeded { .. } => ErrorCode::DailyBudgetExceeded,
        }
    }

    pub fn context(&self) -> &GuardContext {
        match self {
            Self::CostCapExceeded { context } | Self::DailyBudgetExceeded { context, .. } => {
                context
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct DailySpend {
    day: NaiveDate,
    spend: f64,
}

/// Called with the agent id and the estimate whenever a daily budget rejects a request.
pub type BudgetHitHook = Arc<dyn Fn(&str, &GuardContext) + Send + Sync>;

pub struct CostGuard {
    prices: PriceTable,
    daily_budgets: HashMap<String, f64>,
    clock: Arc<dyn Clock>,
    spend: Mutex<HashMap<String, DailySpend>>,
    on_budget_hit: Option<BudgetHitHook>,
}

impl std::fmt::Debug for CostGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostGuard")
            .field("prices", &self.prices)
            .field("daily_budgets", &self.daily_budgets)
            .field("on_budget_hit", &self.on_budget_hit.is_some())
            .finish_non_exhaustive()
    }
}

impl CostGuard {
    pub fn new(prices: PriceTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            prices,
            daily_budgets: HashMap::new(),
            clock,
            spend: Mutex::new(HashMap::new()),
            on_budget_hit: None,
        }
    }

    pub fn on_budget_hit(mut self, hook: BudgetHitHook) -> Self {
        self.on_budget_hit = Some(hook);
        self
    }

    pub fn with_daily_budget(mut self, agent_id: impl Into<String>, cap_eur: f64) -> Self {
        self.daily_budgets.insert(agent_id.into(), cap_eur);
        self
    }

    pub fn with_daily_budgets(mut self, budgets: HashMap<String, f64>) -> Self {
        self.daily_budgets.extend(budgets);
        self
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    pub fn estimate(&self, request: &RequestEnvelope, model_id: &str) -> GuardContext {
        let limits = &request.limits;
        let estimated_prompt_tokens =
            naive_token_estimate(&request.message).min(limits.max_prompt_tokens);
        let estimated_completion_tokens = limits.max_completion_tokens;
        let estimated_cost_eur = self
            .prices
            .price_for(model_id)
            .cost_eur(estimated_prompt_tokens, estimated_completion_tokens);

        GuardContext {
            model_id: model_id.to_string(),
            estimated_prompt_tokens,
            estimated_completion_tokens,
            estimated_cost_eur,
            request_cost_cap: limits.cost_cap_eur,
            daily_budget_cap: self.daily_budgets.get(&request.agent_id).copied(),
        }
    }

    /// Rejects the request before any downstream work if the estimate breaks
    /// the request cap or the agent's remaining daily budget.
    pub fn assert_within_caps(
        &self,
        request: &RequestEnvelope,
        model_id: &str,
    ) -> Result<GuardContext, CostGuardError> {
        let context = self.estimate(request, model_id);

        if context.estimated_cost_eur > context.request_cost_cap {
            warn!(
                event_name = "guard.cost.rejected",
                agent_id = %request.agent_id,
                model_id,
                estimated_cost_eur = context.estimated_cost_eur,
                cap_eur = context.request_cost_cap,
                "request cost cap exceeded"
            );
            return Err(CostGuardError::CostCapExceeded { context });
        }

        if let Some(daily_cap) = context.daily_budget_cap {
            let spent_eur = self.spend_today(&request.agent_id);
            if spent_eur + context.estimated_cost_eur > daily_cap {
                warn!(
                    event_name = "guard.cost.daily_budget_rejected",
                    agent_id = %request.agent_id,
                    model_id,
                    estimated_cost_eur = context.estimated_cost_eur,
                    spent_eur,
                    daily_cap_eur = daily_cap,
                    "agent daily budget exceeded"
                );
                if let Some(hook) = &self.on_budget_hit {
                    hook(&request.agent_id, &context);
                }
                return Err(CostGuardError::DailyBudgetExceeded {
                    agent_id: request.agent_id.clone(),
                    spent_eur,
                    context,
                });
            }
        }

        debug!(
            event_name = "guard.cost.admitted",
            agent_id = %request.agent_id,
            model_id,
            estimated_cost_eur = context.estimated_cost_eur,
            "cost guard passed"
        );
        Ok(context)
    }

    /// Adds real (not estimated) spend to the agent's total for the current UTC day.
    pub fn register_actual_spend(&self, agent_id: &str, amount_eur: f64) {
        if !amount_eur.is_finite() || amount_eur <= 0.0 {
            return;
        }
        let today = self.clock.today();
        let mut spend = self.spend.lock().unwrap_or_else(PoisonError::into_inner);
        let record =
            spend.entry(agent_id.to_string()).or_insert(DailySpend { day: today, spend: 0.0 });
        if record.day != today {
            *record = DailySpend { day: today, spend: 0.0 };
        }
        record.spend += amount_eur;

        debug!(
            event_name = "guard.cost.spend_registered",
            agent_id,
            amount_eur,
            spent_today_eur = record.spend,
            "registered actual spend"
        );
    }

    /// Spend recorded for `agent_id` on the current UTC day; a stale day reads as zero.
    pub fn spend_today(&self, agent_id: &str) -> f64 {
        let today = self.clock.today();
        let spend = self.spend.lock().unwrap_or_else(PoisonError::into_inner);
        spend
            .get(agent_id)
            .filter(|record| record.day == today)
            .map(|record| record.spend)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::{TimeZone, Utc};

    use super::{CostGuard, CostGuardError, GuardContext};
    use crate::clock::ManualClock;
    use crate::domain::request::fixtures::request;
    use crate::domain::response::ModelTier;
    use crate::errors::ErrorCode;
    use crate::pricing::{ModelPrice, PriceTable};

    fn flat_table() -> PriceTable {
        PriceTable::empty(ModelPrice {
            prompt_per_million: 0.0,
            completion_per_million: 100.0,
            tier: ModelTier::Economy,
        })
    }

    #[test]
    fn estimate_clamps_prompt_tokens_to_limit() {
        let guard = CostGuard::new(PriceTable::default(), Arc::new(ManualClock::default()));
        let mut req = request("cfo-agent", &"word ".repeat(500));
        req.limits.max_prompt_tokens = 10;

        let context = guard.estimate(&req, "gpt-4o-mini");

        assert_eq!(context.estimated_prompt_tokens, 10);
        assert_eq!(context.estimated_completion_tokens, req.limits.max_completion_tokens);
        assert_eq!(context.model_id, "gpt-4o-mini");
        assert_eq!(context.daily_budget_cap, None);
    }

    #[test]
    fn estimate_is_deterministic() {
        let guard = CostGuard::new(PriceTable::default(), Arc::new(ManualClock::default()));
        let req = request("cfo-agent", "summarise the quarterly cash position");

        assert_eq!(guard.estimate(&req, "gpt-4o"), guard.estimate(&req, "gpt-4o"));
    }

    #[test]
    fn rejects_estimate_above_request_cap() {
        let guard = CostGuard::new(flat_table(), Arc::new(ManualClock::default()));
        let mut req = request("cfo-agent", "hello");
        // 4000 completion tokens at 100 EUR/M = 0.40 EUR
        req.limits.cost_cap_eur = 0.39;

        let error = guard.assert_within_caps(&req, "any").expect_err("cap should trip");

        assert_eq!(error.code(), ErrorCode::CostCapExceeded);
        assert!((error.context().estimated_cost_eur - 0.40).abs() < 1e-9);
    }

    #[test]
    fn daily_budget_resets_on_day_rollover() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 23, 0, 0).unwrap());
        let guard = CostGuard::new(flat_table(), Arc::new(clock.clone()))
            .with_daily_budget("cfo-agent", 0.5);
        let mut req = request("cfo-agent", "hello");
        req.limits.cost_cap_eur = 1.0;

        guard.assert_within_caps(&req, "any").expect("first request fits");
        guard.register_actual_spend("cfo-agent", 0.40);
        assert!(matches!(
            guard.assert_within_caps(&req, "any"),
            Err(CostGuardError::DailyBudgetExceeded { .. })
        ));

        clock.advance_ms(2 * 60 * 60 * 1000);

        assert_eq!(guard.spend_today("cfo-agent"), 0.0);
        guard.assert_within_caps(&req, "any").expect("new day has a fresh budget");
    }

    #[test]
    fn budget_hit_hook_sees_the_rejected_estimate() {
        let hits: Arc<Mutex<Vec<(String, f64)>>> = Arc::default();
        let recorded = hits.clone();
        let guard = CostGuard::new(flat_table(), Arc::new(ManualClock::default()))
            .with_daily_budget("cfo-agent", 0.5)
            .on_budget_hit(Arc::new(move |agent_id: &str, context: &GuardContext| {
                recorded.lock().unwrap().push((agent_id.to_owned(), context.estimated_cost_eur));
            }));
        let mut req = request("cfo-agent", "hello");
        req.limits.cost_cap_eur = 1.0;

        guard.assert_within_caps(&req, "any").expect("first request fits");
        assert!(hits.lock().unwrap().is_empty());

        guard.register_actual_spend("cfo-agent", 0.40);
        guard.assert_within_caps(&req, "any").expect_err("budget exhausted");
        req.limits.cost_cap_eur = 0.1;
        guard.assert_within_caps(&req, "any").expect_err("request cap, not the budget");

        let hits = hits.lock().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "cfo-agent");
        assert!((hits[0].1 - 0.40).abs() < 1e-9);
    }

    #[test]
    fn budgets_are_tracked_per_agent() {
        let guard = CostGuard::new(flat_table(), Arc::new(ManualClock::default()))
            .with_daily_budget("cfo-agent", 0.5)
            .with_daily_budget("ops-agent", 0.5);

        guard.register_actual_spend("cfo-agent", 0.45);
        guard.register_actual_spend("cfo-agent", f64::NAN);

        assert!((guard.spend_today("cfo-agent") - 0.45).abs() < 1e-9);
        assert_eq!(guard.spend_today("ops-agent"), 0.0);
    }
}
