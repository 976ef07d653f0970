//! End-to-end guard scenarios: request cap and per-agent daily budget.

use std::sync::Arc;

use neura_core::domain::request::{Limits, RequestEnvelope, ENVELOPE_VERSION};
use neura_core::domain::response::ModelTier;
use neura_core::errors::{ApplicationError, ErrorCode};
use neura_core::{CostGuard, ManualClock, ModelPrice, PriceTable};

fn envelope(agent_id: &str, message: &str, limits: Limits) -> RequestEnvelope {
    RequestEnvelope {
        version: ENVELOPE_VERSION.to_string(),
        agent_id: agent_id.to_string(),
        department_id: None,
        user_id: "user-1".to_owned(),
        message: message.to_string(),
        metadata: None,
        limits,
        idempotency_key: "scenario-key-01".to_owned(),
        resume_token: None,
        mode: None,
        allow_tools: None,
        preferred_route: None,
    }
}

#[test]
fn request_cap_scenario() {
    let prices = PriceTable::default().with_price(
        "scenario-model",
        ModelPrice {
            prompt_per_million: 5.0,
            completion_per_million: 15.0,
            tier: ModelTier::Premium,
        },
    );
    let guard = CostGuard::new(prices, Arc::new(ManualClock::default()));
    let limits = Limits { max_completion_tokens: 100, cost_cap_eur: 0.01, ..Limits::default() };

    let generous = envelope("cfo-agent", "short", limits.clone());
    let context = guard.assert_within_caps(&generous, "scenario-model").expect("well under cap");
    assert!(context.estimated_cost_eur < 0.01);

    let stingy = envelope("cfo-agent", "short", Limits { cost_cap_eur: 0.00001, ..limits });
    let error = guard.assert_within_caps(&stingy, "scenario-model").expect_err("cap should trip");
    assert_eq!(error.code(), ErrorCode::CostCapExceeded);

    let interface = ApplicationError::from(error).into_interface("corr-cap");
    assert_eq!(interface.status_code(), 402);
    assert_eq!(interface.payload().error, ErrorCode::CostCapExceeded);
}

#[test]
fn daily_budget_scenario() {
    // Prompt is free; 4000 completion tokens at 100 EUR/M = 0.40 EUR per request.
    let prices = PriceTable::default().with_price(
        "flat-model",
        ModelPrice {
            prompt_per_million: 0.0,
            completion_per_million: 100.0,
            tier: ModelTier::Economy,
        },
    );
    let guard = CostGuard::new(prices, Arc::new(ManualClock::default()))
        .with_daily_budget("agent-x", 1.00);
    let request = envelope(
        "agent-x",
        "forecast next quarter",
        Limits { max_completion_tokens: 4_000, cost_cap_eur: 1.0, ..Limits::default() },
    );

    for _ in 0..2 {
        let context = guard.assert_within_caps(&request, "flat-model").expect("within budget");
        assert!((context.estimated_cost_eur - 0.40).abs() < 1e-9);
        guard.register_actual_spend("agent-x", context.estimated_cost_eur);
    }

    let error = guard.assert_within_caps(&request, "flat-model").expect_err("budget exhausted");
    assert_eq!(error.code(), ErrorCode::DailyBudgetExceeded);
    assert!((guard.spend_today("agent-x") - 0.80).abs() < 1e-9);

    let other_agent = envelope("agent-y", "forecast next quarter", request.limits.clone());
    guard.assert_within_caps(&other_agent, "flat-model").expect("budgets are per agent");
}
