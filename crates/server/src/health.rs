use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use neura_actions::BreakerSnapshot;
use neura_core::domain::response::BreakerState;
use serde::Serialize;

use crate::gateway::Gateway;

#[derive(Clone)]
pub struct HealthState {
    pub gateway: Arc<Gateway>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: &'static str,
    pub detail: String,
}

impl HealthCheck {
    fn for_breaker(breaker: &BreakerSnapshot) -> Self {
        let detail = match (breaker.state, breaker.opened_at) {
            (BreakerState::Open, Some(opened_at)) => {
                format!("rejecting calls since {}", opened_at.to_rfc3339())
            }
            (BreakerState::HalfOpen, _) => "cooldown elapsed; next call is a trial".to_owned(),
            _ => format!("{} consecutive failure(s)", breaker.failures),
        };
        Self { name: breaker.target.clone(), status: breaker.state.as_str(), detail }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub checks: Vec<HealthCheck>,
    pub breakers: Vec<BreakerSnapshot>,
    pub checked_at: String,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { gateway })
}

/// Degraded while any downstream breaker is open.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let breakers = state.gateway.breakers();
    let open: Vec<&str> = breakers
        .iter()
        .filter(|breaker| breaker.state == BreakerState::Open)
        .map(|breaker| breaker.target.as_str())
        .collect();
    let ready = open.is_empty();
    let status = if ready { "ready" } else { "degraded" };

    let service = HealthCheck {
        name: "gateway".to_owned(),
        status,
        detail: if ready {
            format!("{} downstream target(s) accepting calls", breakers.len())
        } else {
            format!("circuit open for {}", open.join(", "))
        },
    };
    let payload = HealthResponse {
        status,
        service,
        checks: breakers.iter().map(HealthCheck::for_breaker).collect(),
        breakers,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};
    use neura_core::domain::response::BreakerState;
    use neura_core::ManualClock;

    use crate::gateway::ActionTarget;
    use crate::health::{health, HealthState};
    use crate::test_support::{gateway, request, unavailable, ScriptedTransport};

    #[tokio::test]
    async fn health_returns_ready_when_every_breaker_is_closed() {
        let clock = ManualClock::default();
        let gateway = Arc::new(gateway(Arc::new(ScriptedTransport::default()), &clock));

        let (status, Json(payload)) = health(State(HealthState { gateway })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.service.status, "ready");
        assert_eq!(payload.breakers.len(), 4);
        assert!(payload.breakers.iter().all(|breaker| breaker.state == BreakerState::Closed));
        assert_eq!(payload.checks.len(), 4);
        assert!(payload.checks.iter().all(|check| check.status == "closed"));
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_while_a_breaker_is_open() {
        let clock = ManualClock::default();
        let transport =
            Arc::new(ScriptedTransport::with_script(vec![Err(unavailable()), Err(unavailable())]));
        let gateway = Arc::new(gateway(transport, &clock));
        let target = ActionTarget::Finance { symbol: "ACME".to_owned() };
        for key in ["health-key-1", "health-key-2"] {
            let admission = gateway.admit(request("ops-agent", key, "q"), target.clone());
            assert!(gateway.execute(admission.expect("admitted")).await.is_err());
        }

        let (status, Json(payload)) =
            health(State(HealthState { gateway: gateway.clone() })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.service.status, "degraded");
        assert!(payload.service.detail.contains("finance"));
        let finance = payload.checks.iter().find(|check| check.name == "finance").expect("check");
        assert_eq!(finance.status, "open");
        assert!(finance.detail.starts_with("rejecting calls since"));
        assert!(payload
            .checks
            .iter()
            .filter(|check| check.name != "finance")
            .all(|check| check.status == "closed"));

        clock.advance_ms(61_000);
        let (status, Json(payload)) = health(State(HealthState { gateway })).await;
        assert_eq!(status, StatusCode::OK, "half-open breakers accept a trial call");
        let finance = payload.checks.iter().find(|check| check.name == "finance").expect("check");
        assert_eq!(finance.status, "half-open");
    }
}
