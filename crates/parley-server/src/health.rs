//! `/health` endpoint body.

use axum::http::StatusCode;
use parley_broker::{BrokerSnapshot, SessionCounts};
use parley_resilience::{CircuitSnapshot, HealthReport, HealthStatus};
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Status derived by the health monitor.
    pub status: HealthStatus,
    /// Seconds since the broker started.
    pub uptime_secs: u64,
    /// Identified sessions by role plus pending connections.
    pub sessions: SessionCounts,
    /// Pending interactions.
    pub active_interactions: usize,
    /// Messages queued for offline targets.
    pub queued_messages: usize,
    /// Routed requests awaiting a response.
    pub pending_routes: usize,
    /// Circuit state per routing key.
    pub circuits: Vec<CircuitSnapshot>,
    /// Full health report, only with diagnostics enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthReport>,
}

impl HealthResponse {
    /// HTTP status to serve the body with.
    pub fn http_status(&self) -> StatusCode {
        match self.status {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Build a health response from a broker snapshot.
pub fn health_check(snapshot: BrokerSnapshot, detailed: bool) -> HealthResponse {
    HealthResponse {
        status: snapshot.health.status,
        uptime_secs: snapshot.uptime_secs,
        sessions: snapshot.sessions,
        active_interactions: snapshot.active_interactions,
        queued_messages: snapshot.queued_messages,
        pending_routes: snapshot.pending_routes,
        circuits: snapshot.circuits,
        details: detailed.then_some(snapshot.health),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_broker::Broker;
    use parley_core::errors::ParleyError;
    use parley_core::settings::BrokerSettings;
    use parley_resilience::Severity;

    #[tokio::test]
    async fn fresh_broker_is_healthy() {
        let broker = Broker::new(BrokerSettings::default());
        let resp = health_check(broker.snapshot(), false);
        assert_eq!(resp.status, HealthStatus::Healthy);
        assert_eq!(resp.http_status(), StatusCode::OK);
        assert_eq!(resp.sessions.requester, 0);
        assert_eq!(resp.active_interactions, 0);
        assert!(resp.details.is_none());
    }

    #[tokio::test]
    async fn serialization_omits_details_unless_detailed() {
        let broker = Broker::new(BrokerSettings::default());

        let plain = serde_json::to_value(health_check(broker.snapshot(), false)).unwrap();
        assert_eq!(plain["status"], "healthy");
        assert!(plain["uptime_secs"].is_number());
        assert_eq!(plain["sessions"]["responder"], 0);
        assert!(plain["circuits"].is_array());
        assert!(plain.get("details").is_none());

        let detailed = serde_json::to_value(health_check(broker.snapshot(), true)).unwrap();
        assert_eq!(detailed["details"]["logged_errors"], 0);
    }

    #[tokio::test]
    async fn repeated_system_errors_are_unavailable() {
        let broker = Broker::new(BrokerSettings::default());
        for _ in 0..10 {
            broker
                .health()
                .record_error(&ParleyError::system("disk gone"), Severity::Critical);
        }
        let resp = health_check(broker.snapshot(), true);
        assert_eq!(resp.status, HealthStatus::Unhealthy);
        assert_eq!(resp.http_status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
