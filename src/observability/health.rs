//! Health check HTTP server
//!
//! Operational endpoints only: broker connectivity, readiness and the metrics
//! snapshot. Served with warp on `[service].health_port`.

use crate::messaging::ConnectionManager;
use crate::observability::metrics::metrics;
use crate::transport::ConnectionState;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    service_name: String,
    port: u16,
    connection: Arc<ConnectionManager>,
}

impl HealthServer {
    pub fn new(
        service_name: impl Into<String>,
        port: u16,
        connection: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            port,
            connection,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All endpoints as one warp filter
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - overall status with per-component checks
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.health_status();
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    let reply = warp::reply::json(&status);
                    Ok::<_, Infallible>(warp::reply::with_status(reply, code))
                }
            });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /ready - ready once the broker session is up
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let state = ready_server.connection.state();
                let ready = state == ConnectionState::Connected;
                let response = ReadinessResponse {
                    ready,
                    connection: state.as_str().to_string(),
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), code)
            });

        // GET /live - the process answers
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET / - endpoint listing
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: HashMap<&str, &str> = [
                ("/health", "Overall health status with component checks"),
                ("/metrics", "Messaging counters and delivery statistics"),
                ("/ready", "Readiness probe, 200 once the broker session is connected"),
                ("/live", "Liveness probe"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&endpoints)
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
    }

    /// Serve until the task is dropped
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        tracing::info!(port, "Starting health server");
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }

    fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let snapshot = metrics().get_metrics();

        let mut checks = HashMap::new();
        checks.insert("mqtt".to_string(), self.check_mqtt(now));
        checks.insert(
            "inbound".to_string(),
            HealthCheck {
                status: "healthy".to_string(),
                message: Some(format!(
                    "{} received, {} dropped",
                    snapshot.inbound.messages_received, snapshot.inbound.messages_dropped
                )),
                last_check: now,
            },
        );

        let healthy = checks.values().all(|check| check.status == "healthy");
        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            service: self.service_name.clone(),
            client_id: self.connection.options().client_id.clone(),
            uptime_seconds: snapshot.uptime_seconds,
            checks,
        }
    }

    fn check_mqtt(&self, now: u64) -> HealthCheck {
        let state = self.connection.state();
        let (status, message) = match &state {
            ConnectionState::Connected => ("healthy", "Broker connection established".to_string()),
            ConnectionState::Reconnecting(attempt) => {
                ("unhealthy", format!("Reconnecting to broker (attempt {attempt})"))
            }
            ConnectionState::Errored(reason) => ("unhealthy", format!("Broker error: {reason}")),
            other => ("unhealthy", format!("Broker connection {other}")),
        };
        HealthCheck {
            status: status.to_string(),
            message: Some(message),
            last_check: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    service: String,
    client_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    connection: String,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnectBehavior, MockSessionFactory};
    use crate::transport::SessionOptions;

    fn server(factory: MockSessionFactory) -> (Arc<HealthServer>, Arc<ConnectionManager>) {
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(factory),
            SessionOptions::new("mqtt://localhost:1883", "parcela-core-test"),
        ));
        (
            Arc::new(HealthServer::new("parcela", 8080, connection.clone())),
            connection,
        )
    }

    #[tokio::test]
    async fn test_not_ready_without_session() {
        let (server, _) = server(MockSessionFactory::new());

        let response = warp::test::request()
            .method("GET")
            .path("/ready")
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["ready"], false);
        assert_eq!(body["connection"], "disconnected");
    }

    #[tokio::test]
    async fn test_ready_and_healthy_when_connected() {
        let (server, connection) = server(MockSessionFactory::new());
        connection.connect().await.unwrap();

        let ready = warp::test::request()
            .path("/ready")
            .reply(&server.clone().routes())
            .await;
        assert_eq!(ready.status(), StatusCode::OK);

        let health = warp::test::request()
            .path("/health")
            .reply(&server.routes())
            .await;
        assert_eq!(health.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(health.body()).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "parcela");
        assert_eq!(body["checks"]["mqtt"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_degraded_while_connecting() {
        let (server, connection) =
            server(MockSessionFactory::with_behavior(MockConnectBehavior::Stay));
        connection.connect().await.unwrap();

        let health = warp::test::request()
            .path("/health")
            .reply(&server.routes())
            .await;
        assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(health.body()).unwrap();
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_live_and_metrics_endpoints() {
        let (server, _) = server(MockSessionFactory::new());

        let live = warp::test::request()
            .path("/live")
            .reply(&server.clone().routes())
            .await;
        assert_eq!(live.status(), StatusCode::OK);

        let metrics = warp::test::request()
            .path("/metrics")
            .reply(&server.clone().routes())
            .await;
        assert_eq!(metrics.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(metrics.body()).unwrap();
        assert!(body["commands"]["published"].is_u64());

        let root = warp::test::request()
            .path("/")
            .reply(&server.routes())
            .await;
        let body: serde_json::Value = serde_json::from_slice(root.body()).unwrap();
        assert!(body["/ready"].is_string());
    }
}
