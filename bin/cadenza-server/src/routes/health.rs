//! Service info and health endpoints.

use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_root, get_health), components(schemas(ServiceInfo, HealthResponse)))]
pub struct HealthApi;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub docs: String,
    pub health: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub version: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_root))
        .route("/api/health", get(get_health))
}

/// Service name and where to find the docs.
#[utoipa::path(
    get,
    path = "/",
    tag = "health",
    responses((status = 200, description = "Service info", body = ServiceInfo))
)]
pub async fn get_root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: "cadenza".to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        docs: "/swagger-ui".to_owned(),
        health: "/api/health".to_owned(),
    })
}

/// Heartbeat endpoint for load balancers and monitors.
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "health",
    responses((status = 200, description = "Server is healthy", body = HealthResponse))
)]
pub async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_owned(),
        message: "cadenza is running".to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn health_reports_healthy_with_version() {
        let Json(body) = get_health().await;
        assert_eq!(body.status, "healthy");
        assert!(!body.version.is_empty());
    }

    #[tokio::test]
    async fn root_points_at_health() {
        let Json(info) = get_root().await;
        assert_eq!(info.health, "/api/health");
    }
}
