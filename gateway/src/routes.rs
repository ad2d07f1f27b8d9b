// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! HTTP route handlers for the gateway API.
//!
//! | Method | Path | Handler | Description |
//! |--------|------|---------|-------------|
//! | GET | `/health` | [`health`] | Health check endpoint |
//! | GET | `/catalog` | [`get_catalog`] | Databases and tables that can be requested |
//! | GET | `/tunnels` | [`get_tunnels`] | List open tunnels |
//! | DELETE | `/tunnels/{subdomain}` | [`close_tunnel`] | Close a tunnel early |
//! | POST | `/grants` | [`create_grant`] | Approve a request for access |
//! | DELETE | `/grants/{username}` | [`revoke_grant`] | Revoke a principal early |
//!
//! Every database operation runs with the administrative login the gateway
//! was started with.

use std::sync::Arc;
use std::time::Duration;

use crate::application::AppState;
use crate::errors::AppError;
use crate::models::{Catalog, EphemeralCredential, GrantRequest, TunnelInfo};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use validator::Validate;

/// Health check endpoint.
///
/// # Response
///
/// ```json
/// {"status": "ok"}
/// ```
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Lists every database and its base tables.
///
/// Databases without tables are left out.
#[tracing::instrument(skip(state))]
pub async fn get_catalog(State(state): State<Arc<AppState>>) -> Result<Json<Catalog>, AppError> {
    let admin = state.options.admin_credentials();
    let catalog = state.gateway.catalog(&admin).await?;

    Ok(Json(catalog))
}

#[tracing::instrument(skip(state))]
pub async fn get_tunnels(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TunnelInfo>>, AppError> {
    let tunnels = state.gateway.tunnels().list().await;

    Ok(Json(tunnels))
}

/// Closes a tunnel before its deadline; its principal is revoked afterwards.
#[tracing::instrument(skip(state))]
pub async fn close_tunnel(
    State(state): State<Arc<AppState>>,
    Path(subdomain): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state.gateway.close_tunnel(&subdomain).await {
        return Err(AppError::NotFound(format!("No tunnel found for {subdomain}")));
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Approves a request: creates a principal and opens its tunnel.
///
/// # Request Flow
///
/// 1. Validate the incoming [`GrantRequest`]
/// 2. Provision the principal and open its tunnel for `ttl_secs`, or the
///    configured default
/// 3. Return the [`EphemeralCredential`] with status 201
///
/// # Errors
///
/// - [`AppError::ValidationError`] - Request validation failed
/// - [`AppError::DatabaseError`] - The principal could not be provisioned
/// - [`AppError::Unavailable`] - The tunnel port could not be bound
#[tracing::instrument(skip(state, request))]
pub async fn create_grant(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GrantRequest>,
) -> Result<(StatusCode, Json<EphemeralCredential>), AppError> {
    request.validate().map_err(|e| {
        tracing::error!("[gateway] validation failed: {}", e);
        AppError::ValidationError(e.to_string())
    })?;

    let ttl = request
        .ttl_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.options.grant_ttl());

    tracing::debug!(
        "[gateway] approving access to {} databases for {:?}",
        request.permissions.database_count(),
        ttl
    );

    let admin = state.options.admin_credentials();
    let credential = state
        .gateway
        .approve(&admin, &request.permissions, ttl)
        .await?;

    Ok((StatusCode::CREATED, Json(credential)))
}

#[tracing::instrument(skip(state))]
pub async fn revoke_grant(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<StatusCode, AppError> {
    state.gateway.revoke(&username).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    // Integration tests using TestServer are in tests/http_integration.rs

    #[tokio::test]
    async fn test_health_returns_ok() {
        let response = health().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json.as_object().unwrap().len(), 1);
    }
}
