// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::io;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
    #[error("tunnel {0} already exists")]
    AlreadyExists(String),
    #[error("unable to listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("failed to connect to admin database {database}: {source:#}")]
    AdminConnection {
        database: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to create principal {username}: {source:#}")]
    CreatePrincipal {
        username: String,
        #[source]
        source: anyhow::Error,
    },
    /// The principal exists and may hold part of the requested scope.
    #[error("failed to grant permissions to {username} in database {database}: {source:#}")]
    Grant {
        username: String,
        database: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to revoke principal {username}: {source:#}")]
    Revoke {
        username: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to list tables of database {database}: {source:#}")]
    Catalog {
        database: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ProvisionError {
    /// Name of the principal left behind by a failed provisioning, if any.
    pub fn created_principal(&self) -> Option<&str> {
        match self {
            Self::Grant { username, .. } => Some(username),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("unknown principal {0}")]
    UnknownPrincipal(String),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("database error")]
    DatabaseError,
    #[error("internal server error")]
    InternalServerError,
    #[error("validation error: {0}")]
    ValidationError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::DatabaseError => (
                StatusCode::BAD_GATEWAY,
                "Database operation failed".to_string(),
            ),
            Self::InternalServerError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error".to_string(),
            ),
            Self::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        let body = Json(json!({"code": status.as_u16(), "message": message}));

        (status, body).into_response()
    }
}

impl From<GatewayError> for AppError {
    fn from(source: GatewayError) -> Self {
        tracing::error!("{:#}", source);
        match source {
            GatewayError::UnknownPrincipal(username) => {
                AppError::NotFound(format!("No grant found for {username}"))
            }
            GatewayError::Tunnel(TunnelError::AlreadyExists(key)) => {
                AppError::Conflict(format!("Tunnel {key} already exists"))
            }
            GatewayError::Tunnel(TunnelError::Bind { port, .. }) => {
                AppError::Unavailable(format!("Unable to open tunnel on port {port}"))
            }
            GatewayError::Provision(_) => AppError::DatabaseError,
        }
    }
}
