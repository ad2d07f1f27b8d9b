// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use crate::configuration::GatewayOptions;
use crate::constants::MAX_REQUEST_BODY_SIZE;
use crate::gateway::Gateway;
use crate::routes;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::serve::Serve;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct AppState {
    pub options: GatewayOptions,
    pub gateway: Arc<Gateway>,
}

pub struct Application {
    port: u16,
    gateway: Arc<Gateway>,
    server: Serve<TcpListener, Router, Router>,
}

impl Application {
    pub async fn build(
        options: GatewayOptions,
        gateway: Arc<Gateway>,
    ) -> Result<Self, std::io::Error> {
        let address = format!("{}:{}", options.host, options.port);
        let listener = TcpListener::bind(address).await?;
        let server = run(listener, options.clone(), gateway.clone())?;
        let port = server.local_addr()?.port();

        tracing::info!("[gateway] listening at http://{}:{}", options.host, port);

        Ok(Self {
            port,
            gateway,
            server,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serves until ctrl-c, then closes every open tunnel.
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("[gateway] shutdown requested");
            })
            .await?;

        self.gateway.tunnels().shutdown().await;

        Ok(())
    }
}

pub fn create_router(options: GatewayOptions, gateway: Arc<Gateway>) -> Router {
    let state = Arc::new(AppState { options, gateway });

    Router::new()
        .route("/health", get(routes::health))
        .route("/catalog", get(routes::get_catalog))
        .route("/tunnels", get(routes::get_tunnels))
        .route("/tunnels/{subdomain}", delete(routes::close_tunnel))
        .route("/grants", post(routes::create_grant))
        .route("/grants/{username}", delete(routes::revoke_grant))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_SIZE))
        .with_state(state)
}

#[tracing::instrument(skip(listener, gateway))]
pub fn run(
    listener: TcpListener,
    options: GatewayOptions,
    gateway: Arc<Gateway>,
) -> Result<Serve<TcpListener, Router, Router>, std::io::Error> {
    let app = create_router(options, gateway);
    Ok(axum::serve(listener, app))
}
