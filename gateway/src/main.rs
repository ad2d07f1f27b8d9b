// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use clap::Parser;
use pam_gateway::application::Application;
use pam_gateway::configuration::GatewayOptions;
use pam_gateway::gateway::Gateway;
use pam_gateway::provisioner::{PgConnector, Provisioner};
use pam_gateway::tunnels::TunnelRegistry;
use std::{io::Error, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    println!("[gateway] init");

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        // spans would repeat the handler arguments on every line
        .with_current_span(false)
        .with_ansi(false)
        // the log collector stamps ingestion time
        .without_time()
        .with_target(false)
        .init();

    // get configuration options from flags or environment variables
    let options = GatewayOptions::parse();

    tracing::info!("[gateway] {:?}", &options);

    let provisioner = Provisioner::new(PgConnector::new(&options.db_host, options.db_port));
    let tunnels = Arc::new(TunnelRegistry::new(
        &options.tunnel_bind_host,
        options.upstream_address(),
    ));
    let gateway = Arc::new(Gateway::new(
        provisioner,
        tunnels,
        &options.app_hostname,
        options.admin_credentials(),
    ));

    let application = Application::build(options, gateway).await?;

    application.run_until_stopped().await
}
