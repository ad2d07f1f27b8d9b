// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::fmt;
use std::time::Duration;

use clap::Parser;

use crate::constants::DEFAULT_GRANT_TTL;
use crate::models::AdminCredentials;

#[derive(Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct GatewayOptions {
    #[arg(long, default_value = "127.0.0.1", env("PAM_HTTP_HOST"))]
    pub host: String,
    #[arg(long, default_value = "8080", env("PAM_HTTP_PORT"))]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1", env("DB_HOST"))]
    pub db_host: String,
    #[arg(long, default_value = "5432", env("DB_PORT"))]
    pub db_port: u16,
    #[arg(long, default_value = "postgres", env("DB_ADMIN_USER"))]
    pub db_admin_user: String,
    #[arg(long, default_value = "", env("DB_ADMIN_PASSWORD"), hide_env_values = true)]
    pub db_admin_password: String,
    /// Domain under which tunnel hostnames are issued.
    #[arg(long, default_value = "localhost", env("APP_HOSTNAME"))]
    pub app_hostname: String,
    #[arg(long, default_value = "0.0.0.0", env("PAM_TUNNEL_BIND_HOST"))]
    pub tunnel_bind_host: String,
    /// Lifetime of a grant when the request does not name one.
    #[arg(long, default_value = "40", env("PAM_GRANT_TTL_SECS"))]
    pub grant_ttl_secs: u64,
}

impl GatewayOptions {
    pub fn upstream_address(&self) -> String {
        format!("{}:{}", self.db_host, self.db_port)
    }

    pub fn admin_credentials(&self) -> AdminCredentials {
        AdminCredentials::new(&self.db_admin_user, &self.db_admin_password)
    }

    pub fn grant_ttl(&self) -> Duration {
        Duration::from_secs(self.grant_ttl_secs)
    }
}

// the admin password must never reach the startup log
impl fmt::Debug for GatewayOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_admin_user", &self.db_admin_user)
            .field("db_admin_password", &"[REDACTED]")
            .field("app_hostname", &self.app_hostname)
            .field("tunnel_bind_host", &self.tunnel_bind_host)
            .field("grant_ttl_secs", &self.grant_ttl_secs)
            .finish()
    }
}

impl Default for GatewayOptions {
    fn default() -> Self {
        GatewayOptions {
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_host: "127.0.0.1".to_string(),
            db_port: 5432,
            db_admin_user: "postgres".to_string(),
            db_admin_password: String::new(),
            app_hostname: "localhost".to_string(),
            tunnel_bind_host: "127.0.0.1".to_string(),
            grant_ttl_secs: DEFAULT_GRANT_TTL.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let options = GatewayOptions::try_parse_from([
            "pam-gateway",
            "--db-host",
            "db.internal",
            "--db-port",
            "6543",
            "--db-admin-password",
            "s3cret",
            "--app-hostname",
            "pam.example.com",
            "--grant-ttl-secs",
            "300",
        ])
        .unwrap();

        assert_eq!(options.upstream_address(), "db.internal:6543");
        assert_eq!(options.app_hostname, "pam.example.com");
        assert_eq!(options.grant_ttl(), Duration::from_secs(300));
        assert!(!format!("{options:?}").contains("s3cret"));
    }

    #[test]
    fn test_default_grant_ttl() {
        assert_eq!(GatewayOptions::default().grant_ttl(), DEFAULT_GRANT_TTL);
    }
}
