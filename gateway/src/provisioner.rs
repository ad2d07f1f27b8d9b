// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Ephemeral principal provisioning.
//!
//! The [`Provisioner`] turns an approved [`PermissionSet`] into a live
//! PostgreSQL role and removes it again.
//!
//! # Lifecycle
//!
//! 1. **Create**: `CREATE ROLE ... LOGIN PASSWORD ... VALID UNTIL ...` on the
//!    maintenance database. The expiry lives in the role itself, so access
//!    lapses even if this process dies before the tunnel deadline fires.
//! 2. **Grant**: one `GRANT` per table, over one connection per database.
//!    The first failure aborts; grants already applied stay in place and the
//!    error reports the principal so the caller can revoke it.
//! 3. **Revoke**: privileges are dropped in every database, then the role.
//!    Revoking a role that does not exist succeeds.
//!
//! Administrative SQL goes through the [`AdminConnector`] seam.
//! [`PgConnector`] is the `tokio-postgres` implementation.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use tokio_postgres::NoTls;

use crate::constants::{ADMIN_CONNECT_TIMEOUT, MAINTENANCE_DATABASE};
use crate::errors::ProvisionError;
use crate::generator::{self, Endpoint};
use crate::models::{AdminCredentials, Catalog, EphemeralCredential};
use crate::permissions::{PermissionSet, TableGrant};

const LIST_DATABASES: &str = "SELECT datname FROM pg_database \
     WHERE datistemplate = false AND datallowconn ORDER BY datname";

const LIST_TABLES: &str = "SELECT CASE WHEN table_schema = 'public' THEN table_name::text \
     ELSE (table_schema || '.' || table_name)::text END \
     FROM information_schema.tables \
     WHERE table_type = 'BASE TABLE' \
     AND table_schema NOT IN ('pg_catalog', 'information_schema') \
     ORDER BY 1";

/// Opens administrative sessions against one database at a time.
pub trait AdminConnector: Send + Sync + 'static {
    type Session: AdminSession;

    fn connect(
        &self,
        admin: &AdminCredentials,
        database: &str,
    ) -> impl Future<Output = anyhow::Result<Self::Session>> + Send;
}

pub trait AdminSession: Send + Sync {
    /// Runs a statement that returns no rows.
    fn execute(&self, statement: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Runs a query and returns its first column as text.
    fn query_column(&self, query: &str) -> impl Future<Output = anyhow::Result<Vec<String>>> + Send;
}

/// Connects to the real database server with `tokio-postgres`.
#[derive(Debug, Clone)]
pub struct PgConnector {
    host: String,
    port: u16,
}

impl PgConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

pub struct PgSession {
    client: tokio_postgres::Client,
}

impl AdminConnector for PgConnector {
    type Session = PgSession;

    async fn connect(
        &self,
        admin: &AdminCredentials,
        database: &str,
    ) -> anyhow::Result<Self::Session> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&admin.user)
            .password(&admin.password)
            .dbname(database)
            .application_name("pam-gateway")
            .connect_timeout(ADMIN_CONNECT_TIMEOUT);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .with_context(|| format!("connecting to {}:{}/{}", self.host, self.port, database))?;

        let database = database.to_string();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::warn!("[provisioner] admin connection to {} failed: {}", database, err);
            }
        });

        Ok(PgSession { client })
    }
}

impl AdminSession for PgSession {
    async fn execute(&self, statement: &str) -> anyhow::Result<()> {
        self.client.batch_execute(statement).await?;
        Ok(())
    }

    async fn query_column(&self, query: &str) -> anyhow::Result<Vec<String>> {
        let rows = self.client.query(query, &[]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(anyhow::Error::from))
            .collect()
    }
}

pub struct Provisioner<C = PgConnector> {
    connector: C,
}

impl<C: AdminConnector> Provisioner<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Creates a principal that expires after `ttl` and grants it `permissions`.
    ///
    /// The returned credential addresses `endpoint`, the tunnel the caller is
    /// about to open, not the database server.
    ///
    /// # Errors
    ///
    /// - [`ProvisionError::AdminConnection`] - the maintenance database is unreachable
    /// - [`ProvisionError::CreatePrincipal`] - the role could not be created (not retried)
    /// - [`ProvisionError::Grant`] - the role exists with partial scope and should be revoked
    #[tracing::instrument(
        skip(self, admin, permissions, endpoint),
        fields(tunnel = %endpoint.label)
    )]
    pub async fn provision(
        &self,
        admin: &AdminCredentials,
        permissions: &PermissionSet,
        ttl: Duration,
        endpoint: &Endpoint,
    ) -> Result<EphemeralCredential, ProvisionError> {
        let session = self.admin_session(admin, MAINTENANCE_DATABASE).await?;

        let username = generator::new_principal_name();
        let password = generator::new_password();

        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| ProvisionError::CreatePrincipal {
                username: username.clone(),
                source: anyhow!("ttl {:?} is out of range", ttl),
            })?;

        session
            .execute(&create_principal_statement(&username, &password, expires_at))
            .await
            .map_err(|source| ProvisionError::CreatePrincipal {
                username: username.clone(),
                source,
            })?;
        drop(session);

        tracing::info!(
            "[provisioner] created principal {} valid until {}",
            username,
            expires_at
        );

        for grants in permissions.plan() {
            let session = self
                .connector
                .connect(admin, &grants.database)
                .await
                .map_err(|source| ProvisionError::Grant {
                    username: username.clone(),
                    database: grants.database.clone(),
                    source,
                })?;

            for table in &grants.tables {
                session
                    .execute(&grant_statement(table, &username))
                    .await
                    .with_context(|| format!("granting on table {}", table.table))
                    .map_err(|source| ProvisionError::Grant {
                        username: username.clone(),
                        database: grants.database.clone(),
                        source,
                    })?;

                tracing::debug!(
                    "[provisioner] granted {} on {}.{} to {}",
                    table.verbs.join(", "),
                    grants.database,
                    table.table,
                    username
                );
            }
        }

        Ok(EphemeralCredential {
            host: endpoint.host.clone(),
            port: endpoint.port,
            username,
            password,
            expires_at: Some(expires_at),
        })
    }

    /// Drops `username` and every privilege it holds. Idempotent.
    #[tracing::instrument(skip(self, admin))]
    pub async fn revoke(
        &self,
        admin: &AdminCredentials,
        username: &str,
    ) -> Result<(), ProvisionError> {
        let revoke_error = |source: anyhow::Error| ProvisionError::Revoke {
            username: username.to_string(),
            source,
        };

        let session = self.admin_session(admin, MAINTENANCE_DATABASE).await?;

        let exists = session
            .query_column(&principal_exists_query(username))
            .await
            .map_err(revoke_error)?;

        if !exists.is_empty() {
            // privileges are per database and block DROP ROLE
            let databases = session
                .query_column(LIST_DATABASES)
                .await
                .map_err(revoke_error)?;

            for database in databases {
                let db_session = self
                    .connector
                    .connect(admin, &database)
                    .await
                    .map_err(revoke_error)?;
                db_session
                    .execute(&drop_owned_statement(username))
                    .await
                    .with_context(|| format!("dropping privileges in {database}"))
                    .map_err(revoke_error)?;
            }
        }

        session
            .execute(&drop_principal_statement(username))
            .await
            .map_err(revoke_error)?;

        tracing::info!("[provisioner] revoked principal {}", username);

        Ok(())
    }

    /// Lists every connectable database with its base tables. Databases
    /// without tables are left out.
    #[tracing::instrument(skip(self, admin))]
    pub async fn list_catalog(&self, admin: &AdminCredentials) -> Result<Catalog, ProvisionError> {
        let session = self.admin_session(admin, MAINTENANCE_DATABASE).await?;
        let databases = session
            .query_column(LIST_DATABASES)
            .await
            .map_err(|source| ProvisionError::Catalog {
                database: MAINTENANCE_DATABASE.to_string(),
                source,
            })?;

        let mut catalog = Catalog::new();
        for database in databases {
            let tables = async {
                let session = self.connector.connect(admin, &database).await?;
                session.query_column(LIST_TABLES).await
            }
            .await
            .map_err(|source| ProvisionError::Catalog {
                database: database.clone(),
                source,
            })?;

            if !tables.is_empty() {
                catalog.insert(database, tables);
            }
        }

        Ok(catalog)
    }

    async fn admin_session(
        &self,
        admin: &AdminCredentials,
        database: &str,
    ) -> Result<C::Session, ProvisionError> {
        self.connector
            .connect(admin, database)
            .await
            .map_err(|source| ProvisionError::AdminConnection {
                database: database.to_string(),
                source,
            })
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes each dot-separated part, so `billing.ledger` stays schema-qualified.
fn quote_table(table: &str) -> String {
    table
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) fn create_principal_statement(
    username: &str,
    password: &str,
    expires_at: DateTime<Utc>,
) -> String {
    format!(
        "CREATE ROLE {} WITH LOGIN PASSWORD {} VALID UNTIL {}",
        quote_ident(username),
        quote_literal(password),
        quote_literal(&expires_at.format("%Y-%m-%d %H:%M:%S+00").to_string())
    )
}

pub(crate) fn grant_statement(grant: &TableGrant, username: &str) -> String {
    format!(
        "GRANT {} ON TABLE {} TO {}",
        grant.verbs.join(", "),
        quote_table(&grant.table),
        quote_ident(username)
    )
}

pub(crate) fn principal_exists_query(username: &str) -> String {
    format!(
        "SELECT rolname::text FROM pg_roles WHERE rolname = {}",
        quote_literal(username)
    )
}

pub(crate) fn drop_owned_statement(username: &str) -> String {
    format!("DROP OWNED BY {}", quote_ident(username))
}

pub(crate) fn drop_principal_statement(username: &str) -> String {
    format!("DROP ROLE IF EXISTS {}", quote_ident(username))
}
