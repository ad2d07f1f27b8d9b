// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Approval and revocation of ephemeral database access.
//!
//! [`Gateway::approve`] is the single entry point the request workflow calls
//! when an operator approves a request:
//!
//! ```text
//! approve -> new endpoint -> provision principal -> open tunnel -> credential
//!                                  |                     |
//!                                  +--- on failure ------+--> revoke principal
//! ```
//!
//! Every issued principal is remembered until its tunnel closes, at which
//! point it is dropped from the database as well. Principals the gateway no
//! longer remembers (a failed teardown revoke, a restart) can still be revoked
//! by name with the gateway's own administrative login.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::constants::PRINCIPAL_PREFIX;
use crate::errors::GatewayError;
use crate::generator;
use crate::models::{AdminCredentials, Catalog, EphemeralCredential};
use crate::permissions::PermissionSet;
use crate::provisioner::{AdminConnector, PgConnector, Provisioner};
use crate::tunnels::TunnelRegistry;

struct IssuedGrant {
    subdomain: String,
    admin: AdminCredentials,
}

pub struct Gateway<C = PgConnector> {
    provisioner: Arc<Provisioner<C>>,
    tunnels: Arc<TunnelRegistry>,
    app_host: String,
    /// Used to revoke principals that are no longer tracked.
    admin: AdminCredentials,
    /// Issued principals by username.
    grants: Arc<Mutex<HashMap<String, IssuedGrant>>>,
}

impl<C: AdminConnector> Gateway<C> {
    pub fn new(
        provisioner: Provisioner<C>,
        tunnels: Arc<TunnelRegistry>,
        app_host: impl Into<String>,
        admin: AdminCredentials,
    ) -> Self {
        Self {
            provisioner: Arc::new(provisioner),
            tunnels,
            app_host: app_host.into(),
            admin,
            grants: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn provisioner(&self) -> &Provisioner<C> {
        &self.provisioner
    }

    pub fn tunnels(&self) -> &Arc<TunnelRegistry> {
        &self.tunnels
    }

    /// Issues a principal scoped to `permissions` and a tunnel to reach the
    /// database with it, both living for `ttl`.
    ///
    /// On failure no tunnel is left open, and a principal that was already
    /// created is revoked before the error is returned. A failed compensating
    /// revoke is logged; the role's own expiry still applies.
    #[tracing::instrument(skip(self, admin, permissions))]
    pub async fn approve(
        &self,
        admin: &AdminCredentials,
        permissions: &PermissionSet,
        ttl: Duration,
    ) -> Result<EphemeralCredential, GatewayError> {
        let endpoint = generator::new_endpoint(&self.app_host);

        let credential = match self
            .provisioner
            .provision(admin, permissions, ttl, &endpoint)
            .await
        {
            Ok(credential) => credential,
            Err(err) => {
                if let Some(username) = err.created_principal() {
                    self.compensate(admin, username).await;
                }
                return Err(err.into());
            }
        };

        self.grants.lock().await.insert(
            credential.username.clone(),
            IssuedGrant {
                subdomain: endpoint.label.clone(),
                admin: admin.clone(),
            },
        );

        let handle = match self.tunnels.open(&endpoint.label, endpoint.port, ttl).await {
            Ok(handle) => handle,
            Err(err) => {
                self.grants.lock().await.remove(&credential.username);
                self.compensate(admin, &credential.username).await;
                return Err(err.into());
            }
        };

        // drop the principal as soon as its tunnel is gone
        let closed = handle.closed();
        let provisioner = self.provisioner.clone();
        let grants = self.grants.clone();
        let username = credential.username.clone();
        tokio::spawn(async move {
            closed.await;
            let issued = grants.lock().await.remove(&username);
            if let Some(issued) = issued {
                match provisioner.revoke(&issued.admin, &username).await {
                    Ok(()) => tracing::info!(
                        "[gateway] tunnel {} closed, revoked {}",
                        issued.subdomain,
                        username
                    ),
                    Err(err) => tracing::error!(
                        "[gateway] tunnel {} closed, failed to revoke {}: {}",
                        issued.subdomain,
                        username,
                        err
                    ),
                }
            }
        });

        tracing::info!(
            "[gateway] access approved, connect to {} on port {} as {}",
            credential.host,
            credential.port,
            credential.username
        );

        Ok(credential)
    }

    /// Drops a principal issued by this gateway before its deadline.
    ///
    /// Tracked principals are dropped with the login they were issued with.
    /// Untracked names are accepted only if they carry the principal prefix
    /// and are dropped with the gateway's own login; dropping one that is
    /// already gone succeeds. The tunnel stays up until its own deadline;
    /// clients simply can no longer authenticate through it.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UnknownPrincipal`] - untracked and not a generated name
    /// - [`GatewayError::Provision`] - the database refused the revocation
    #[tracing::instrument(skip(self))]
    pub async fn revoke(&self, username: &str) -> Result<(), GatewayError> {
        let tracked = self
            .grants
            .lock()
            .await
            .get(username)
            .map(|issued| issued.admin.clone());

        let admin = match tracked {
            Some(admin) => admin,
            None if username.starts_with(PRINCIPAL_PREFIX) => {
                tracing::debug!("[gateway] {} is not tracked, revoking by name", username);
                self.admin.clone()
            }
            None => return Err(GatewayError::UnknownPrincipal(username.to_string())),
        };

        self.provisioner.revoke(&admin, username).await?;

        Ok(())
    }

    /// Closes a tunnel early. Its principal is revoked once teardown completes.
    pub async fn close_tunnel(&self, subdomain: &str) -> bool {
        self.tunnels.close(subdomain).await
    }

    pub async fn catalog(&self, admin: &AdminCredentials) -> Result<Catalog, GatewayError> {
        Ok(self.provisioner.list_catalog(admin).await?)
    }

    async fn compensate(&self, admin: &AdminCredentials, username: &str) {
        tracing::warn!("[gateway] approval failed, revoking {}", username);
        if let Err(err) = self.provisioner.revoke(admin, username).await {
            tracing::error!("[gateway] compensating revoke of {} failed: {}", username, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ProvisionError, TunnelError};
    use crate::testutil::FakeConnector;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn echo_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        addr.to_string()
    }

    async fn gateway(connector: FakeConnector, bind_host: &str) -> Gateway<FakeConnector> {
        let tunnels = Arc::new(TunnelRegistry::new(bind_host, echo_upstream().await));
        Gateway::new(
            Provisioner::new(connector),
            tunnels,
            "pam.example.com",
            admin(),
        )
    }

    fn admin() -> AdminCredentials {
        AdminCredentials::new("postgres", "postgres")
    }

    fn subdomain(credential: &EphemeralCredential) -> String {
        credential.host.split('.').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_approve_issues_credential_and_tunnel() {
        let connector = FakeConnector::default();
        let gateway = gateway(connector.clone(), "127.0.0.1").await;
        let permissions = PermissionSet::new().with("orders", "invoices", "SELECT", true);

        let credential = gateway
            .approve(&admin(), &permissions, Duration::from_secs(30))
            .await
            .unwrap();

        assert!(credential.host.ends_with(".pam.example.com"));
        assert!(connector.has_role(&credential.username));

        let info = gateway.tunnels().get(&subdomain(&credential)).await.unwrap();
        assert_eq!(info.port, credential.port);

        let mut client = TcpStream::connect(("127.0.0.1", credential.port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_grant_failure_revokes_principal() {
        let connector = FakeConnector::default();
        connector.fail_statements_containing("GRANT");
        let gateway = gateway(connector.clone(), "127.0.0.1").await;
        let permissions = PermissionSet::new().with("orders", "invoices", "SELECT", true);

        let err = gateway
            .approve(&admin(), &permissions, Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Provision(ProvisionError::Grant { .. })));
        assert_eq!(connector.statements_starting_with("CREATE ROLE").len(), 1);
        assert_eq!(connector.statements_starting_with("DROP ROLE").len(), 1);
        assert!(gateway.tunnels().is_empty().await);
    }

    #[tokio::test]
    async fn test_bind_failure_revokes_principal() {
        let connector = FakeConnector::default();
        // TEST-NET-1, never assigned to a local interface
        let gateway = gateway(connector.clone(), "192.0.2.1").await;
        let permissions = PermissionSet::new().with("orders", "invoices", "SELECT", true);

        let err = gateway
            .approve(&admin(), &permissions, Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Tunnel(TunnelError::Bind { .. })));
        let created = connector.statements_starting_with("CREATE ROLE");
        assert_eq!(created.len(), 1);
        assert_eq!(connector.statements_starting_with("DROP ROLE").len(), 1);
        assert!(gateway.tunnels().is_empty().await);
    }

    #[tokio::test]
    async fn test_revoke_is_repeatable_while_tracked() {
        let connector = FakeConnector::default();
        let gateway = gateway(connector.clone(), "127.0.0.1").await;
        let permissions = PermissionSet::new().with("orders", "invoices", "SELECT", true);

        let credential = gateway
            .approve(&admin(), &permissions, Duration::from_secs(30))
            .await
            .unwrap();

        gateway.revoke(&credential.username).await.unwrap();
        gateway.revoke(&credential.username).await.unwrap();
        assert!(!connector.has_role(&credential.username));

        // revocation does not touch the tunnel
        assert!(gateway.tunnels().contains(&subdomain(&credential)).await);
    }

    #[tokio::test]
    async fn test_revoke_refuses_foreign_role() {
        let connector = FakeConnector::default();
        let gateway = gateway(connector.clone(), "127.0.0.1").await;

        let err = gateway.revoke("postgres").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownPrincipal(_)));
        assert!(connector.statements_starting_with("DROP ROLE").is_empty());
    }

    #[tokio::test]
    async fn test_revoke_untracked_principal() {
        let connector = FakeConnector::default();
        let gateway = gateway(connector.clone(), "127.0.0.1").await;
        let permissions = PermissionSet::new().with("orders", "invoices", "SELECT", true);
        let endpoint = generator::new_endpoint("pam.example.com");

        let credential = gateway
            .provisioner()
            .provision(&admin(), &permissions, Duration::from_secs(30), &endpoint)
            .await
            .unwrap();

        gateway.revoke(&credential.username).await.unwrap();
        assert!(!connector.has_role(&credential.username));

        // already gone
        gateway.revoke(&credential.username).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_compensation_can_be_revoked_later() {
        let connector = FakeConnector::default();
        connector.fail_statements_containing("GRANT");
        connector.fail_statements_containing("DROP ROLE");
        let gateway = gateway(connector.clone(), "127.0.0.1").await;
        let permissions = PermissionSet::new().with("orders", "invoices", "SELECT", true);

        let err = gateway
            .approve(&admin(), &permissions, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Provision(ProvisionError::Grant { .. })));

        let roles = connector.roles();
        assert_eq!(roles.len(), 1);

        connector.clear_failures();
        gateway.revoke(&roles[0]).await.unwrap();
        assert!(connector.roles().is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_close_revokes_principal() {
        let connector = FakeConnector::default();
        let gateway = gateway(connector.clone(), "127.0.0.1").await;
        let permissions = PermissionSet::new().with("orders", "invoices", "SELECT", true);

        let credential = gateway
            .approve(&admin(), &permissions, Duration::from_millis(200))
            .await
            .unwrap();

        timeout(WAIT, async {
            while connector.has_role(&credential.username) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(!gateway.tunnels().contains(&subdomain(&credential)).await);
        // forgotten, but revoking again still succeeds
        gateway.revoke(&credential.username).await.unwrap();
    }
}
