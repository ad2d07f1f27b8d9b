// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Per-grant TCP tunnels to the database.
//!
//! The [`TunnelRegistry`] owns every open tunnel, keyed by subdomain. Each
//! tunnel is served by one task that owns its listener:
//!
//! ```text
//! CREATED -> LISTENING -> (ACTIVE)* -> CLOSING -> CLOSED
//!    open()     accept loop        deadline / close() / accept error
//! ```
//!
//! # Teardown
//!
//! The session task runs the only teardown path, exactly once, in this order:
//!
//! 1. every client in the set is cancelled (under the client-set lock) and
//!    its handler is awaited, which closes both of its sockets
//! 2. the listener is dropped
//! 3. the registry entry is removed
//!
//! so a lookup never sees a tunnel that is gone from the registry but still
//! listening.
//!
//! # Locking
//!
//! The registry map and each session's client set have their own locks.
//! Neither is held across socket I/O.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auditor::{AuditStats, AuditedStream, WireAuditor};
use crate::errors::TunnelError;
use crate::models::TunnelInfo;

// stand-in deadline for a ttl too large to represent
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

struct ClientHandle {
    peer: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct TunnelSession {
    subdomain: Arc<str>,
    port: u16,
    deadline: Instant,
    expires_at: DateTime<Utc>,
    /// Fired by the deadline, by [`TunnelRegistry::close`] or on shutdown.
    cancel: CancellationToken,
    /// Fired once teardown has finished.
    closed: CancellationToken,
    clients: Mutex<HashMap<u64, ClientHandle>>,
    next_client: AtomicU64,
    stats: Arc<AuditStats>,
}

impl TunnelSession {
    fn new(subdomain: &str, port: u16, ttl: Duration) -> Self {
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            subdomain: Arc::from(subdomain),
            port,
            deadline: Instant::now()
                .checked_add(ttl)
                .unwrap_or_else(|| Instant::now() + FAR_FUTURE),
            expires_at,
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(0),
            stats: Arc::new(AuditStats::default()),
        }
    }

    fn is_expired(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    async fn info(&self) -> TunnelInfo {
        TunnelInfo {
            subdomain: self.subdomain.to_string(),
            port: self.port,
            expires_at: self.expires_at,
            active_clients: self.clients.lock().await.len(),
            queries_audited: self.stats.queries(),
            malformed_frames: self.stats.malformed(),
        }
    }

    async fn remove_client(&self, id: u64) {
        self.clients.lock().await.remove(&id);
    }
}

/// Returned by [`TunnelRegistry::open`].
pub struct TunnelHandle {
    pub info: TunnelInfo,
    closed: CancellationToken,
}

impl TunnelHandle {
    /// Resolves once the tunnel has been torn down.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        self.closed.clone().cancelled_owned()
    }
}

pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<String, Arc<TunnelSession>>>,
    bind_host: String,
    upstream: Arc<str>,
}

impl TunnelRegistry {
    /// Creates an empty registry whose tunnels listen on `bind_host` and
    /// forward to `upstream` (`host:port` of the database).
    pub fn new(bind_host: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            bind_host: bind_host.into(),
            upstream: Arc::from(upstream.into()),
        }
    }

    /// Opens a tunnel for `subdomain` on `port` that closes after `ttl`.
    ///
    /// Port `0` lets the OS pick; the bound port is reported in the handle.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::AlreadyExists`] - `subdomain` already has a tunnel,
    ///   nothing is changed
    /// - [`TunnelError::Bind`] - the port could not be bound, the OS error is
    ///   passed through unchanged
    #[tracing::instrument(skip(self))]
    pub async fn open(
        self: &Arc<Self>,
        subdomain: &str,
        port: u16,
        ttl: Duration,
    ) -> Result<TunnelHandle, TunnelError> {
        if self.tunnels.lock().await.contains_key(subdomain) {
            return Err(TunnelError::AlreadyExists(subdomain.to_string()));
        }

        let listener = TcpListener::bind((self.bind_host.as_str(), port))
            .await
            .map_err(|source| TunnelError::Bind { port, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind { port, source })?
            .port();

        let session = Arc::new(TunnelSession::new(subdomain, port, ttl));
        {
            let mut tunnels = self.tunnels.lock().await;
            // another open may have registered the key while we were binding
            if tunnels.contains_key(subdomain) {
                return Err(TunnelError::AlreadyExists(subdomain.to_string()));
            }
            tunnels.insert(subdomain.to_string(), session.clone());
        }

        tracing::info!(
            "[tunnels] listening on port {} for subdomain {}",
            port,
            subdomain
        );

        let handle = TunnelHandle {
            info: session.info().await,
            closed: session.closed.clone(),
        };

        tokio::spawn(self.clone().serve(session, listener));

        Ok(handle)
    }

    /// Cancels the tunnel for `subdomain` and waits for its teardown.
    ///
    /// Returns `false` if no such tunnel is open.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self, subdomain: &str) -> bool {
        let session = self.tunnels.lock().await.get(subdomain).cloned();

        match session {
            Some(session) => {
                session.cancel.cancel();
                session.closed.cancelled().await;
                true
            }
            None => false,
        }
    }

    /// Closes every tunnel.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<TunnelSession>> =
            self.tunnels.lock().await.values().cloned().collect();

        tracing::info!("[tunnels] shutting down {} tunnels", sessions.len());

        for session in &sessions {
            session.cancel.cancel();
        }
        for session in sessions {
            session.closed.cancelled().await;
        }
    }

    pub async fn get(&self, subdomain: &str) -> Option<TunnelInfo> {
        let session = self.tunnels.lock().await.get(subdomain).cloned()?;
        Some(session.info().await)
    }

    pub async fn list(&self) -> Vec<TunnelInfo> {
        let sessions: Vec<Arc<TunnelSession>> =
            self.tunnels.lock().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        infos
    }

    pub async fn contains(&self, subdomain: &str) -> bool {
        self.tunnels.lock().await.contains_key(subdomain)
    }

    pub async fn len(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Accept loop of one tunnel. Ends in [`Self::teardown`].
    async fn serve(self: Arc<Self>, session: Arc<TunnelSession>, listener: TcpListener) {
        let deadline = tokio::time::sleep_until(session.deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = session.cancel.cancelled() => {
                    tracing::debug!("[tunnels] tunnel {} cancelled", session.subdomain);
                    break;
                }
                _ = &mut deadline => {
                    tracing::info!(
                        "[tunnels] time limit reached, closing tunnel {}",
                        session.subdomain
                    );
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        // the deadline may have passed while accept was pending
                        if session.is_expired() {
                            drop(stream);
                            break;
                        }
                        self.admit(&session, stream, peer).await;
                    }
                    Err(err) => {
                        tracing::debug!(
                            "[tunnels] stopping listener for {}: {}",
                            session.subdomain,
                            err
                        );
                        break;
                    }
                },
            }
        }

        self.teardown(&session, listener).await;
    }

    async fn admit(&self, session: &Arc<TunnelSession>, stream: TcpStream, peer: SocketAddr) {
        let id = session.next_client.fetch_add(1, Ordering::Relaxed);
        let token = session.cancel.child_token();

        tracing::info!(
            "[tunnels] new connection from {} to {}",
            peer.ip(),
            session.subdomain
        );

        // spawn under the lock so the handler cannot remove itself before it is added
        let mut clients = session.clients.lock().await;
        let task = tokio::spawn(serve_client(
            session.clone(),
            self.upstream.clone(),
            id,
            stream,
            peer,
            token.clone(),
        ));
        clients.insert(id, ClientHandle { peer, token, task });
    }

    async fn teardown(&self, session: &Arc<TunnelSession>, listener: TcpListener) {
        session.cancel.cancel();

        let clients: Vec<ClientHandle> = {
            let mut clients = session.clients.lock().await;
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in &clients {
            tracing::debug!("[tunnels] closing connection from {}", client.peer);
            client.token.cancel();
        }
        for client in clients {
            if let Err(err) = client.task.await {
                tracing::warn!("[tunnels] client handler failed: {:?}", err);
            }
        }

        drop(listener);

        {
            let mut tunnels = self.tunnels.lock().await;
            let registered = tunnels
                .get(&*session.subdomain)
                .is_some_and(|current| Arc::ptr_eq(current, session));
            if registered {
                tunnels.remove(&*session.subdomain);
            }
        }

        session.closed.cancel();

        tracing::info!("[tunnels] closed tunnel {}", session.subdomain);
    }
}

/// Proxies one client to the database until either side closes or the
/// tunnel is cancelled.
async fn serve_client(
    session: Arc<TunnelSession>,
    upstream_addr: Arc<str>,
    id: u64,
    mut client: TcpStream,
    peer: SocketAddr,
    token: CancellationToken,
) {
    let dialed = tokio::select! {
        _ = token.cancelled() => None,
        dialed = TcpStream::connect(&*upstream_addr) => match dialed {
            Ok(stream) => Some(stream),
            Err(err) => {
                tracing::warn!("[tunnels] failed to connect to database: {}", err);
                None
            }
        },
    };

    let Some(upstream) = dialed else {
        session.remove_client(id).await;
        drop(client);
        return;
    };

    let auditor = WireAuditor::new(session.subdomain.clone(), peer, session.stats.clone());
    let mut upstream = AuditedStream::new(upstream, auditor);

    let reason = {
        let (mut client_read, mut client_write) = client.split();
        let (mut upstream_read, mut upstream_write) = tokio::io::split(&mut upstream);

        tokio::select! {
            copied = tokio::io::copy(&mut client_read, &mut upstream_write) => match copied {
                Ok(_) => "client closed",
                Err(err) => {
                    tracing::debug!("[tunnels] client {} read error: {}", peer, err);
                    "client error"
                }
            },
            copied = tokio::io::copy(&mut upstream_read, &mut client_write) => match copied {
                Ok(_) => "database closed",
                Err(err) => {
                    tracing::debug!("[tunnels] database read error for {}: {}", peer, err);
                    "database error"
                }
            },
            _ = token.cancelled() => "time limit reached",
        }
    };

    session.remove_client(id).await;
    drop(upstream);
    drop(client);

    tracing::info!(
        "[tunnels] connection from {} closed for subdomain {} ({})",
        peer.ip(),
        session.subdomain,
        reason
    );
}
