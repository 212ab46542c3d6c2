//! Bounded per-address connection pool.
//!
//! Each server address gets an idle FIFO plus a fair semaphore whose permits
//! bound `idle + in_use` to the configured maximum; waiters therefore wake
//! in FIFO order. Idle connections are discarded when they exceed the
//! maximum lifetime or idle timeout, probed with RESET when older than the
//! liveness threshold, and re-authenticated in place after a token rotation.
//! A connection that still carries protocol state when released is reset in
//! the background before rejoining the idle list; pool bookkeeping itself
//! never performs I/O under a lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::bolt::packstream::Value;
use crate::error::{Error, Result};

use super::connection::{ConnectOptions, Connection};
use super::driver::{AuthToken, AuthTokenManager, DriverConfig, ServerAddress};
use super::tls::TlsClient;

/// Pool occupancy and lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub idle: usize,
    pub in_use: usize,
    pub total_created: u64,
    pub total_closed: u64,
    pub total_acquired: u64,
}

struct AuthState {
    generation: u64,
    token: AuthToken,
}

/// Sub-pool for one server address.
struct ServerPool {
    idle: Mutex<VecDeque<Connection>>,
    /// Bounds idle + in-use; tokio semaphores wake waiters FIFO.
    semaphore: Arc<Semaphore>,
    in_use: AtomicUsize,
}

struct PoolInner {
    config: Arc<DriverConfig>,
    tls: Option<Arc<TlsClient>>,
    routing_context: Option<HashMap<String, Value>>,
    servers: Mutex<HashMap<ServerAddress, Arc<ServerPool>>>,
    auth: RwLock<AuthState>,
    auth_manager: Option<Arc<dyn AuthTokenManager>>,
    closed: AtomicBool,
    total_created: AtomicU64,
    total_closed: AtomicU64,
    total_acquired: AtomicU64,
}

/// The connection pool, cheap to clone and share.
#[derive(Clone)]
pub(crate) struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub(crate) fn new(
        config: Arc<DriverConfig>,
        tls: Option<Arc<TlsClient>>,
        routing_context: Option<HashMap<String, Value>>,
    ) -> Self {
        let token = config.auth.clone();
        let auth_manager = config.auth_manager.clone();
        Self {
            inner: Arc::new(PoolInner {
                config,
                tls,
                routing_context,
                servers: Mutex::new(HashMap::new()),
                auth: RwLock::new(AuthState {
                    generation: 0,
                    token,
                }),
                auth_manager,
                closed: AtomicBool::new(false),
                total_created: AtomicU64::new(0),
                total_closed: AtomicU64::new(0),
                total_acquired: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a connection to `address`, reusing an idle one when possible.
    pub(crate) async fn acquire(&self, address: &ServerAddress) -> Result<PooledConnection> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Client("the driver is closed".to_string()));
        }
        let server = inner.server(address);
        let acquisition_timeout = inner.config.connection_acquisition_timeout;
        let permit = match tokio::time::timeout(
            acquisition_timeout,
            Arc::clone(&server.semaphore).acquire_owned(),
        )
        .await
        {
            Err(_) => return Err(Error::AcquisitionTimeout(acquisition_timeout)),
            Ok(Err(_)) => return Err(Error::Client("the driver is closed".to_string())),
            Ok(Ok(permit)) => permit,
        };
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Client("the driver is closed".to_string()));
        }

        // Idle connections first, discarding the stale and probing the old.
        // The idle lock is released before any probe I/O happens.
        loop {
            let candidate = server.idle.lock().pop_front();
            let Some(mut conn) = candidate else {
                break;
            };
            if conn.age() >= inner.config.max_connection_lifetime {
                inner.discard(conn, "past max lifetime");
                continue;
            }
            if let Some(idle_timeout) = inner.config.connection_idle_timeout {
                if conn.idle_for() >= idle_timeout {
                    inner.discard(conn, "idle timeout");
                    continue;
                }
            }
            let (generation, auth_map) = inner.auth_snapshot();
            if conn.auth_generation() != generation {
                let refreshed = conn.version().supports_logon()
                    && match conn.reauthenticate(auth_map, generation).await {
                        Ok(()) => true,
                        Err(e) => {
                            inner.note_auth_failure(&e);
                            false
                        }
                    };
                if !refreshed {
                    inner.discard(conn, "stale auth token");
                    continue;
                }
            }
            if let Some(threshold) = inner.config.connection_liveness_threshold {
                if conn.idle_for() >= threshold && conn.reset().await.is_err() {
                    inner.discard(conn, "failed liveness probe");
                    continue;
                }
            }
            conn.touch();
            return Ok(self.lease(conn, server, permit));
        }

        // Nothing idle: dial a fresh connection while holding the permit.
        let conn = match Connection::open(address, inner.connect_options()).await {
            Ok(conn) => conn,
            Err(e) => {
                inner.note_auth_failure(&e);
                return Err(e);
            }
        };
        inner.total_created.fetch_add(1, Ordering::Relaxed);
        Ok(self.lease(conn, server, permit))
    }

    fn lease(
        &self,
        conn: Connection,
        server: Arc<ServerPool>,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        server.in_use.fetch_add(1, Ordering::Relaxed);
        self.inner.total_acquired.fetch_add(1, Ordering::Relaxed);
        PooledConnection {
            conn: Some(conn),
            server,
            pool: Arc::clone(&self.inner),
            permit: Some(permit),
        }
    }

    /// Swap the auth token; existing idle connections re-authenticate (5.1+)
    /// or are discarded on their next acquisition.
    pub(crate) fn update_auth(&self, token: AuthToken) {
        let mut auth = self.inner.auth.write();
        auth.generation += 1;
        auth.token = token;
    }

    /// Stop handing out connections and close the idle ones; leased
    /// connections close as they come back.
    pub(crate) async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let servers: Vec<Arc<ServerPool>> =
            self.inner.servers.lock().values().cloned().collect();
        for server in servers {
            server.semaphore.close();
            let drained: Vec<Connection> = {
                let mut idle = server.idle.lock();
                idle.drain(..).collect()
            };
            for conn in drained {
                self.inner.total_closed.fetch_add(1, Ordering::Relaxed);
                conn.close().await;
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn metrics(&self) -> PoolMetrics {
        let servers: Vec<Arc<ServerPool>> =
            self.inner.servers.lock().values().cloned().collect();
        let mut metrics = PoolMetrics {
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            total_closed: self.inner.total_closed.load(Ordering::Relaxed),
            total_acquired: self.inner.total_acquired.load(Ordering::Relaxed),
            ..PoolMetrics::default()
        };
        for server in servers {
            metrics.idle += server.idle.lock().len();
            metrics.in_use += server.in_use.load(Ordering::Relaxed);
        }
        metrics
    }
}

impl PoolInner {
    fn server(&self, address: &ServerAddress) -> Arc<ServerPool> {
        let mut servers = self.servers.lock();
        Arc::clone(servers.entry(address.clone()).or_insert_with(|| {
            Arc::new(ServerPool {
                idle: Mutex::new(VecDeque::new()),
                semaphore: Arc::new(Semaphore::new(self.config.max_connection_pool_size)),
                in_use: AtomicUsize::new(0),
            })
        }))
    }

    /// Current token and its generation. With a manager configured the
    /// token is pulled fresh and a change bumps the generation, which makes
    /// idle connections re-authenticate on their next acquisition.
    fn auth_snapshot(&self) -> (u64, HashMap<String, Value>) {
        if let Some(ref manager) = self.auth_manager {
            let fresh = manager.get_token();
            let mut auth = self.auth.write();
            if auth.token != fresh {
                auth.generation += 1;
                auth.token = fresh;
            }
            return (auth.generation, auth.token.to_map());
        }
        let auth = self.auth.read();
        (auth.generation, auth.token.to_map())
    }

    /// Tell the manager its token was rejected, so the next `get_token`
    /// returns a usable one.
    fn note_auth_failure(&self, error: &Error) {
        let Some(ref manager) = self.auth_manager else {
            return;
        };
        if let Error::Server(server_error) = error {
            if server_error.invalidates_token() {
                manager.on_token_expired(&self.auth.read().token);
            }
        }
    }

    fn connect_options(&self) -> ConnectOptions {
        let (generation, auth_map) = self.auth_snapshot();
        ConnectOptions {
            user_agent: self.config.user_agent.clone(),
            auth: auth_map,
            auth_generation: generation,
            routing_context: self.routing_context.clone(),
            connect_timeout: self.config.connection_timeout,
            keep_alive: self.config.socket_keep_alive,
            ipv6_enabled: self.config.ipv6_enabled,
            tls: self.tls.clone(),
        }
    }

    fn discard(&self, conn: Connection, reason: &str) {
        debug!(
            address = %conn.address(),
            state = ?conn.state(),
            reason,
            "discarding pooled connection"
        );
        self.total_closed.fetch_add(1, Ordering::Relaxed);
        spawn_close(conn);
    }

    fn release_idle(self: &Arc<Self>, server: &Arc<ServerPool>, mut conn: Connection) {
        let mut idle = server.idle.lock();
        if idle.len() >= self.config.max_idle_connection_pool_size {
            drop(idle);
            self.discard(conn, "idle list full");
            return;
        }
        conn.touch();
        idle.push_back(conn);
    }
}

/// Best-effort GOODBYE; outside a runtime the socket just drops.
fn spawn_close(conn: Connection) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(conn.close());
    }
}

/// An exclusive lease on one pooled connection. Dropping it returns the
/// connection: broken ones are closed (their freed slot wakes one waiter to
/// dial anew), dirty ones are reset in the background first, clean ones go
/// straight to the idle FIFO.
pub(crate) struct PooledConnection {
    conn: Option<Connection>,
    server: Arc<ServerPool>,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish()
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let permit = self.permit.take();
        let pool = Arc::clone(&self.pool);
        let server = Arc::clone(&self.server);
        server.in_use.fetch_sub(1, Ordering::Relaxed);

        if pool.closed.load(Ordering::SeqCst) || conn.is_broken() {
            pool.total_closed.fetch_add(1, Ordering::Relaxed);
            spawn_close(conn);
            drop(permit);
            return;
        }

        if conn.needs_reset() {
            // The lease was dropped mid-stream or mid-transaction. Drain the
            // pipeline with RESET off the caller's path, then pool or close.
            // The permit travels along so the slot frees only once the
            // connection is truly idle or gone.
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        match conn.reset().await {
                            Ok(()) => pool.release_idle(&server, conn),
                            Err(e) => {
                                warn!(error = %e, "reset on release failed; closing connection");
                                pool.total_closed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        drop(permit);
                    });
                }
                Err(_) => {
                    pool.total_closed.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                }
            }
            return;
        }

        pool.release_idle(&server, conn);
        drop(permit);
    }
}
