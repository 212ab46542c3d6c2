//! Routing-aware connection acquisition.
//!
//! Keeps one routing table per database and picks servers round-robin per
//! role. Refreshes are single-flight: concurrent callers finding a stale
//! table await one fetch instead of each starting their own. Failed
//! addresses are forgotten; when a role set runs dry the table is refreshed
//! once more, then the resolver-expanded initial address is the last resort
//! before `ServiceUnavailable`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::bolt::message::{AccessMode, Request, Route, Run, Streaming};
use crate::bolt::packstream::Value;
use crate::error::{Error, Result};

use super::super::connection::{SummaryHandler, SummarySlot};
use super::super::cursor::{new_stream_buf, PullHandler, RunHandler};
use super::super::driver::{AddressResolver, ServerAddress};
use super::super::pool::{Pool, PooledConnection};
use super::table::RoutingTable;

/// Key used for sessions that target the default database.
const DEFAULT_DB: &str = "";

pub(crate) struct LoadBalancer {
    pool: Pool,
    initial: ServerAddress,
    resolver: Arc<dyn AddressResolver>,
    routing_context: HashMap<String, Value>,
    tables: RwLock<HashMap<String, RoutingTable>>,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_generation: AtomicU64,
    rr_readers: AtomicUsize,
    rr_writers: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(
        pool: Pool,
        initial: ServerAddress,
        resolver: Arc<dyn AddressResolver>,
        routing_context: HashMap<String, Value>,
    ) -> Self {
        Self {
            pool,
            initial,
            resolver,
            routing_context,
            tables: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            rr_readers: AtomicUsize::new(0),
            rr_writers: AtomicUsize::new(0),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Acquire a connection suitable for `mode` against `database`.
    pub async fn acquire(
        &self,
        database: Option<&str>,
        mode: AccessMode,
        bookmarks: &[String],
    ) -> Result<PooledConnection> {
        let db = database.unwrap_or(DEFAULT_DB);
        let mut refreshed_for_empty_role = false;
        loop {
            let table = self.fresh_table(db, bookmarks).await?;
            if !table.has_role(mode) {
                if refreshed_for_empty_role {
                    return Err(Error::SessionExpired(format!(
                        "no server available for {} access to database {db:?}",
                        match mode {
                            AccessMode::Read => "read",
                            AccessMode::Write => "write",
                        }
                    )));
                }
                refreshed_for_empty_role = true;
                self.expire(db);
                continue;
            }
            let candidates: Vec<ServerAddress> = table.servers(mode).to_vec();

            let counter = match mode {
                AccessMode::Read => &self.rr_readers,
                AccessMode::Write => &self.rr_writers,
            };
            let start = counter.fetch_add(1, Ordering::Relaxed);
            let mut last_err = None;
            for i in 0..candidates.len() {
                let address = &candidates[(start + i) % candidates.len()];
                match self.pool.acquire(address).await {
                    Ok(conn) => return Ok(conn),
                    // A full pool is our problem, not the server's.
                    Err(e @ Error::AcquisitionTimeout(_)) => return Err(e),
                    Err(e) => {
                        warn!(address = %address, error = %e, "removing unreachable server");
                        self.forget(db, address);
                        last_err = Some(e);
                    }
                }
            }
            if refreshed_for_empty_role {
                return Err(Error::ServiceUnavailable(format!(
                    "no routed server reachable for database {db:?}: {}",
                    last_err.map(|e| e.to_string()).unwrap_or_default()
                )));
            }
            refreshed_for_empty_role = true;
            self.expire(db);
        }
    }

    /// Current table for `db`, refreshing single-flight when missing or
    /// expired.
    pub(crate) async fn fresh_table(&self, db: &str, bookmarks: &[String]) -> Result<RoutingTable> {
        if let Some(table) = self.live_table(db) {
            return Ok(table);
        }
        let lock = {
            let mut locks = self.refresh_locks.lock();
            Arc::clone(locks.entry(db.to_string()).or_default())
        };
        let _guard = lock.lock().await;
        // Someone else may have refreshed while this task waited.
        if let Some(table) = self.live_table(db) {
            return Ok(table);
        }
        let table = self.fetch_table(db, bookmarks).await?;
        debug!(
            database = db,
            generation = table.generation,
            readers = table.readers.len(),
            writers = table.writers.len(),
            "routing table refreshed"
        );
        self.tables.write().insert(db.to_string(), table.clone());
        Ok(table)
    }

    fn live_table(&self, db: &str) -> Option<RoutingTable> {
        let tables = self.tables.read();
        tables.get(db).filter(|t| t.is_fresh()).cloned()
    }

    /// Force the next use to refresh.
    fn expire(&self, db: &str) {
        if let Some(table) = self.tables.write().get_mut(db) {
            table.expires_at = Instant::now();
        }
    }

    /// Fetch a new table from the known routers, falling back to the
    /// resolver-expanded initial address.
    async fn fetch_table(&self, db: &str, bookmarks: &[String]) -> Result<RoutingTable> {
        let mut candidates: Vec<ServerAddress> = self
            .tables
            .read()
            .get(db)
            .map(|t| t.routers.clone())
            .unwrap_or_default();
        for fallback in self.resolver.resolve(&self.initial) {
            if !candidates.contains(&fallback) {
                candidates.push(fallback);
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut last_err: Option<Error> = None;
        for address in &candidates {
            match self.pool.acquire(address).await {
                Ok(mut conn) => {
                    match self.table_from(&mut conn, db, generation, bookmarks).await {
                        Ok(table) => return Ok(table),
                        Err(e) => {
                            warn!(router = %address, error = %e, "router refused routing request");
                            last_err = Some(e);
                        }
                    }
                }
                Err(e) => {
                    warn!(router = %address, error = %e, "router unreachable");
                    last_err = Some(e);
                }
            }
        }
        Err(Error::ServiceUnavailable(format!(
            "unable to retrieve a routing table for database {db:?} from any router: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn table_from(
        &self,
        conn: &mut PooledConnection,
        db: &str,
        generation: u64,
        bookmarks: &[String],
    ) -> Result<RoutingTable> {
        let database = (!db.is_empty()).then(|| db.to_string());
        if conn.version().supports_route() {
            let slot = SummarySlot::new();
            conn.enqueue(
                Request::Route(Route {
                    routing_context: self.routing_context.clone(),
                    bookmarks: bookmarks.to_vec(),
                    database,
                    imp_user: None,
                }),
                SummaryHandler::boxed(&slot),
            )?;
            conn.sync().await?;
            let success = slot.take_result()?;
            let rt = success
                .routing_table()
                .ok_or_else(|| Error::Protocol("ROUTE success without rt".to_string()))?;
            RoutingTable::parse(db, generation, rt)
        } else {
            self.table_via_procedure(conn, db, generation, database).await
        }
    }

    /// Pre-4.3 servers expose the table through a procedure call instead of
    /// the ROUTE message.
    async fn table_via_procedure(
        &self,
        conn: &mut PooledConnection,
        db: &str,
        generation: u64,
        database: Option<String>,
    ) -> Result<RoutingTable> {
        let mut parameters = HashMap::new();
        parameters.insert(
            "context".to_string(),
            Value::Map(self.routing_context.clone()),
        );
        let (query, run_db) = if conn.version().supports_qid() {
            parameters.insert("database".to_string(), database.map(Value::from).unwrap_or(Value::Null));
            (
                "CALL dbms.routing.getRoutingTable($context, $database)",
                Some("system".to_string()),
            )
        } else {
            ("CALL dbms.cluster.routing.getRoutingTable($context)", None)
        };

        let buf = new_stream_buf(conn.utc());
        let context = crate::bolt::message::TxContext {
            mode: AccessMode::Read,
            database: run_db,
            ..Default::default()
        };
        conn.enqueue(
            Request::Run(
                Run::new(query)
                    .with_parameters(parameters)
                    .with_context(context),
            ),
            Box::new(RunHandler { buf: buf.clone() }),
        )?;
        conn.enqueue(
            Request::Pull(Streaming::all()),
            Box::new(PullHandler {
                buf: buf.clone(),
                bookmarks: None,
                bookmark_manager: None,
            }),
        )?;
        conn.sync().await?;

        let mut locked = buf.lock();
        if let Some(error) = locked.take_error() {
            return Err(error);
        }
        let record = locked
            .pop_record()
            .ok_or_else(|| Error::Protocol("routing procedure returned no row".to_string()))?;
        let ttl = record.get_int("ttl")?;
        let servers = record
            .get("servers")
            .cloned()
            .ok_or_else(|| Error::Protocol("routing row without servers".to_string()))?;
        let mut rt = HashMap::new();
        rt.insert("ttl".to_string(), Value::Integer(ttl));
        rt.insert("servers".to_string(), user_to_wire(servers)?);
        RoutingTable::parse(db, generation, &rt)
    }

    /// Drop an address from every role of one database's table.
    pub fn forget(&self, db: &str, address: &ServerAddress) {
        if let Some(table) = self.tables.write().get_mut(db) {
            table.forget(address);
        }
    }

    /// React to a classified server error observed against `address`:
    /// leadership changes invalidate the writer, an unavailable database
    /// invalidates the server entirely.
    pub fn handle_routing_error(&self, error: &Error, address: &ServerAddress) {
        let Error::Server(server_error) = error else {
            return;
        };
        let mut tables = self.tables.write();
        for table in tables.values_mut() {
            if server_error.invalidates_server() {
                table.forget(address);
            } else if server_error.invalidates_writer() {
                table.forget_writer(address);
            }
        }
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("initial", &self.initial)
            .field("databases", &self.tables.read().len())
            .finish()
    }
}

/// The routing procedure returns its server list as user values; the table
/// parser wants wire values.
fn user_to_wire(value: super::super::types::Value) -> Result<Value> {
    value.into_wire(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::message::tag;
    use crate::driver::driver::{DirectResolver, DriverConfig};
    use crate::driver::testkit::{Script, TestServer};
    use crate::error::ServerError;

    fn rt_value(routers: &[&str], readers: &[&str], writers: &[&str]) -> Value {
        let entry = |role: &str, addrs: &[&str]| {
            let mut m = HashMap::new();
            m.insert("role".to_string(), role.into());
            m.insert(
                "addresses".to_string(),
                Value::List(addrs.iter().map(|a| (*a).into()).collect()),
            );
            Value::Map(m)
        };
        let mut rt = HashMap::new();
        rt.insert("ttl".to_string(), Value::Integer(300));
        rt.insert(
            "servers".to_string(),
            Value::List(vec![
                entry("ROUTE", routers),
                entry("READ", readers),
                entry("WRITE", writers),
            ]),
        );
        Value::Map(rt)
    }

    fn balancer_for(server: &TestServer) -> LoadBalancer {
        let config = Arc::new(DriverConfig::for_test(server.address.clone()));
        LoadBalancer::new(
            Pool::new(config, None, None),
            server.address.clone(),
            Arc::new(DirectResolver),
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn refresh_is_single_flight_under_concurrency() {
        let script = Script::default();
        let server = TestServer::start(script).await;
        let own = format!("127.0.0.1:{}", server.address.port);
        server
            .script
            .set_routing_table(rt_value(&[&own], &[&own], &[&own]));

        let balancer = Arc::new(balancer_for(&server));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let b = Arc::clone(&balancer);
            tasks.push(tokio::spawn(async move {
                b.fresh_table("", &[]).await.unwrap()
            }));
        }
        let mut generations = Vec::new();
        for task in tasks {
            generations.push(task.await.unwrap().generation);
        }
        // All callers observed the same table from exactly one ROUTE.
        assert!(generations.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(server.script.count_received(tag::ROUTE), 1);
    }

    #[tokio::test]
    async fn acquire_routes_to_a_reader() {
        let server = TestServer::start(Script::default()).await;
        let own = format!("127.0.0.1:{}", server.address.port);
        server
            .script
            .set_routing_table(rt_value(&[&own], &[&own], &[&own]));

        let balancer = balancer_for(&server);
        let conn = balancer
            .acquire(None, AccessMode::Read, &[])
            .await
            .unwrap();
        assert_eq!(conn.address(), &server.address);
    }

    #[tokio::test]
    async fn unreachable_reader_is_forgotten_and_next_tried() {
        let server = TestServer::start(Script::default()).await;
        let own = format!("127.0.0.1:{}", server.address.port);
        // A reader on a port nobody listens on, plus the live one.
        server.script.set_routing_table(rt_value(
            &[&own],
            &["127.0.0.1:1", &own],
            &[&own],
        ));

        let balancer = balancer_for(&server);
        // Try every reader deterministically from the dead one onward.
        for _ in 0..4 {
            let conn = balancer.acquire(None, AccessMode::Read, &[]).await.unwrap();
            drop(conn);
        }
        let dead = ServerAddress::new("127.0.0.1", 1);
        let table = balancer.tables.read().get("").cloned().unwrap();
        assert!(!table.readers.contains(&dead), "dead reader must be forgotten");
    }

    #[tokio::test]
    async fn writer_forgotten_after_not_a_leader() {
        let server = TestServer::start(Script::default()).await;
        let own = format!("127.0.0.1:{}", server.address.port);
        server
            .script
            .set_routing_table(rt_value(&[&own], &[&own], &[&own, "standby:7687"]));

        let balancer = balancer_for(&server);
        balancer.fresh_table("", &[]).await.unwrap();
        let generation_before = balancer.tables.read().get("").unwrap().generation;

        let not_leader = Error::Server(ServerError::new(
            "Neo.ClientError.Cluster.NotALeader",
            "demoted",
        ));
        balancer.handle_routing_error(&not_leader, &server.address);

        let table = balancer.tables.read().get("").cloned().unwrap();
        assert_eq!(table.generation, generation_before, "same table generation");
        assert!(!table.writers.contains(&server.address));
        assert!(table.readers.contains(&server.address), "readers keep the address");

        // DatabaseUnavailable wipes the address from every role.
        let down = Error::Server(ServerError::new(
            "Neo.TransientError.General.DatabaseUnavailable",
            "closing",
        ));
        balancer.handle_routing_error(&down, &server.address);
        let table = balancer.tables.read().get("").cloned().unwrap();
        assert!(!table.readers.contains(&server.address));
        assert!(!table.routers.contains(&server.address));
    }

    #[tokio::test]
    async fn empty_writers_triggers_refresh_then_session_expired() {
        let server = TestServer::start(Script::default()).await;
        let own = format!("127.0.0.1:{}", server.address.port);
        // Table with no writers at all.
        server
            .script
            .set_routing_table(rt_value(&[&own], &[&own], &[]));

        let balancer = balancer_for(&server);
        let err = balancer
            .acquire(None, AccessMode::Write, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionExpired(_)));
        // One initial fetch plus exactly one forced refresh.
        assert_eq!(server.script.count_received(tag::ROUTE), 2);
    }

    #[tokio::test]
    async fn all_routers_down_surfaces_service_unavailable() {
        // Nothing is listening on the initial address.
        let config = Arc::new(DriverConfig::for_test(ServerAddress::new("127.0.0.1", 1)));
        let balancer = LoadBalancer::new(
            Pool::new(config, None, None),
            ServerAddress::new("127.0.0.1", 1),
            Arc::new(DirectResolver),
            HashMap::new(),
        );
        let err = balancer
            .acquire(None, AccessMode::Read, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
    }
}
