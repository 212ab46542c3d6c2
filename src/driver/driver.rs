//! Driver entry point and configuration.
//!
//! A [`Driver`] owns the connection pool (and, for `neo4j://` URIs, the
//! routing layer) and mints [`Session`]s. Configuration is immutable after
//! construction; every knob has a documented default.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::bolt::message::{AccessMode, NotificationsConfig};
use crate::bolt::packstream::Value as WireValue;
use crate::error::{Error, Result};

use super::cursor::ResultSummary;
use super::pool::{Pool, PoolMetrics, PooledConnection};
use super::record::Record;
use super::routing::LoadBalancer;
use super::session::{Query, Session, SessionConfig};
use super::tls::TlsClient;

/// Conformance feature tags this driver implements.
pub const FEATURES: &[&str] = &[
    "Feature:Bolt:3.0",
    "Feature:Bolt:4.1",
    "Feature:Bolt:4.2",
    "Feature:Bolt:4.3",
    "Feature:Bolt:4.4",
    "Feature:Bolt:5.0",
    "Feature:Bolt:5.1",
    "Feature:Bolt:5.2",
    "Feature:Bolt:5.3",
    "Feature:Bolt:5.4",
    "Feature:Bolt:5.5",
    "Feature:Bolt:5.6",
    "Feature:Bolt:5.7",
    "Feature:Bolt:Patch:UTC",
    "Feature:Auth:Basic",
    "Feature:Auth:Bearer",
    "Feature:Auth:Kerberos",
    "Feature:Auth:Custom",
    "Feature:Auth:Managed",
    "Feature:Impersonation",
    "Feature:API:BookmarkManager",
    "Feature:API:Driver.ExecuteQuery",
    "Optimization:EagerTransactionBegin",
    "Optimization:PullPipelining",
    "Optimization:AuthPipelining",
    "Optimization:ExecuteQueryPipelining",
];

/// `host:port` of a Bolt endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Authentication token, mapped onto the Bolt auth schemes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthToken {
    None,
    Basic {
        username: String,
        password: String,
        realm: Option<String>,
    },
    Bearer {
        token: String,
    },
    Kerberos {
        /// Base64-encoded ticket.
        ticket: String,
    },
    Custom {
        scheme: String,
        principal: String,
        credentials: String,
        realm: Option<String>,
        parameters: HashMap<String, String>,
    },
}

impl Default for AuthToken {
    fn default() -> Self {
        AuthToken::None
    }
}

impl AuthToken {
    pub fn none() -> Self {
        AuthToken::None
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        AuthToken::Basic {
            username: username.into(),
            password: password.into(),
            realm: None,
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        AuthToken::Bearer {
            token: token.into(),
        }
    }

    pub fn kerberos(ticket: impl Into<String>) -> Self {
        AuthToken::Kerberos {
            ticket: ticket.into(),
        }
    }

    pub fn scheme(&self) -> &str {
        match self {
            AuthToken::None => "none",
            AuthToken::Basic { .. } => "basic",
            AuthToken::Bearer { .. } => "bearer",
            AuthToken::Kerberos { .. } => "kerberos",
            AuthToken::Custom { scheme, .. } => scheme,
        }
    }

    /// The token map carried in HELLO/LOGON.
    pub(crate) fn to_map(&self) -> HashMap<String, WireValue> {
        let mut map = HashMap::new();
        map.insert("scheme".to_string(), self.scheme().into());
        match self {
            AuthToken::None => {}
            AuthToken::Basic {
                username,
                password,
                realm,
            } => {
                map.insert("principal".to_string(), username.as_str().into());
                map.insert("credentials".to_string(), password.as_str().into());
                if let Some(realm) = realm {
                    map.insert("realm".to_string(), realm.as_str().into());
                }
            }
            AuthToken::Bearer { token } => {
                map.insert("credentials".to_string(), token.as_str().into());
            }
            AuthToken::Kerberos { ticket } => {
                map.insert("principal".to_string(), "".into());
                map.insert("credentials".to_string(), ticket.as_str().into());
            }
            AuthToken::Custom {
                principal,
                credentials,
                realm,
                parameters,
                ..
            } => {
                map.insert("principal".to_string(), principal.as_str().into());
                map.insert("credentials".to_string(), credentials.as_str().into());
                if let Some(realm) = realm {
                    map.insert("realm".to_string(), realm.as_str().into());
                }
                if !parameters.is_empty() {
                    let wire: HashMap<String, WireValue> = parameters
                        .iter()
                        .map(|(k, v)| (k.clone(), v.as_str().into()))
                        .collect();
                    map.insert("parameters".to_string(), WireValue::Map(wire));
                }
            }
        }
        map
    }
}

/// How to decide whether a server certificate is trusted.
#[derive(Debug, Clone, Default)]
pub enum TrustStrategy {
    /// The operating system trust store.
    #[default]
    TrustSystemCas,
    /// Only the given PEM-encoded CA bundles.
    TrustCustomCas { certificates: Vec<Vec<u8>> },
    /// Trust everything. No server identity whatsoever; test setups only.
    TrustAllCertificates,
}

/// Expands an address into the concrete endpoints to contact; the routing
/// layer consults it when every known router is gone.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, address: &ServerAddress) -> Vec<ServerAddress>;
}

/// The default resolver: the address stands for itself.
#[derive(Debug)]
pub struct DirectResolver;

impl AddressResolver for DirectResolver {
    fn resolve(&self, address: &ServerAddress) -> Vec<ServerAddress> {
        vec![address.clone()]
    }
}

/// Externally managed bookmark store shared between sessions.
pub trait BookmarkManager: Send + Sync {
    /// Bookmarks to merge into the next unit of work.
    fn bookmarks(&self) -> Vec<String>;
    /// Called when a completed unit of work produced a new bookmark.
    fn update_bookmark(&self, bookmark: &str);
}

/// Externally managed authentication tokens (rotating credentials, SSO
/// tickets). The pool consults it before dialing a new connection and
/// before reusing an idle one; a changed token re-authenticates idle
/// connections in place where the protocol allows. The push-style
/// [`Driver::update_auth`] remains available when no manager is set.
pub trait AuthTokenManager: Send + Sync {
    /// The token to authenticate with right now.
    fn get_token(&self) -> AuthToken;
    /// The server rejected `token` as expired or revoked; a fresh one
    /// should be available from the next `get_token` call.
    fn on_token_expired(&self, token: &AuthToken);
}

/// Supplies the client certificate for mutual TLS; consulted on every
/// negotiation so rotation needs no restart.
pub trait ClientCertificateProvider: Send + Sync + fmt::Debug {
    /// `(certificate chain PEM, private key PEM)`, or `None` for no client
    /// auth.
    fn fetch(&self) -> Option<(Vec<u8>, Vec<u8>)>;
}

/// Driver configuration. Defaults in parentheses per field.
#[derive(Clone)]
pub struct DriverConfig {
    /// Initial server address from the URI.
    pub address: ServerAddress,
    /// Whether the URI selected the routing scheme (`neo4j://`).
    pub routing: bool,
    /// Query-string key/value pairs of a routing URI.
    pub routing_context: HashMap<String, String>,
    pub auth: AuthToken,
    /// Pull-style token source overriding `auth` when set (unset).
    pub auth_manager: Option<Arc<dyn AuthTokenManager>>,
    /// TLS on or off; `+s`/`+ssc` URI schemes force it on (off).
    pub encrypted: bool,
    pub trust_strategy: TrustStrategy,
    pub client_certificate: Option<Arc<dyn ClientCertificateProvider>>,
    /// Max connections per server (100).
    pub max_connection_pool_size: usize,
    /// Max idle connections kept per server (= pool size).
    pub max_idle_connection_pool_size: usize,
    /// How long an acquire may wait for a free slot (60 s).
    pub connection_acquisition_timeout: Duration,
    /// TCP/TLS establishment budget (30 s).
    pub connection_timeout: Duration,
    /// Connections older than this are not reused (1 h).
    pub max_connection_lifetime: Duration,
    /// Idle-age cutoff for reuse; `None` is no cutoff (∞).
    pub connection_idle_timeout: Option<Duration>,
    /// Idle age beyond which reuse is preceded by a RESET probe; zero
    /// probes on every acquisition (unset).
    pub connection_liveness_threshold: Option<Duration>,
    /// Total budget of the retry engine (30 s).
    pub max_transaction_retry_time: Duration,
    /// Records per PULL batch, -1 for everything (1000).
    pub fetch_size: i64,
    pub user_agent: String,
    /// Dial IPv6 endpoints too (false).
    pub ipv6_enabled: bool,
    /// TCP keep-alive on the socket (true).
    pub socket_keep_alive: bool,
    /// Server-side notification filtering (unset).
    pub notifications: Option<NotificationsConfig>,
    /// Suppress TELEMETRY messages (false).
    pub telemetry_disabled: bool,
    pub resolver: Arc<dyn AddressResolver>,
}

impl DriverConfig {
    /// Parse a connection URI and combine it with defaults.
    pub fn new(uri: &str, auth: AuthToken) -> Result<Self> {
        let parsed = parse_uri(uri)?;
        Ok(Self {
            address: parsed.address,
            routing: parsed.routing,
            routing_context: parsed.routing_context,
            auth,
            auth_manager: None,
            encrypted: parsed.encrypted,
            trust_strategy: parsed.trust_strategy,
            client_certificate: None,
            max_connection_pool_size: 100,
            max_idle_connection_pool_size: 100,
            connection_acquisition_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(30),
            max_connection_lifetime: Duration::from_secs(3600),
            connection_idle_timeout: None,
            connection_liveness_threshold: None,
            max_transaction_retry_time: Duration::from_secs(30),
            fetch_size: 1000,
            user_agent: format!("boltwire/{}", env!("CARGO_PKG_VERSION")),
            ipv6_enabled: false,
            socket_keep_alive: true,
            notifications: None,
            telemetry_disabled: false,
            resolver: Arc::new(DirectResolver),
        })
    }

    pub fn builder(uri: &str, auth: AuthToken) -> Result<DriverConfigBuilder> {
        Ok(DriverConfigBuilder {
            config: Self::new(uri, auth)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_test(address: ServerAddress) -> Self {
        let mut config = Self::new("bolt://placeholder", AuthToken::none())
            .expect("static test URI parses");
        config.address = address;
        config
    }
}

impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("address", &self.address)
            .field("routing", &self.routing)
            .field("encrypted", &self.encrypted)
            .field("auth_scheme", &self.auth.scheme())
            .field("auth_manager", &self.auth_manager.is_some())
            .field("max_connection_pool_size", &self.max_connection_pool_size)
            .field("fetch_size", &self.fetch_size)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Fluent construction of an immutable [`DriverConfig`].
#[derive(Debug)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.config.encrypted = encrypted;
        self
    }

    pub fn with_trust_strategy(mut self, strategy: TrustStrategy) -> Self {
        self.config.trust_strategy = strategy;
        self
    }

    pub fn with_client_certificate(
        mut self,
        provider: Arc<dyn ClientCertificateProvider>,
    ) -> Self {
        self.config.client_certificate = Some(provider);
        self
    }

    pub fn with_auth_token_manager(mut self, manager: Arc<dyn AuthTokenManager>) -> Self {
        self.config.auth_manager = Some(manager);
        self
    }

    pub fn with_max_connection_pool_size(mut self, size: usize) -> Self {
        self.config.max_connection_pool_size = size;
        self.config.max_idle_connection_pool_size =
            self.config.max_idle_connection_pool_size.min(size);
        self
    }

    pub fn with_max_idle_connection_pool_size(mut self, size: usize) -> Self {
        self.config.max_idle_connection_pool_size = size;
        self
    }

    pub fn with_connection_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_acquisition_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn with_max_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_connection_lifetime = lifetime;
        self
    }

    pub fn with_connection_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_idle_timeout = Some(timeout);
        self
    }

    pub fn with_connection_liveness_threshold(mut self, threshold: Duration) -> Self {
        self.config.connection_liveness_threshold = Some(threshold);
        self
    }

    pub fn with_max_transaction_retry_time(mut self, budget: Duration) -> Self {
        self.config.max_transaction_retry_time = budget;
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: i64) -> Self {
        self.config.fetch_size = fetch_size;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn with_ipv6_enabled(mut self, enabled: bool) -> Self {
        self.config.ipv6_enabled = enabled;
        self
    }

    pub fn with_socket_keep_alive(mut self, enabled: bool) -> Self {
        self.config.socket_keep_alive = enabled;
        self
    }

    pub fn with_notifications(mut self, notifications: NotificationsConfig) -> Self {
        self.config.notifications = Some(notifications);
        self
    }

    pub fn with_telemetry_disabled(mut self, disabled: bool) -> Self {
        self.config.telemetry_disabled = disabled;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.config.resolver = resolver;
        self
    }

    pub fn build(self) -> DriverConfig {
        self.config
    }
}

struct ParsedUri {
    address: ServerAddress,
    routing: bool,
    routing_context: HashMap<String, String>,
    encrypted: bool,
    trust_strategy: TrustStrategy,
}

fn parse_uri(uri: &str) -> Result<ParsedUri> {
    let url =
        Url::parse(uri).map_err(|e| Error::Client(format!("invalid connection URI: {e}")))?;

    let (routing, encrypted, trust_strategy) = match url.scheme() {
        "bolt" => (false, false, TrustStrategy::default()),
        "bolt+s" => (false, true, TrustStrategy::TrustSystemCas),
        "bolt+ssc" => (false, true, TrustStrategy::TrustAllCertificates),
        "neo4j" => (true, false, TrustStrategy::default()),
        "neo4j+s" => (true, true, TrustStrategy::TrustSystemCas),
        "neo4j+ssc" => (true, true, TrustStrategy::TrustAllCertificates),
        other => {
            return Err(Error::Client(format!(
                "unsupported URI scheme {other:?}; expected bolt[+s|+ssc] or neo4j[+s|+ssc]"
            )))
        }
    };

    let host = url
        .host_str()
        .ok_or_else(|| Error::Client("connection URI has no host".to_string()))?
        .trim_matches(['[', ']'])
        .to_string();
    let port = url.port().unwrap_or(7687);

    let mut routing_context = HashMap::new();
    for (key, value) in url.query_pairs() {
        if !routing {
            return Err(Error::Client(
                "a routing context is only valid with neo4j:// schemes".to_string(),
            ));
        }
        if routing_context
            .insert(key.to_string(), value.to_string())
            .is_some()
        {
            return Err(Error::Client(format!(
                "duplicate routing context key {key:?}"
            )));
        }
    }

    Ok(ParsedUri {
        address: ServerAddress::new(host, port),
        routing,
        routing_context,
        encrypted,
        trust_strategy,
    })
}

/// How this driver reaches servers: one fixed address, or via routing
/// tables.
#[derive(Clone)]
pub(crate) enum Connector {
    Direct { pool: Pool, address: ServerAddress },
    Routing { balancer: Arc<LoadBalancer> },
}

impl Connector {
    pub(crate) async fn acquire(
        &self,
        database: Option<&str>,
        mode: AccessMode,
        bookmarks: &[String],
    ) -> Result<PooledConnection> {
        match self {
            Connector::Direct { pool, address } => pool.acquire(address).await,
            Connector::Routing { balancer } => balancer.acquire(database, mode, bookmarks).await,
        }
    }

    pub(crate) fn pool(&self) -> &Pool {
        match self {
            Connector::Direct { pool, .. } => pool,
            Connector::Routing { balancer } => balancer.pool(),
        }
    }

    pub(crate) fn router(&self) -> Option<Arc<LoadBalancer>> {
        match self {
            Connector::Direct { .. } => None,
            Connector::Routing { balancer } => Some(Arc::clone(balancer)),
        }
    }

    /// Feed classified server errors back into the routing table.
    pub(crate) fn note_server_error(&self, error: &Error, address: &ServerAddress) {
        if let Connector::Routing { balancer } = self {
            balancer.handle_routing_error(error, address);
        }
    }
}

/// Server identity discovered by [`Driver::verify_connectivity`].
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub address: ServerAddress,
    pub agent: Option<String>,
    pub protocol_version: String,
}

/// Fully buffered result of [`Driver::execute_query`].
#[derive(Debug)]
pub struct EagerResult {
    pub keys: Vec<String>,
    pub records: Vec<Record>,
    pub summary: ResultSummary,
}

/// The driver: thread-safe entry point owning pool and routing state.
pub struct Driver {
    config: Arc<DriverConfig>,
    connector: Connector,
}

impl Driver {
    /// Connect-lazily to `uri` with the given credentials.
    pub fn new(uri: &str, auth: AuthToken) -> Result<Self> {
        Self::with_config(DriverConfig::new(uri, auth)?)
    }

    pub fn with_config(config: DriverConfig) -> Result<Self> {
        if !config.routing && !config.routing_context.is_empty() {
            return Err(Error::Client(
                "a routing context is only valid with neo4j:// schemes".to_string(),
            ));
        }
        let config = Arc::new(config);

        let tls = if config.encrypted {
            Some(Arc::new(TlsClient::new(
                config.trust_strategy.clone(),
                config.client_certificate.clone(),
            )?))
        } else {
            None
        };

        let connector = if config.routing {
            let mut context: HashMap<String, WireValue> = config
                .routing_context
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().into()))
                .collect();
            context.insert("address".to_string(), config.address.to_string().into());

            let pool = Pool::new(Arc::clone(&config), tls, Some(context.clone()));
            let balancer = LoadBalancer::new(
                pool,
                config.address.clone(),
                Arc::clone(&config.resolver),
                context,
            );
            Connector::Routing {
                balancer: Arc::new(balancer),
            }
        } else {
            Connector::Direct {
                pool: Pool::new(Arc::clone(&config), tls, None),
                address: config.address.clone(),
            }
        };

        Ok(Self { config, connector })
    }

    /// Open a session.
    pub fn session(&self, config: SessionConfig) -> Result<Session> {
        if self.connector.pool().is_closed() {
            return Err(Error::Client("the driver is closed".to_string()));
        }
        Ok(Session::new(
            self.connector.clone(),
            Arc::clone(&self.config),
            config,
        ))
    }

    /// Run one query in a managed write transaction and buffer the whole
    /// result.
    pub async fn execute_query(&self, query: impl Into<Query>) -> Result<EagerResult> {
        let query = query.into();
        let mut session = self.session(SessionConfig::default())?;
        session
            .execute_write(move |tx| {
                let query = query.clone();
                async move {
                    let mut stream = tx.run(query).await?;
                    let keys = stream.keys().to_vec();
                    let mut records = Vec::new();
                    while let Some(record) = stream.next(&tx).await? {
                        records.push(record);
                    }
                    let summary = stream.consume(&tx).await?;
                    Ok(EagerResult {
                        keys,
                        records,
                        summary,
                    })
                }
            })
            .await
    }

    /// Check that at least one server answers, returning its identity.
    pub async fn verify_connectivity(&self) -> Result<ServerInfo> {
        let conn = self
            .connector
            .acquire(None, AccessMode::Read, &[])
            .await?;
        Ok(ServerInfo {
            address: conn.address().clone(),
            agent: conn.server_agent().map(String::from),
            protocol_version: conn.version().to_string(),
        })
    }

    /// Swap the authentication token for everything opened from now on;
    /// idle connections re-authenticate via pipelined LOGOFF/LOGON where
    /// the protocol allows. With an [`AuthTokenManager`] configured the
    /// manager is the source of truth and this push is superseded by its
    /// next `get_token`.
    pub fn update_auth(&self, auth: AuthToken) {
        self.connector.pool().update_auth(auth);
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.connector.pool().metrics()
    }

    /// Close the driver: new work is rejected, idle connections say GOODBYE
    /// now, leased ones as they return.
    pub async fn close(&self) {
        self.connector.pool().close().await;
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("address", &self.config.address)
            .field("routing", &self.config.routing)
            .finish()
    }
}
