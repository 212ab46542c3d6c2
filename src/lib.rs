//! # Boltwire
//!
//! An async Rust client driver for graph databases speaking the Bolt wire
//! protocol (Neo4j wire-compatible), built on Tokio.
//!
//! - **Bolt 3.0 / 4.1–4.4 / 5.0–5.7** with version-aware message encoding
//! - **Pipelined protocol**: RUN and PULL go out together, responses
//!   dispatch through a per-connection handler FIFO
//! - **Connection pooling** per server address with fair waiting, liveness
//!   probing and lifetime management
//! - **Cluster routing** for `neo4j://` URIs with TTL'd routing tables and
//!   transparent failover
//! - **Managed retries** of transaction functions with exponential backoff
//! - **Lazy result streaming** with PULL/DISCARD flow control
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use boltwire::{AuthToken, Driver, SessionConfig};
//!
//! # async fn example() -> boltwire::Result<()> {
//! let driver = Driver::new("bolt://localhost:7687", AuthToken::basic("neo4j", "secret"))?;
//! let mut session = driver.session(SessionConfig::default())?;
//!
//! let mut result = session.run("MATCH (n:Person) RETURN n.name AS name").await?;
//! while let Some(record) = result.next().await? {
//!     println!("{}", record.get_string("name")?);
//! }
//!
//! driver.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transaction functions
//!
//! Transient failures (leader switches, deadlocks, cluster hiccups) are
//! retried with exponential backoff when work runs through
//! [`Session::execute_read`] / [`Session::execute_write`]:
//!
//! ```rust,no_run
//! # use boltwire::{AuthToken, Driver, SessionConfig};
//! # async fn example() -> boltwire::Result<()> {
//! # let driver = Driver::new("neo4j://cluster:7687", AuthToken::none())?;
//! let mut session = driver.session(SessionConfig::default())?;
//! let count = session
//!     .execute_write(|tx| async move {
//!         let mut stream = tx.run("CREATE (n:Job) RETURN count(*) AS c").await?;
//!         let record = stream.next(&tx).await?.expect("one row");
//!         record.get_int("c")
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Layout
//!
//! [`bolt`] holds the protocol plumbing (PackStream, messages, handshake,
//! framing); [`driver`] holds everything stateful above it. The common
//! types are re-exported at the crate root.

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod bolt;
pub mod driver;
mod error;

pub use bolt::handshake::BoltVersion;
pub use driver::{
    AccessMode, AddressResolver, AuthToken, AuthTokenManager, BookmarkManager, Bookmarks,
    ClientCertificateProvider, Counters, CypherDuration, DetachedRecordStream, DirectResolver,
    Driver, DriverConfig, DriverConfigBuilder, EagerResult, InputPosition, Node, Notification,
    NotificationsConfig, Path, Point, PoolMetrics, Query, QueryType, Record, RecordStream,
    Relationship, ResultSummary, RetryPolicy, ServerAddress, ServerInfo, Session, SessionConfig,
    SessionConfigBuilder, Transaction, TransactionConfig, TransactionState, TrustStrategy,
    UnboundRelationship, Value, FEATURES,
};
pub use error::{Error, Result, ServerError, ServerErrorKind};
