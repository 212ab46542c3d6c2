//! The driver layer: connections, pooling, routing, retries, sessions.
//!
//! ```text
//! Driver
//!   ├── Connector ── Pool ── Connection ── response pipeline
//!   │        └── LoadBalancer (neo4j:// URIs)
//!   └── Session ── Transaction / DetachedRecordStream
//! ```
//!
//! Data flows user work → session → retry engine → routing → pool →
//! connection → framed transport → PackStream; results come back through
//! the response pipeline into the cursors.

mod connection;
mod cursor;
#[allow(clippy::module_inception)]
mod driver;
mod pipeline;
mod pool;
mod record;
mod retry;
mod routing;
mod session;
#[cfg(test)]
pub(crate) mod testkit;
mod tls;
mod transaction;
mod types;

pub use cursor::{
    Counters, DetachedRecordStream, InputPosition, Notification, QueryType, RecordStream,
    ResultSummary,
};
pub use driver::{
    AddressResolver, AuthToken, AuthTokenManager, BookmarkManager, ClientCertificateProvider,
    DirectResolver, Driver, DriverConfig, DriverConfigBuilder, EagerResult, ServerAddress,
    ServerInfo, TrustStrategy, FEATURES,
};
pub use pool::PoolMetrics;
pub use record::Record;
pub use retry::RetryPolicy;
pub use session::{Bookmarks, Query, Session, SessionConfig, SessionConfigBuilder};
pub use transaction::{Transaction, TransactionConfig, TransactionState};
pub use types::{Duration as CypherDuration, Node, Path, Point, Relationship, UnboundRelationship, Value};

pub use crate::bolt::message::{AccessMode, NotificationsConfig};
