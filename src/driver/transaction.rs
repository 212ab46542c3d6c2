//! Explicit transactions.
//!
//! A [`Transaction`] is a cloneable handle over shared state, so the retry
//! engine can keep one handle while user code works through another and
//! still commit or roll back afterwards. The connection lease lives inside
//! the handle until the transaction terminates; dropping the last handle of
//! an open transaction sends the connection through the pool's reset path,
//! which rolls the server-side transaction back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::bolt::message::{Request, Run, Streaming, TxContext};
use crate::error::{Error, Result};

use super::connection::{Connection, SummaryHandler, SummarySlot};
use super::cursor::{new_stream_buf, PullHandler, RecordStream, RunHandler};
use super::pool::PooledConnection;
use super::routing::LoadBalancer;
use super::session::{Bookmarks, Query};

/// Extra knobs for one transaction (or auto-commit query): a server-side
/// timeout and opaque metadata visible in query listings.
#[derive(Debug, Clone, Default)]
pub struct TransactionConfig {
    pub timeout: Option<Duration>,
    pub metadata: HashMap<String, super::types::Value>,
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<super::types::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionState {
    pub fn is_terminated(self) -> bool {
        self != TransactionState::Active
    }
}

pub(crate) struct TxInner {
    conn: Option<PooledConnection>,
    state: TransactionState,
    bookmarks: Arc<Mutex<Bookmarks>>,
    fetch_size: i64,
    router: Option<Arc<LoadBalancer>>,
}

impl TxInner {
    /// The connection, as long as the transaction still holds one. A failed
    /// transaction keeps its connection so ROLLBACK can still go out.
    pub(crate) fn connection_mut(&mut self) -> Result<&mut Connection> {
        let state = self.state;
        self.conn
            .as_deref_mut()
            .ok_or_else(|| Error::Client(format!("transaction is {}", state_name(state))))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == TransactionState::Active {
            Ok(())
        } else {
            Err(Error::Client(format!(
                "transaction is {}",
                state_name(self.state)
            )))
        }
    }

    fn note_error(&mut self, error: &Error) {
        if let (Some(router), Some(conn)) = (&self.router, &self.conn) {
            router.handle_routing_error(error, conn.address());
        }
        self.state = TransactionState::Failed;
    }
}

fn state_name(state: TransactionState) -> &'static str {
    match state {
        TransactionState::Active => "active",
        TransactionState::Committed => "already committed",
        TransactionState::RolledBack => "already rolled back",
        TransactionState::Failed => "in a failed state",
    }
}

/// An explicit transaction. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<AsyncMutex<TxInner>>,
}

impl Transaction {
    pub(crate) fn new(
        conn: PooledConnection,
        bookmarks: Arc<Mutex<Bookmarks>>,
        fetch_size: i64,
        router: Option<Arc<LoadBalancer>>,
    ) -> Self {
        Self {
            inner: Arc::new(AsyncMutex::new(TxInner {
                conn: Some(conn),
                state: TransactionState::Active,
                bookmarks,
                fetch_size,
                router,
            })),
        }
    }

    pub(crate) async fn lock_inner(&self) -> MutexGuard<'_, TxInner> {
        self.inner.lock().await
    }

    /// Run a query inside the transaction. RUN and the first PULL go out
    /// pipelined; the returned stream pages through the rest.
    pub async fn run(&self, query: impl Into<Query>) -> Result<RecordStream> {
        let query = query.into();
        let mut inner = self.inner.lock().await;
        inner.ensure_active()?;
        let fetch_size = inner.fetch_size;
        let conn = inner.connection_mut()?;

        let buf = new_stream_buf(conn.utc());
        let utc = conn.utc();
        let parameters = query.wire_parameters(utc)?;
        conn.enqueue(
            Request::Run(Run {
                query: query.text,
                parameters,
                context: None,
            }),
            Box::new(RunHandler { buf: buf.clone() }),
        )?;
        let first_page = if conn.version().supports_qid() {
            // qid -1 targets the result the RUN just opened.
            Streaming::some(fetch_size).with_qid(-1)
        } else {
            Streaming::all()
        };
        conn.enqueue(
            Request::Pull(first_page),
            Box::new(PullHandler {
                buf: buf.clone(),
                bookmarks: None,
                bookmark_manager: None,
            }),
        )?;
        conn.sync().await?;

        if let Some(error) = buf.lock().take_error() {
            inner.note_error(&error);
            return Err(error);
        }
        Ok(RecordStream::attached(buf, fetch_size))
    }

    /// Commit; the single bookmark from the server replaces the session's
    /// bookmark set.
    pub async fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_active()?;
        let conn = inner.connection_mut()?;
        let slot = SummarySlot::new();
        conn.enqueue(Request::Commit, SummaryHandler::boxed(&slot))?;
        conn.sync().await?;
        match slot.take_result() {
            Ok(success) => {
                if let Some(bookmark) = success.bookmark() {
                    inner.bookmarks.lock().replace_all(bookmark.to_string());
                }
                inner.state = TransactionState::Committed;
                inner.conn = None;
                Ok(())
            }
            Err(error) => {
                inner.note_error(&error);
                inner.conn = None;
                Err(error)
            }
        }
    }

    /// Roll back. A no-op once committed or rolled back; a failed
    /// transaction still sends ROLLBACK (the server answers IGNORED, and the
    /// release path resets the connection).
    pub async fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if matches!(
            inner.state,
            TransactionState::Committed | TransactionState::RolledBack
        ) {
            return Ok(());
        }
        let conn = inner.connection_mut()?;
        let slot = SummarySlot::new();
        conn.enqueue(Request::Rollback, SummaryHandler::boxed(&slot))?;
        conn.sync().await?;
        match slot.take_result() {
            Ok(_) => {
                inner.state = TransactionState::RolledBack;
                inner.conn = None;
                Ok(())
            }
            Err(error) => {
                inner.note_error(&error);
                inner.conn = None;
                Err(error)
            }
        }
    }

    pub async fn state(&self) -> TransactionState {
        self.inner.lock().await.state
    }

    pub async fn is_terminated(&self) -> bool {
        self.inner.lock().await.state.is_terminated()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

/// Build the BEGIN/auto-commit context for one unit of work.
pub(crate) fn tx_context(
    bookmarks: &Bookmarks,
    config: &TransactionConfig,
    mode: crate::bolt::message::AccessMode,
    database: Option<String>,
    imp_user: Option<String>,
    notifications: Option<crate::bolt::message::NotificationsConfig>,
    utc: bool,
) -> Result<TxContext> {
    let mut tx_metadata = HashMap::new();
    for (key, value) in &config.metadata {
        tx_metadata.insert(key.clone(), value.clone().into_wire(utc)?);
    }
    Ok(TxContext {
        bookmarks: bookmarks.as_vec(),
        tx_timeout: config.timeout,
        tx_metadata,
        mode,
        database,
        imp_user,
        notifications,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_state_terminality() {
        assert!(!TransactionState::Active.is_terminated());
        assert!(TransactionState::Committed.is_terminated());
        assert!(TransactionState::RolledBack.is_terminated());
        assert!(TransactionState::Failed.is_terminated());
    }

    #[test]
    fn config_builder() {
        let config = TransactionConfig::new()
            .with_timeout(Duration::from_secs(10))
            .with_metadata("app", "tests");
        assert_eq!(config.timeout, Some(Duration::from_secs(10)));
        assert!(config.metadata.contains_key("app"));
    }

    #[test]
    fn context_carries_bookmarks_and_timeout() {
        let mut bookmarks = Bookmarks::default();
        bookmarks.add("bm:1".to_string());
        let config = TransactionConfig::new().with_timeout(Duration::from_millis(1500));
        let context = tx_context(
            &bookmarks,
            &config,
            crate::bolt::message::AccessMode::Read,
            Some("movies".to_string()),
            None,
            None,
            true,
        )
        .unwrap();
        assert_eq!(context.bookmarks, ["bm:1"]);
        assert_eq!(context.tx_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(context.database.as_deref(), Some("movies"));
    }
}
