//! Sessions: the user-facing unit of work.
//!
//! A session carries a database name, a default access mode and a bookmark
//! set. Auto-commit queries pipeline RUN with the first PULL on a fresh
//! pooled connection; explicit transactions hold their connection until
//! commit or rollback. `execute_read`/`execute_write` replay transaction
//! functions under the retry engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::bolt::message::{AccessMode, Request, Run, Streaming, Telemetry};
use crate::bolt::packstream::Value as WireValue;
use crate::error::{Error, Result};

use super::connection::{SummaryHandler, SummarySlot};
use super::cursor::{new_stream_buf, DetachedRecordStream, PullHandler, RecordStream, RunHandler};
use super::driver::{BookmarkManager, Connector, DriverConfig};
use super::retry::{Backoff, RetryDecision, RetryPolicy};
use super::transaction::{tx_context, Transaction, TransactionConfig};
use super::types::Value;

/// An unordered, deduplicated set of causal-consistency tokens. The driver
/// never looks inside a bookmark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bookmarks {
    values: HashSet<String>,
}

impl Bookmarks {
    pub fn new(values: impl IntoIterator<Item = String>) -> Self {
        Self {
            values: values.into_iter().filter(|b| !b.is_empty()).collect(),
        }
    }

    pub fn add(&mut self, bookmark: String) {
        if !bookmark.is_empty() {
            self.values.insert(bookmark);
        }
    }

    /// A successful commit supersedes everything seen before.
    pub fn replace_all(&mut self, bookmark: String) {
        self.values.clear();
        self.add(bookmark);
    }

    pub fn as_vec(&self) -> Vec<String> {
        self.values.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn contains(&self, bookmark: &str) -> bool {
        self.values.contains(bookmark)
    }
}

/// A query with parameters.
#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub parameters: HashMap<String, Value>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: HashMap<String, Value>) -> Self {
        self.parameters.extend(params);
        self
    }

    pub(crate) fn wire_parameters(
        &self,
        utc: bool,
    ) -> Result<HashMap<String, WireValue>> {
        self.parameters
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.clone().into_wire(utc)?)))
            .collect()
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// Per-session settings.
#[derive(Clone, Default)]
pub struct SessionConfig {
    pub database: Option<String>,
    /// Records per PULL; `None` inherits the driver default, `-1` streams
    /// everything in one batch.
    pub fetch_size: Option<i64>,
    pub default_access_mode: AccessMode,
    pub bookmarks: Vec<String>,
    pub impersonated_user: Option<String>,
    pub bookmark_manager: Option<Arc<dyn BookmarkManager>>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("database", &self.database)
            .field("fetch_size", &self.fetch_size)
            .field("default_access_mode", &self.default_access_mode)
            .field("bookmarks", &self.bookmarks.len())
            .field("impersonated_user", &self.impersonated_user)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: i64) -> Self {
        self.config.fetch_size = Some(fetch_size);
        self
    }

    pub fn with_read_access(mut self) -> Self {
        self.config.default_access_mode = AccessMode::Read;
        self
    }

    pub fn with_write_access(mut self) -> Self {
        self.config.default_access_mode = AccessMode::Write;
        self
    }

    pub fn with_bookmarks(mut self, bookmarks: Vec<String>) -> Self {
        self.config.bookmarks = bookmarks;
        self
    }

    pub fn with_impersonated_user(mut self, user: impl Into<String>) -> Self {
        self.config.impersonated_user = Some(user.into());
        self
    }

    pub fn with_bookmark_manager(mut self, manager: Arc<dyn BookmarkManager>) -> Self {
        self.config.bookmark_manager = Some(manager);
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

/// A session. Not shareable between tasks; use one session per logical
/// thread of work.
pub struct Session {
    connector: Connector,
    driver_config: Arc<DriverConfig>,
    config: SessionConfig,
    bookmarks: Arc<Mutex<Bookmarks>>,
    open: bool,
}

impl Session {
    pub(crate) fn new(
        connector: Connector,
        driver_config: Arc<DriverConfig>,
        config: SessionConfig,
    ) -> Self {
        let bookmarks = Arc::new(Mutex::new(Bookmarks::new(config.bookmarks.clone())));
        Self {
            connector,
            driver_config,
            config,
            bookmarks,
            open: true,
        }
    }

    /// Run an auto-commit query and stream its result lazily.
    pub async fn run(&mut self, query: impl Into<Query>) -> Result<DetachedRecordStream> {
        self.run_with(query, TransactionConfig::default()).await
    }

    /// Auto-commit with an explicit transaction configuration.
    pub async fn run_with(
        &mut self,
        query: impl Into<Query>,
        tx_config: TransactionConfig,
    ) -> Result<DetachedRecordStream> {
        self.ensure_open()?;
        let query = query.into();
        let mode = self.config.default_access_mode;
        let bookmark_snapshot = self.effective_bookmarks();

        let mut conn = self
            .connector
            .acquire(self.config.database.as_deref(), mode, &bookmark_snapshot)
            .await?;
        let utc = conn.utc();
        let fetch_size = self.fetch_size();
        let buf = new_stream_buf(utc);

        if conn.version().supports_telemetry() && !self.driver_config.telemetry_disabled {
            conn.enqueue(
                Request::Telemetry(Telemetry::AutoCommit),
                Box::new(super::pipeline::IgnoreOutcome),
            )?;
        }

        let context = tx_context(
            &Bookmarks::new(bookmark_snapshot),
            &tx_config,
            mode,
            self.config.database.clone(),
            self.config.impersonated_user.clone(),
            self.driver_config.notifications.clone(),
            utc,
        )?;
        let parameters = query.wire_parameters(utc)?;
        debug!(query = %query.text, "running auto-commit query");
        conn.enqueue(
            Request::Run(Run {
                query: query.text,
                parameters,
                context: Some(context),
            }),
            Box::new(RunHandler { buf: buf.clone() }),
        )?;
        conn.enqueue(
            Request::Pull(Streaming::some(fetch_size)),
            Box::new(PullHandler {
                buf: buf.clone(),
                bookmarks: Some(self.bookmarks.clone()),
                bookmark_manager: self.config.bookmark_manager.clone(),
            }),
        )?;
        conn.sync().await?;

        if let Some(error) = buf.lock().take_error() {
            self.connector.note_server_error(&error, conn.address());
            return Err(error);
        }
        let stream = RecordStream::attached(buf, fetch_size);
        Ok(DetachedRecordStream::new(stream, conn, self.connector.router()))
    }

    /// Open an explicit transaction.
    pub async fn begin_transaction(&mut self) -> Result<Transaction> {
        self.begin_transaction_with(TransactionConfig::default())
            .await
    }

    pub async fn begin_transaction_with(
        &mut self,
        tx_config: TransactionConfig,
    ) -> Result<Transaction> {
        self.ensure_open()?;
        self.begin_with_mode(
            self.config.default_access_mode,
            tx_config,
            Telemetry::UnmanagedTransaction,
        )
        .await
    }

    async fn begin_with_mode(
        &mut self,
        mode: AccessMode,
        tx_config: TransactionConfig,
        telemetry: Telemetry,
    ) -> Result<Transaction> {
        let bookmark_snapshot = self.effective_bookmarks();
        let mut conn = self
            .connector
            .acquire(self.config.database.as_deref(), mode, &bookmark_snapshot)
            .await?;
        let utc = conn.utc();

        if conn.version().supports_telemetry() && !self.driver_config.telemetry_disabled {
            conn.enqueue(
                Request::Telemetry(telemetry),
                Box::new(super::pipeline::IgnoreOutcome),
            )?;
        }

        let context = tx_context(
            &Bookmarks::new(bookmark_snapshot),
            &tx_config,
            mode,
            self.config.database.clone(),
            self.config.impersonated_user.clone(),
            self.driver_config.notifications.clone(),
            utc,
        )?;
        let slot = SummarySlot::new();
        conn.enqueue(
            Request::Begin(crate::bolt::message::Begin { context }),
            SummaryHandler::boxed(&slot),
        )?;
        conn.sync().await?;
        if let Err(error) = slot.take_result() {
            self.connector.note_server_error(&error, conn.address());
            return Err(error);
        }

        Ok(Transaction::new(
            conn,
            self.bookmarks.clone(),
            self.fetch_size(),
            self.connector.router(),
        ))
    }

    /// Run `work` in a read transaction, retrying transient failures.
    pub async fn execute_read<T, F, Fut>(&mut self, work: F) -> Result<T>
    where
        F: Fn(Transaction) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.execute_with_retry(AccessMode::Read, work).await
    }

    /// Run `work` in a write transaction, retrying transient failures.
    pub async fn execute_write<T, F, Fut>(&mut self, work: F) -> Result<T>
    where
        F: Fn(Transaction) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.execute_with_retry(AccessMode::Write, work).await
    }

    /// The retry engine: each attempt gets a fresh transaction on a freshly
    /// acquired connection. The engine commits when the work succeeds and
    /// rolls back when it fails.
    async fn execute_with_retry<T, F, Fut>(&mut self, mode: AccessMode, work: F) -> Result<T>
    where
        F: Fn(Transaction) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.ensure_open()?;
        let policy = RetryPolicy::with_budget(self.driver_config.max_transaction_retry_time);
        let mut backoff = Backoff::new(policy);

        loop {
            let outcome = async {
                let tx = self
                    .begin_with_mode(
                        mode,
                        TransactionConfig::default(),
                        Telemetry::ManagedTransaction,
                    )
                    .await?;
                let engine_handle = tx.clone();
                match work(tx).await {
                    Ok(value) => {
                        // Work may have committed through its own handle.
                        if !engine_handle.is_terminated().await {
                            engine_handle.commit().await?;
                        }
                        Ok(value)
                    }
                    Err(error) => {
                        let _ = engine_handle.rollback().await;
                        Err(error)
                    }
                }
            }
            .await;

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) => match backoff.decide(&error) {
                    RetryDecision::Fatal => return Err(error),
                    RetryDecision::BudgetExhausted => return Err(backoff.exhaust(error)),
                    RetryDecision::Retry(delay) => {
                        debug!(
                            attempt = backoff.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retrying transaction function"
                        );
                        backoff.suppress(error);
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }
    }

    /// Bookmarks the next unit of work will send.
    pub fn last_bookmarks(&self) -> Vec<String> {
        self.bookmarks.lock().as_vec()
    }

    pub async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Client("session is closed".to_string()))
        }
    }

    fn fetch_size(&self) -> i64 {
        self.config
            .fetch_size
            .unwrap_or(self.driver_config.fetch_size)
    }

    /// Own bookmarks merged with the bookmark manager's, when one is set.
    fn effective_bookmarks(&self) -> Vec<String> {
        let mut set = self.bookmarks.lock().clone();
        if let Some(ref manager) = self.config.bookmark_manager {
            for bookmark in manager.bookmarks() {
                set.add(bookmark);
            }
        }
        set.as_vec()
    }

}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("database", &self.config.database)
            .field("mode", &self.config.default_access_mode)
            .field("open", &self.open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bookmarks_deduplicate_and_ignore_empties() {
        let mut bookmarks = Bookmarks::new(vec![
            "bm:tx5".to_string(),
            "bm:tx5".to_string(),
            String::new(),
        ]);
        assert_eq!(bookmarks.len(), 1);

        bookmarks.add("bm:tx29".to_string());
        bookmarks.add("bm:tx29".to_string());
        assert_eq!(bookmarks.len(), 2);
        assert!(bookmarks.contains("bm:tx29"));
    }

    #[test]
    fn replace_all_leaves_a_single_bookmark() {
        let mut bookmarks = Bookmarks::new(vec!["a".to_string(), "b".to_string()]);
        bookmarks.replace_all("c".to_string());
        assert_eq!(bookmarks.as_vec(), ["c"]);
    }

    #[test]
    fn query_builders() {
        let query = Query::new("RETURN $x + $y")
            .with_param("x", 1i64)
            .with_param("y", 2i64);
        assert_eq!(query.parameters.len(), 2);

        let wire = query.wire_parameters(true).unwrap();
        assert_eq!(wire.get("x"), Some(&WireValue::Integer(1)));
    }

    #[test]
    fn session_config_builder() {
        let config = SessionConfig::builder()
            .with_database("movies")
            .with_fetch_size(100)
            .with_read_access()
            .with_bookmarks(vec!["bm:1".to_string()])
            .build();
        assert_eq!(config.database.as_deref(), Some("movies"));
        assert_eq!(config.fetch_size, Some(100));
        assert_eq!(config.default_access_mode, AccessMode::Read);
        assert_eq!(config.bookmarks.len(), 1);
    }
}
