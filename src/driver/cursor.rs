//! Lazy result cursors.
//!
//! RUN and the first PULL are pipelined before anything is read back.
//! Records buffer between PULL batches; `next()` fetches another page when
//! the buffer runs dry and the server reported `has_more`. `consume()`
//! abandons the remainder with DISCARD and returns only the summary.
//! Records are handed out strictly in the server's emission order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::bolt::message::{Request, Streaming, Success};
use crate::bolt::packstream::Value as WireValue;
use crate::error::{Error, Result};

use super::connection::Connection;
use super::pipeline::ResponseHandler;
use super::pool::PooledConnection;
use super::record::Record;
use super::routing::LoadBalancer;
use super::session::Bookmarks;
use super::transaction::Transaction;
use super::types::Value;

/// What kind of work a query did, from the summary's `type` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryType {
    #[default]
    Unknown,
    ReadOnly,
    ReadWrite,
    WriteOnly,
    SchemaWrite,
}

impl QueryType {
    fn parse(tag: &str) -> Self {
        match tag {
            "r" => QueryType::ReadOnly,
            "rw" => QueryType::ReadWrite,
            "w" => QueryType::WriteOnly,
            "s" => QueryType::SchemaWrite,
            _ => QueryType::Unknown,
        }
    }
}

/// Update counters from the summary's `stats` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub nodes_created: i64,
    pub nodes_deleted: i64,
    pub relationships_created: i64,
    pub relationships_deleted: i64,
    pub properties_set: i64,
    pub labels_added: i64,
    pub labels_removed: i64,
    pub indexes_added: i64,
    pub indexes_removed: i64,
    pub constraints_added: i64,
    pub constraints_removed: i64,
    pub system_updates: i64,
}

impl Counters {
    fn parse(stats: &HashMap<String, WireValue>) -> Self {
        let get = |key: &str| stats.get(key).and_then(WireValue::as_int).unwrap_or(0);
        Self {
            nodes_created: get("nodes-created"),
            nodes_deleted: get("nodes-deleted"),
            relationships_created: get("relationships-created"),
            relationships_deleted: get("relationships-deleted"),
            properties_set: get("properties-set"),
            labels_added: get("labels-added"),
            labels_removed: get("labels-removed"),
            indexes_added: get("indexes-added"),
            indexes_removed: get("indexes-removed"),
            constraints_added: get("constraints-added"),
            constraints_removed: get("constraints-removed"),
            system_updates: get("system-updates"),
        }
    }

    pub fn contains_updates(&self) -> bool {
        self.nodes_created > 0
            || self.nodes_deleted > 0
            || self.relationships_created > 0
            || self.relationships_deleted > 0
            || self.properties_set > 0
            || self.labels_added > 0
            || self.labels_removed > 0
    }

    pub fn contains_system_updates(&self) -> bool {
        self.indexes_added > 0
            || self.indexes_removed > 0
            || self.constraints_added > 0
            || self.constraints_removed > 0
            || self.system_updates > 0
    }
}

/// A server notification attached to the summary.
#[derive(Debug, Clone)]
pub struct Notification {
    pub code: String,
    pub title: String,
    pub description: String,
    pub severity: String,
    pub position: Option<InputPosition>,
}

/// Where in the query text a notification points.
#[derive(Debug, Clone, Copy)]
pub struct InputPosition {
    pub offset: i64,
    pub line: i64,
    pub column: i64,
}

fn parse_notifications(list: &[WireValue]) -> Vec<Notification> {
    let text = |map: &HashMap<String, WireValue>, key: &str| {
        map.get(key)
            .and_then(WireValue::as_str)
            .unwrap_or_default()
            .to_string()
    };
    list.iter()
        .filter_map(WireValue::as_map)
        .map(|map| Notification {
            code: text(map, "code"),
            title: text(map, "title"),
            description: text(map, "description"),
            severity: text(map, "severity"),
            position: map.get("position").and_then(WireValue::as_map).map(|p| {
                let int = |key: &str| p.get(key).and_then(WireValue::as_int).unwrap_or(0);
                InputPosition {
                    offset: int("offset"),
                    line: int("line"),
                    column: int("column"),
                }
            }),
        })
        .collect()
}

/// Terminal summary of one result stream.
#[derive(Debug, Clone, Default)]
pub struct ResultSummary {
    pub query_type: QueryType,
    pub counters: Counters,
    pub bookmark: Option<String>,
    pub database: Option<String>,
    /// Time until the first record was available.
    pub t_first: Option<Duration>,
    /// Time until the stream was exhausted.
    pub t_last: Option<Duration>,
    pub notifications: Vec<Notification>,
}

/// Shared cursor state, fed by the RUN/PULL handlers and drained by the
/// stream types. The connection owner and the handlers never hold the lock
/// across a suspension point.
#[derive(Default)]
pub(crate) struct StreamBuf {
    keys: Option<Arc<[String]>>,
    qid: Option<i64>,
    records: VecDeque<Record>,
    has_more: bool,
    done: bool,
    error: Option<Error>,
    summary: ResultSummary,
    utc: bool,
}

impl StreamBuf {
    pub(crate) fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    pub(crate) fn pop_record(&mut self) -> Option<Record> {
        self.records.pop_front()
    }
}

pub(crate) type SharedStreamBuf = Arc<Mutex<StreamBuf>>;

pub(crate) fn new_stream_buf(utc: bool) -> SharedStreamBuf {
    Arc::new(Mutex::new(StreamBuf {
        utc,
        ..StreamBuf::default()
    }))
}

/// Handler for the RUN response: captures column names, qid and t_first.
pub(crate) struct RunHandler {
    pub buf: SharedStreamBuf,
}

impl ResponseHandler for RunHandler {
    fn on_success(&mut self, success: Success) {
        let mut buf = self.buf.lock();
        buf.keys = Some(success.fields().unwrap_or_default().into());
        buf.qid = success.qid();
        buf.summary.t_first = success.t_first().map(|ms| Duration::from_millis(ms as u64));
    }

    fn on_record(&mut self, _: Vec<WireValue>) {
        self.buf.lock().error = Some(Error::Protocol(
            "RECORD before the RUN completed".to_string(),
        ));
    }

    fn on_failure(&mut self, error: Error) {
        self.buf.lock().error = Some(error);
    }

    fn on_ignored(&mut self, error: Option<Error>) {
        self.buf.lock().error = Some(error.unwrap_or_else(interrupted));
    }
}

/// Handler for PULL and DISCARD responses: buffers records and finalizes the
/// summary on the terminal batch. The session's bookmark set is replaced
/// when a terminal summary carries a bookmark, and a bookmark manager is
/// notified when one is attached.
pub(crate) struct PullHandler {
    pub buf: SharedStreamBuf,
    pub bookmarks: Option<Arc<Mutex<Bookmarks>>>,
    pub bookmark_manager: Option<Arc<dyn super::driver::BookmarkManager>>,
}

impl ResponseHandler for PullHandler {
    fn on_success(&mut self, success: Success) {
        let mut buf = self.buf.lock();
        if success.has_more() {
            buf.has_more = true;
            return;
        }
        buf.has_more = false;
        buf.done = true;
        buf.summary.query_type = success
            .query_type()
            .map(QueryType::parse)
            .unwrap_or_default();
        if let Some(stats) = success.stats() {
            buf.summary.counters = Counters::parse(stats);
        }
        buf.summary.bookmark = success.bookmark().map(String::from);
        buf.summary.database = success.db().map(String::from);
        buf.summary.t_last = success.t_last().map(|ms| Duration::from_millis(ms as u64));
        if let Some(notifications) = success.notifications() {
            buf.summary.notifications = parse_notifications(notifications);
        }
        if let Some(ref bookmark) = buf.summary.bookmark {
            if let Some(ref holder) = self.bookmarks {
                holder.lock().replace_all(bookmark.clone());
            }
            if let Some(ref manager) = self.bookmark_manager {
                manager.update_bookmark(bookmark);
            }
        }
    }

    fn on_record(&mut self, fields: Vec<WireValue>) {
        let mut buf = self.buf.lock();
        let keys = buf.keys.clone().unwrap_or_else(|| Vec::new().into());
        let utc = buf.utc;
        let values: Result<Vec<Value>> =
            fields.into_iter().map(|v| Value::from_wire(v, utc)).collect();
        match values {
            Ok(values) => buf.records.push_back(Record::new(keys, values)),
            Err(e) => buf.error = Some(e),
        }
    }

    fn on_failure(&mut self, error: Error) {
        self.buf.lock().error = Some(error);
    }

    fn on_ignored(&mut self, error: Option<Error>) {
        self.buf.lock().error = Some(error.unwrap_or_else(interrupted));
    }
}

fn interrupted() -> Error {
    Error::Client("result stream was interrupted by a reset".to_string())
}

/// A cursor over one result inside an explicit transaction. Page fetches
/// borrow the transaction, which owns the connection.
pub struct RecordStream {
    buf: SharedStreamBuf,
    keys: Arc<[String]>,
    fetch_size: i64,
}

impl RecordStream {
    pub(crate) fn attached(buf: SharedStreamBuf, fetch_size: i64) -> Self {
        let keys = buf.lock().keys.clone().unwrap_or_else(|| Vec::new().into());
        Self {
            buf,
            keys,
            fetch_size,
        }
    }

    /// Column names of this result.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Next record, fetching further PULL pages as needed.
    pub async fn next(&mut self, tx: &Transaction) -> Result<Option<Record>> {
        let mut inner = tx.lock_inner().await;
        self.advance(inner.connection_mut()?).await
    }

    /// Discard the rest of the stream and return the summary.
    pub async fn consume(&mut self, tx: &Transaction) -> Result<ResultSummary> {
        let mut inner = tx.lock_inner().await;
        self.consume_with(inner.connection_mut()?).await
    }

    pub(crate) async fn advance(&mut self, conn: &mut Connection) -> Result<Option<Record>> {
        loop {
            {
                let mut buf = self.buf.lock();
                if let Some(error) = buf.error.take() {
                    buf.done = true;
                    return Err(error);
                }
                if let Some(record) = buf.records.pop_front() {
                    return Ok(Some(record));
                }
                if buf.done {
                    return Ok(None);
                }
                if !buf.has_more {
                    return Err(Error::Client(
                        "result stream is no longer open on this connection".to_string(),
                    ));
                }
                buf.has_more = false;
                let page = Streaming {
                    n: self.fetch_size,
                    qid: buf.qid,
                };
                drop(buf);
                debug!(n = page.n, "fetching next result page");
                conn.enqueue(
                    Request::Pull(page),
                    Box::new(PullHandler {
                        buf: self.buf.clone(),
                        bookmarks: None,
                        bookmark_manager: None,
                    }),
                )?;
            }
            conn.sync().await?;
        }
    }

    pub(crate) async fn consume_with(&mut self, conn: &mut Connection) -> Result<ResultSummary> {
        loop {
            {
                let mut buf = self.buf.lock();
                buf.records.clear();
                if let Some(error) = buf.error.take() {
                    buf.done = true;
                    return Err(error);
                }
                if buf.done {
                    return Ok(buf.summary.clone());
                }
                if !buf.has_more {
                    return Err(Error::Client(
                        "result stream is no longer open on this connection".to_string(),
                    ));
                }
                buf.has_more = false;
                let discard = Streaming {
                    n: -1,
                    qid: buf.qid,
                };
                drop(buf);
                conn.enqueue(
                    Request::Discard(discard),
                    Box::new(PullHandler {
                        buf: self.buf.clone(),
                        bookmarks: None,
                        bookmark_manager: None,
                    }),
                )?;
            }
            conn.sync().await?;
        }
    }

    /// The summary, if the stream already ended.
    pub(crate) fn finished_summary(&self) -> Option<ResultSummary> {
        let buf = self.buf.lock();
        buf.done.then(|| buf.summary.clone())
    }
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buf = self.buf.lock();
        f.debug_struct("RecordStream")
            .field("keys", &self.keys)
            .field("buffered", &buf.records.len())
            .field("has_more", &buf.has_more)
            .field("done", &buf.done)
            .finish()
    }
}

/// An auto-commit cursor owning its pooled connection. The connection
/// returns to the pool when the stream is exhausted, consumed or dropped;
/// an unexhausted drop resets the connection on the way back, discarding
/// the server-side stream.
pub struct DetachedRecordStream {
    stream: RecordStream,
    conn: Option<PooledConnection>,
    router: Option<Arc<LoadBalancer>>,
}

impl DetachedRecordStream {
    pub(crate) fn new(
        stream: RecordStream,
        conn: PooledConnection,
        router: Option<Arc<LoadBalancer>>,
    ) -> Self {
        Self {
            stream,
            conn: Some(conn),
            router,
        }
    }

    pub fn keys(&self) -> &[String] {
        self.stream.keys()
    }

    pub async fn next(&mut self) -> Result<Option<Record>> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(None);
        };
        match self.stream.advance(conn).await {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => {
                // Exhausted cleanly: hand the connection back right away.
                self.conn = None;
                Ok(None)
            }
            Err(e) => {
                self.note_routing_error(&e);
                self.conn = None;
                Err(e)
            }
        }
    }

    /// Discard the remainder and return the summary; the connection goes
    /// back to the pool.
    pub async fn consume(mut self) -> Result<ResultSummary> {
        match self.conn.as_mut() {
            None => self
                .stream
                .finished_summary()
                .ok_or_else(|| Error::Client("result stream already failed".to_string())),
            Some(conn) => {
                let outcome = self.stream.consume_with(conn).await;
                if let Err(ref e) = outcome {
                    self.note_routing_error(e);
                }
                self.conn = None;
                outcome
            }
        }
    }

    /// Adapt into a `futures::Stream` of records.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<Record>> + Send {
        futures::stream::try_unfold(self, |mut cursor| async move {
            let item = cursor.next().await?;
            Ok(item.map(|record| (record, cursor)))
        })
    }

    fn note_routing_error(&self, error: &Error) {
        let (Some(router), Some(conn)) = (&self.router, &self.conn) else {
            return;
        };
        router.handle_routing_error(error, conn.address());
    }
}

impl std::fmt::Debug for DetachedRecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetachedRecordStream")
            .field("stream", &self.stream)
            .field("attached", &self.conn.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::message::tag;
    use crate::bolt::packstream::Structure;

    fn success(entries: Vec<(&str, WireValue)>) -> Success {
        Success {
            metadata: entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    #[test]
    fn run_handler_captures_keys_and_qid() {
        let buf = new_stream_buf(true);
        let mut handler = RunHandler { buf: buf.clone() };
        handler.on_success(success(vec![
            ("fields", WireValue::List(vec!["a".into(), "b".into()])),
            ("qid", WireValue::Integer(4)),
            ("t_first", WireValue::Integer(12)),
        ]));

        let locked = buf.lock();
        assert_eq!(locked.keys.as_deref().unwrap(), ["a", "b"]);
        assert_eq!(locked.qid, Some(4));
        assert_eq!(locked.summary.t_first, Some(Duration::from_millis(12)));
    }

    #[test]
    fn pull_handler_buffers_records_in_order() {
        let buf = new_stream_buf(true);
        buf.lock().keys = Some(vec!["n".to_string()].into());
        let mut handler = PullHandler {
            buf: buf.clone(),
            bookmarks: None,
            bookmark_manager: None,
        };
        for i in 0..3 {
            handler.on_record(vec![WireValue::Integer(i)]);
        }
        handler.on_success(success(vec![("has_more", WireValue::Boolean(true))]));

        let mut locked = buf.lock();
        assert!(locked.has_more);
        assert!(!locked.done);
        let drained: Vec<i64> = std::iter::from_fn(|| locked.records.pop_front())
            .map(|r| r.get_int("n").unwrap())
            .collect();
        assert_eq!(drained, [0, 1, 2]);
    }

    #[test]
    fn terminal_pull_finalizes_summary_and_bookmarks() {
        let buf = new_stream_buf(true);
        let bookmarks = Arc::new(Mutex::new(Bookmarks::default()));
        let mut handler = PullHandler {
            buf: buf.clone(),
            bookmarks: Some(bookmarks.clone()),
            bookmark_manager: None,
        };

        let mut stats = HashMap::new();
        stats.insert("nodes-created".to_string(), WireValue::Integer(2));
        handler.on_success(success(vec![
            ("type", WireValue::from("rw")),
            ("bookmark", WireValue::from("bm:tx7")),
            ("stats", WireValue::Map(stats)),
            ("t_last", WireValue::Integer(9)),
        ]));

        let locked = buf.lock();
        assert!(locked.done);
        assert_eq!(locked.summary.query_type, QueryType::ReadWrite);
        assert_eq!(locked.summary.counters.nodes_created, 2);
        assert!(locked.summary.counters.contains_updates());
        assert_eq!(locked.summary.bookmark.as_deref(), Some("bm:tx7"));
        assert_eq!(locked.summary.t_last, Some(Duration::from_millis(9)));
        assert_eq!(bookmarks.lock().as_vec(), ["bm:tx7"]);
    }

    #[test]
    fn record_structures_decode_into_user_values() {
        let buf = new_stream_buf(true);
        buf.lock().keys = Some(vec!["n".to_string()].into());
        let mut handler = PullHandler {
            buf: buf.clone(),
            bookmarks: None,
            bookmark_manager: None,
        };
        let node = Structure::new(
            crate::bolt::packstream::structures::NODE,
            vec![
                WireValue::Integer(1),
                WireValue::List(vec!["L".into()]),
                WireValue::Map(HashMap::new()),
            ],
        );
        handler.on_record(vec![WireValue::Structure(node)]);

        let mut locked = buf.lock();
        let record = locked.records.pop_front().unwrap();
        assert!(record.get("n").unwrap().as_node().is_some());
    }

    #[test]
    fn malformed_record_structure_poisons_the_stream() {
        let buf = new_stream_buf(true);
        buf.lock().keys = Some(vec!["n".to_string()].into());
        let mut handler = PullHandler {
            buf: buf.clone(),
            bookmarks: None,
            bookmark_manager: None,
        };
        // RECORD response signature is never valid inside a record.
        let bogus = Structure::new(tag::RECORD, vec![]);
        handler.on_record(vec![WireValue::Structure(bogus)]);
        assert!(buf.lock().error.is_some());
    }

    #[test]
    fn ignored_without_sticky_reports_interruption() {
        let buf = new_stream_buf(true);
        let mut handler = PullHandler {
            buf: buf.clone(),
            bookmarks: None,
            bookmark_manager: None,
        };
        handler.on_ignored(None);
        let err = buf.lock().error.take().unwrap();
        assert!(err.to_string().contains("interrupted"));
    }

    #[test]
    fn notification_parsing() {
        let mut position = HashMap::new();
        position.insert("offset".to_string(), WireValue::Integer(3));
        position.insert("line".to_string(), WireValue::Integer(1));
        position.insert("column".to_string(), WireValue::Integer(4));
        let mut n = HashMap::new();
        n.insert(
            "code".to_string(),
            WireValue::from("Neo.ClientNotification.Statement.UnknownLabelWarning"),
        );
        n.insert("title".to_string(), WireValue::from("Unknown label"));
        n.insert("severity".to_string(), WireValue::from("WARNING"));
        n.insert("position".to_string(), WireValue::Map(position));

        let parsed = parse_notifications(&[WireValue::Map(n)]);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].severity, "WARNING");
        assert_eq!(parsed[0].position.unwrap().column, 4);
    }

    #[test]
    fn query_type_tags() {
        assert_eq!(QueryType::parse("r"), QueryType::ReadOnly);
        assert_eq!(QueryType::parse("rw"), QueryType::ReadWrite);
        assert_eq!(QueryType::parse("w"), QueryType::WriteOnly);
        assert_eq!(QueryType::parse("s"), QueryType::SchemaWrite);
        assert_eq!(QueryType::parse("??"), QueryType::Unknown);
    }
}
