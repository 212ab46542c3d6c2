//! Scripted Bolt server for tests.
//!
//! Listens on a loopback port, answers the handshake, and replies to each
//! request according to a [`Script`]: queued RUN outcomes, BEGIN failures, a
//! routing table, a commit bookmark. Every received message is recorded so
//! tests can assert on the exact wire traffic. While in the failed state the
//! server answers everything but RESET with IGNORED, like a real one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::bolt::codec::MessageCodec;
use crate::bolt::handshake::{BoltVersion, REQUEST_SIZE};
use crate::bolt::message::tag;
use crate::bolt::packstream::{decode, encode, Structure, Value};

use super::driver::ServerAddress;

/// Outcome of one scripted RUN.
#[derive(Clone)]
pub(crate) struct RunOutcome {
    pub fields: Vec<String>,
    pub records: Vec<Vec<Value>>,
    /// Extra entries merged into the terminal SUCCESS (bookmark, stats, ...).
    pub summary: Vec<(String, Value)>,
    pub failure: Option<(String, String)>,
}

impl RunOutcome {
    pub fn rows(fields: &[&str], records: Vec<Vec<Value>>) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            records,
            summary: Vec::new(),
            failure: None,
        }
    }

    pub fn with_summary(mut self, key: &str, value: Value) -> Self {
        self.summary.push((key.to_string(), value));
        self
    }

    pub fn failure(code: &str) -> Self {
        Self {
            fields: Vec::new(),
            records: Vec::new(),
            summary: Vec::new(),
            failure: Some((code.to_string(), "scripted failure".to_string())),
        }
    }
}

struct ScriptInner {
    version: BoltVersion,
    run_outcomes: Mutex<VecDeque<RunOutcome>>,
    begin_failures: Mutex<VecDeque<(String, String)>>,
    commit_bookmarks: Mutex<VecDeque<String>>,
    routing_table: Mutex<Option<Value>>,
    received: Mutex<Vec<Structure>>,
}

/// Shared, mutable test script.
#[derive(Clone)]
pub(crate) struct Script {
    inner: Arc<ScriptInner>,
}

impl Default for Script {
    fn default() -> Self {
        Self::at_version(BoltVersion::V5_0)
    }
}

impl Script {
    pub fn at_version(version: BoltVersion) -> Self {
        Self {
            inner: Arc::new(ScriptInner {
                version,
                run_outcomes: Mutex::new(VecDeque::new()),
                begin_failures: Mutex::new(VecDeque::new()),
                commit_bookmarks: Mutex::new(VecDeque::new()),
                routing_table: Mutex::new(None),
                received: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn queue_run(&self, outcome: RunOutcome) -> &Self {
        self.inner.run_outcomes.lock().push_back(outcome);
        self
    }

    pub fn fail_next_begin(&self, code: &str) -> &Self {
        self.inner
            .begin_failures
            .lock()
            .push_back((code.to_string(), "scripted failure".to_string()));
        self
    }

    pub fn queue_commit_bookmark(&self, bookmark: &str) -> &Self {
        self.inner
            .commit_bookmarks
            .lock()
            .push_back(bookmark.to_string());
        self
    }

    pub fn set_routing_table(&self, table: Value) -> &Self {
        *self.inner.routing_table.lock() = Some(table);
        self
    }

    /// All messages received so far, decoded.
    pub fn received(&self) -> Vec<Structure> {
        self.inner.received.lock().clone()
    }

    pub fn count_received(&self, message_tag: u8) -> usize {
        self.inner
            .received
            .lock()
            .iter()
            .filter(|s| s.tag == message_tag)
            .count()
    }
}

/// A running scripted server.
pub(crate) struct TestServer {
    pub address: ServerAddress,
    pub script: Script,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl TestServer {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept_script = script.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let script = accept_script.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, script).await;
                });
            }
        });
        Self {
            address: ServerAddress::new("127.0.0.1", port),
            script,
            handle,
        }
    }
}

/// Per-connection server state.
struct Peer {
    socket: TcpStream,
    buf: BytesMut,
    failed: bool,
    /// Records left to stream plus the terminal summary extras.
    pending: Option<(VecDeque<Vec<Value>>, Vec<(String, Value)>)>,
}

async fn serve(socket: TcpStream, script: Script) -> std::io::Result<()> {
    let mut peer = Peer {
        socket,
        buf: BytesMut::with_capacity(8192),
        failed: false,
        pending: None,
    };

    // Handshake: 20 bytes in, chosen version out.
    let mut handshake = [0u8; REQUEST_SIZE];
    peer.socket.read_exact(&mut handshake).await?;
    let version = script.inner.version;
    peer.socket
        .write_all(&[0, 0, version.minor, version.major])
        .await?;

    loop {
        let Some(message) = read_message(&mut peer).await? else {
            return Ok(());
        };
        let message_tag = message.tag;
        script.inner.received.lock().push(message);

        if message_tag == tag::GOODBYE {
            return Ok(());
        }
        if peer.failed && message_tag != tag::RESET {
            send(&mut peer, ignored()).await?;
            continue;
        }

        match message_tag {
            tag::HELLO => {
                let mut meta = HashMap::new();
                meta.insert("server".to_string(), Value::from("TestGraph/5.0"));
                meta.insert("connection_id".to_string(), Value::from("bolt-test"));
                if version.needs_utc_patch() {
                    meta.insert("patch_bolt".to_string(), Value::List(vec!["utc".into()]));
                }
                send(&mut peer, success(meta)).await?;
            }
            tag::LOGON | tag::LOGOFF | tag::ROLLBACK | tag::TELEMETRY => {
                send(&mut peer, success(HashMap::new())).await?;
            }
            tag::RESET => {
                peer.failed = false;
                peer.pending = None;
                send(&mut peer, success(HashMap::new())).await?;
            }
            tag::BEGIN => {
                let begin_failure = script.inner.begin_failures.lock().pop_front();
                if let Some((code, msg)) = begin_failure {
                    peer.failed = true;
                    send(&mut peer, failure(&code, &msg)).await?;
                } else {
                    send(&mut peer, success(HashMap::new())).await?;
                }
            }
            tag::COMMIT => {
                let bookmark = script
                    .inner
                    .commit_bookmarks
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| "bm:test:1".to_string());
                let mut meta = HashMap::new();
                meta.insert("bookmark".to_string(), Value::String(bookmark));
                send(&mut peer, success(meta)).await?;
            }
            tag::ROUTE => {
                let table = script.inner.routing_table.lock().clone();
                match table {
                    Some(rt) => {
                        let mut meta = HashMap::new();
                        meta.insert("rt".to_string(), rt);
                        send(&mut peer, success(meta)).await?;
                    }
                    None => {
                        peer.failed = true;
                        send(
                            &mut peer,
                            failure(
                                "Neo.ClientError.General.Unknown",
                                "no routing table scripted",
                            ),
                        )
                        .await?;
                    }
                }
            }
            tag::RUN => {
                let outcome = script
                    .inner
                    .run_outcomes
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| RunOutcome::rows(&["ok"], vec![]));
                match outcome.failure {
                    Some((code, msg)) => {
                        peer.failed = true;
                        send(&mut peer, failure(&code, &msg)).await?;
                    }
                    None => {
                        let mut meta = HashMap::new();
                        meta.insert(
                            "fields".to_string(),
                            Value::List(
                                outcome.fields.iter().map(|f| f.as_str().into()).collect(),
                            ),
                        );
                        meta.insert("t_first".to_string(), Value::Integer(1));
                        peer.pending =
                            Some((outcome.records.into(), outcome.summary));
                        send(&mut peer, success(meta)).await?;
                    }
                }
            }
            tag::PULL | tag::DISCARD => {
                let Some((mut records, summary)) = peer.pending.take() else {
                    peer.failed = true;
                    send(
                        &mut peer,
                        failure("Neo.ClientError.Request.Invalid", "nothing to stream"),
                    )
                    .await?;
                    continue;
                };
                let n = streaming_n(script.inner.version, &script);
                let mut remaining = if message_tag == tag::DISCARD {
                    records.clear();
                    0
                } else if n < 0 {
                    records.len()
                } else {
                    (n as usize).min(records.len())
                };
                while remaining > 0 {
                    let row = records.pop_front().unwrap();
                    send(&mut peer, record(row)).await?;
                    remaining -= 1;
                }
                if records.is_empty() {
                    let mut meta: HashMap<String, Value> = summary.iter().cloned().collect();
                    meta.entry("t_last".to_string())
                        .or_insert(Value::Integer(1));
                    meta.entry("type".to_string()).or_insert(Value::from("r"));
                    send(&mut peer, success(meta)).await?;
                } else {
                    peer.pending = Some((records, summary));
                    let mut meta = HashMap::new();
                    meta.insert("has_more".to_string(), Value::Boolean(true));
                    send(&mut peer, success(meta)).await?;
                }
            }
            other => {
                peer.failed = true;
                send(
                    &mut peer,
                    failure(
                        "Neo.ClientError.Request.Invalid",
                        &format!("unexpected message 0x{other:02X}"),
                    ),
                )
                .await?;
            }
        }
    }
}

/// n of the most recent PULL, read back from the received log; Bolt 3 has
/// no n and always streams everything.
fn streaming_n(version: BoltVersion, script: &Script) -> i64 {
    if !version.supports_qid() {
        return -1;
    }
    script
        .inner
        .received
        .lock()
        .iter()
        .rev()
        .find(|s| s.tag == tag::PULL)
        .and_then(|s| s.field(0)?.as_map()?.get("n")?.as_int())
        .unwrap_or(-1)
}

async fn read_message(peer: &mut Peer) -> std::io::Result<Option<Structure>> {
    let mut payload = Vec::new();
    loop {
        // Parse complete chunks already buffered.
        while peer.buf.len() >= 2 {
            let len = u16::from_be_bytes([peer.buf[0], peer.buf[1]]) as usize;
            if peer.buf.len() < 2 + len {
                break;
            }
            let _ = peer.buf.split_to(2);
            if len == 0 {
                if payload.is_empty() {
                    continue; // NOOP keep-alive between messages
                }
                let value = decode(&payload).expect("test client sent malformed packstream");
                match value {
                    Value::Structure(s) => return Ok(Some(s)),
                    other => panic!("test client sent non-structure message {other:?}"),
                }
            }
            payload.extend_from_slice(&peer.buf.split_to(len));
        }
        if peer.socket.read_buf(&mut peer.buf).await? == 0 {
            return Ok(None);
        }
    }
}

async fn send(peer: &mut Peer, response: Structure) -> std::io::Result<()> {
    let payload = encode(&Value::Structure(response)).expect("encodable response");
    let mut framed = BytesMut::new();
    MessageCodec::write_chunked(&payload, &mut framed);
    peer.socket.write_all(&framed).await?;
    peer.socket.flush().await
}

fn success(metadata: HashMap<String, Value>) -> Structure {
    Structure::new(tag::SUCCESS, vec![Value::Map(metadata)])
}

fn failure(code: &str, message: &str) -> Structure {
    let mut metadata = HashMap::new();
    metadata.insert("code".to_string(), code.into());
    metadata.insert("message".to_string(), message.into());
    Structure::new(tag::FAILURE, vec![Value::Map(metadata)])
}

fn record(row: Vec<Value>) -> Structure {
    Structure::new(tag::RECORD, vec![Value::List(row)])
}

fn ignored() -> Structure {
    Structure::new(tag::IGNORED, vec![])
}
