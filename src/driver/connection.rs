//! A single Bolt connection: socket, state machine, and request pipeline.
//!
//! A connection is exclusively owned at all times, by the pool while idle
//! and by at most one session, transaction or cursor while leased. All
//! methods therefore take `&mut self` and nothing here locks.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_util::codec::Decoder as _;
use tracing::{debug, warn};

use crate::bolt::codec::MessageCodec;
use crate::bolt::handshake::{self, BoltVersion};
use crate::bolt::message::{Hello, Logon, Request, RequestKind, Response, Success};
use crate::bolt::packstream::{Encoder, Value};
use crate::error::{Error, Result};

use super::driver::ServerAddress;
use super::pipeline::{Dispatched, IgnoreOutcome, Outcome, ResponseHandler, ResponsePipeline};
use super::tls::TlsClient;

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// Handshake done, HELLO/LOGON outstanding.
    Negotiating,
    /// Authenticated, outside any transaction or stream.
    Ready,
    /// An auto-commit result is streaming.
    Streaming,
    /// Inside an explicit transaction, no open stream.
    TxReady,
    /// Inside an explicit transaction with an open stream.
    TxStreaming,
    /// The server reported FAILURE; only RESET makes progress.
    Failed,
    /// The connection is unusable and must be discarded.
    Defunct,
}

/// The duplex byte stream under a connection.
pub(crate) enum BoltStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    #[cfg(test)]
    InMemory(tokio::io::DuplexStream),
}

impl AsyncRead for BoltStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BoltStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BoltStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(test)]
            BoltStream::InMemory(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BoltStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            BoltStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            BoltStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(test)]
            BoltStream::InMemory(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BoltStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BoltStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(test)]
            BoltStream::InMemory(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BoltStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BoltStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(test)]
            BoltStream::InMemory(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Everything needed to dial and authenticate a new connection.
#[derive(Clone)]
pub(crate) struct ConnectOptions {
    pub user_agent: String,
    pub auth: HashMap<String, Value>,
    pub auth_generation: u64,
    /// Routing context for HELLO; present on routing URIs only.
    pub routing_context: Option<HashMap<String, Value>>,
    pub connect_timeout: Duration,
    pub keep_alive: bool,
    pub ipv6_enabled: bool,
    pub tls: Option<Arc<TlsClient>>,
}

/// A slot a [`SummaryHandler`] fills with its terminal response.
#[derive(Clone, Default)]
pub(crate) struct SummarySlot(Arc<parking_lot::Mutex<Option<Result<Success>>>>);

impl SummarySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the outcome; a still-empty slot means the connection died before
    /// the response arrived.
    pub fn take_result(&self) -> Result<Success> {
        self.0
            .lock()
            .take()
            .unwrap_or_else(|| Err(Error::broken_connection("response never arrived")))
    }
}

/// Handler for requests with a single terminal response and no records.
pub(crate) struct SummaryHandler {
    slot: SummarySlot,
}

impl SummaryHandler {
    pub fn boxed(slot: &SummarySlot) -> Box<dyn ResponseHandler> {
        Box::new(Self { slot: slot.clone() })
    }
}

impl ResponseHandler for SummaryHandler {
    fn on_success(&mut self, success: Success) {
        *self.slot.0.lock() = Some(Ok(success));
    }

    fn on_record(&mut self, _: Vec<Value>) {
        *self.slot.0.lock() = Some(Err(Error::Protocol(
            "unexpected RECORD for a summary-only request".to_string(),
        )));
    }

    fn on_failure(&mut self, error: Error) {
        *self.slot.0.lock() = Some(Err(error));
    }

    fn on_ignored(&mut self, error: Option<Error>) {
        *self.slot.0.lock() = Some(Err(error.unwrap_or_else(|| {
            Error::Client("request ignored: the connection was reset while it was pending".into())
        })));
    }
}

/// One Bolt connection.
pub(crate) struct Connection {
    stream: BoltStream,
    codec: MessageCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    pipeline: ResponsePipeline,
    state: ConnectionState,
    version: BoltVersion,
    address: ServerAddress,
    server_agent: Option<String>,
    connection_id: Option<String>,
    /// UTC temporal encoding active (5.0+ native, 4.3/4.4 via patch).
    utc: bool,
    auth_generation: u64,
    created_at: Instant,
    last_used: Instant,
}

impl Connection {
    /// Dial, handshake and authenticate a new connection. TCP and TLS
    /// establishment plus the handshake run under the connect timeout; the
    /// HELLO exchange is bounded by the server.
    pub(crate) async fn open(address: &ServerAddress, opts: ConnectOptions) -> Result<Self> {
        let dial = async {
            let mut stream = Self::dial(address, &opts).await?;
            stream.write_all(&handshake::request()).await?;
            stream.flush().await?;
            let mut reply = [0u8; handshake::REPLY_SIZE];
            stream.read_exact(&mut reply).await?;
            let version = handshake::parse_reply(reply).ok_or(Error::UnsupportedVersion)?;
            Ok::<_, Error>((stream, version))
        };
        let (stream, version) = tokio::time::timeout(opts.connect_timeout, dial)
            .await
            .map_err(|_| Error::ConnectTimeout(opts.connect_timeout))??;
        debug!(address = %address, version = %version, "bolt connection negotiated");

        let now = Instant::now();
        let mut conn = Self {
            stream,
            codec: MessageCodec::new(),
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(8192),
            pipeline: ResponsePipeline::new(),
            state: ConnectionState::Negotiating,
            version,
            address: address.clone(),
            server_agent: None,
            connection_id: None,
            utc: version >= BoltVersion::V5_0,
            auth_generation: opts.auth_generation,
            created_at: now,
            last_used: now,
        };
        conn.authenticate(&opts).await?;
        debug!(
            address = %conn.address,
            server = conn.server_agent.as_deref().unwrap_or("unknown"),
            connection_id = conn.connection_id.as_deref().unwrap_or(""),
            "bolt connection authenticated"
        );
        Ok(conn)
    }

    async fn dial(address: &ServerAddress, opts: &ConnectOptions) -> Result<BoltStream> {
        let mut last_err: Option<std::io::Error> = None;
        let mut candidates = 0usize;
        for addr in lookup_host((address.host.as_str(), address.port)).await? {
            if addr.is_ipv6() && !opts.ipv6_enabled {
                continue;
            }
            candidates += 1;
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }?;
            socket.set_keepalive(opts.keep_alive)?;
            match socket.connect(addr).await {
                Ok(tcp) => {
                    tcp.set_nodelay(true)?;
                    return match opts.tls {
                        Some(ref tls) => {
                            let negotiated = tls.connect(&address.host, tcp).await?;
                            Ok(BoltStream::Tls(Box::new(negotiated)))
                        }
                        None => Ok(BoltStream::Plain(tcp)),
                    };
                }
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e.into()),
            None if candidates == 0 => Err(Error::ServiceUnavailable(format!(
                "no usable address for {address} (IPv6 disabled?)"
            ))),
            None => Err(Error::ServiceUnavailable(format!("{address} did not resolve"))),
        }
    }

    /// HELLO, plus a pipelined LOGON on 5.1+ so authentication costs no
    /// extra round trip.
    async fn authenticate(&mut self, opts: &ConnectOptions) -> Result<()> {
        let hello = Hello {
            user_agent: opts.user_agent.clone(),
            auth: opts.auth.clone(),
            routing: opts.routing_context.clone(),
            patch_bolt: if self.version.needs_utc_patch() {
                vec!["utc".to_string()]
            } else {
                vec![]
            },
        };
        let hello_slot = SummarySlot::new();
        self.enqueue(Request::Hello(hello), SummaryHandler::boxed(&hello_slot))?;

        let logon_slot = if self.version.supports_logon() {
            let slot = SummarySlot::new();
            self.enqueue(
                Request::Logon(Logon {
                    auth: opts.auth.clone(),
                }),
                SummaryHandler::boxed(&slot),
            )?;
            Some(slot)
        } else {
            None
        };

        self.sync().await?;

        let success = hello_slot.take_result().map_err(auth_error)?;
        self.server_agent = success.server_agent().map(String::from);
        self.connection_id = success.connection_id().map(String::from);
        if self.version.needs_utc_patch() {
            self.utc = success.accepted_patches().iter().any(|p| p == "utc");
        }
        if let Some(slot) = logon_slot {
            slot.take_result().map_err(auth_error)?;
        }
        Ok(())
    }

    /// Pipelined LOGOFF + LOGON with a rotated token (Bolt 5.1+).
    pub(crate) async fn reauthenticate(
        &mut self,
        auth: HashMap<String, Value>,
        generation: u64,
    ) -> Result<()> {
        if !self.version.supports_logon() {
            return Err(Error::Client(format!(
                "re-authentication requires Bolt 5.1+, connected at {}",
                self.version
            )));
        }
        let logoff_slot = SummarySlot::new();
        let logon_slot = SummarySlot::new();
        self.enqueue(Request::Logoff, SummaryHandler::boxed(&logoff_slot))?;
        self.enqueue(Request::Logon(Logon { auth }), SummaryHandler::boxed(&logon_slot))?;
        self.sync().await?;
        logoff_slot.take_result().map_err(auth_error)?;
        logon_slot.take_result().map_err(auth_error)?;
        self.auth_generation = generation;
        Ok(())
    }

    /// Encode a request into the write buffer and register its handler.
    /// Nothing reaches the socket until [`flush`](Self::flush).
    pub(crate) fn enqueue(
        &mut self,
        request: Request,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<()> {
        if self.state == ConnectionState::Defunct {
            return Err(Error::broken_connection("connection is defunct"));
        }
        let kind = request.kind();
        let mut encoder = Encoder::new();
        request.encode(self.version, &mut encoder)?;
        MessageCodec::write_chunked(encoder.as_bytes(), &mut self.write_buf);
        if kind.expects_response() {
            self.pipeline.push(kind, handler);
        }
        Ok(())
    }

    /// Force buffered requests onto the wire.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let outgoing: Bytes = self.write_buf.split().freeze();
        if let Err(e) = self.stream.write_all(&outgoing).await {
            self.defunct("write failed");
            return Err(e.into());
        }
        if let Err(e) = self.stream.flush().await {
            self.defunct("flush failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Flush, then dispatch responses until every pending handler has
    /// completed. Server FAILUREs are delivered to handlers and do not
    /// surface here; only transport and protocol faults do.
    pub(crate) async fn sync(&mut self) -> Result<()> {
        self.flush().await?;
        while !self.pipeline.is_empty() {
            self.dispatch_one().await?;
        }
        Ok(())
    }

    async fn dispatch_one(&mut self) -> Result<()> {
        let response = self.read_response().await?;
        match self.pipeline.dispatch(response) {
            Ok(Dispatched::Record) => Ok(()),
            Ok(Dispatched::Complete { kind, outcome }) => {
                self.apply_transition(kind, outcome);
                Ok(())
            }
            Err(e) => {
                self.defunct("response without pending request");
                Err(e)
            }
        }
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => {}
                Err(e) => {
                    self.defunct("malformed frame");
                    return Err(e);
                }
            }
            match self.stream.read_buf(&mut self.read_buf).await {
                Ok(0) => {
                    self.defunct("peer closed the connection");
                    return Err(Error::broken_connection("peer closed the connection"));
                }
                Ok(_) => {}
                Err(e) => {
                    self.defunct("read failed");
                    return Err(e.into());
                }
            }
        }
    }

    fn apply_transition(&mut self, kind: RequestKind, outcome: Outcome) {
        use ConnectionState::*;
        let next = match outcome {
            Outcome::Failure => match kind {
                // A failed HELLO/LOGON/LOGOFF or RESET leaves nothing to
                // salvage.
                RequestKind::Hello
                | RequestKind::Logon
                | RequestKind::Logoff
                | RequestKind::Reset => Defunct,
                _ => Failed,
            },
            Outcome::Ignored => self.state,
            Outcome::Success { has_more } => match kind {
                RequestKind::Hello => {
                    if self.version.supports_logon() {
                        Negotiating
                    } else {
                        Ready
                    }
                }
                RequestKind::Logon => Ready,
                RequestKind::Logoff => Negotiating,
                RequestKind::Reset => {
                    self.pipeline.clear_sticky();
                    Ready
                }
                RequestKind::Run => match self.state {
                    TxReady | TxStreaming => TxStreaming,
                    _ => Streaming,
                },
                RequestKind::Pull | RequestKind::Discard => {
                    if has_more {
                        self.state
                    } else {
                        match self.state {
                            TxStreaming => TxReady,
                            Streaming => Ready,
                            s => s,
                        }
                    }
                }
                RequestKind::Begin => TxReady,
                RequestKind::Commit | RequestKind::Rollback => Ready,
                RequestKind::Route | RequestKind::Telemetry | RequestKind::Goodbye => self.state,
            },
        };
        self.state = next;
        if next == Defunct {
            self.pipeline
                .poison(|| Error::broken_connection("connection became defunct"));
        }
    }

    /// RESET: flush anything already queued, then send RESET alone and drain
    /// the pipeline. Converges to Ready or leaves the connection Defunct.
    pub(crate) async fn reset(&mut self) -> Result<()> {
        self.flush().await?;
        let slot = SummarySlot::new();
        self.enqueue(Request::Reset, SummaryHandler::boxed(&slot))?;
        self.sync().await?;
        slot.take_result()?;
        Ok(())
    }

    /// Best-effort GOODBYE, then drop the socket.
    pub(crate) async fn close(mut self) {
        if self.state != ConnectionState::Defunct {
            let _ = self.enqueue(Request::Goodbye, Box::new(IgnoreOutcome));
            let _ = self.flush().await;
        }
        let _ = self.stream.shutdown().await;
    }

    fn defunct(&mut self, context: &str) {
        if self.state != ConnectionState::Defunct {
            warn!(address = %self.address, context, "bolt connection defunct");
        }
        self.state = ConnectionState::Defunct;
        let reason = context.to_string();
        self.pipeline
            .poison(move || Error::broken_connection(&reason));
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.state == ConnectionState::Defunct
    }

    /// Whether the connection holds protocol state that must be cleared by
    /// RESET before it may serve another session.
    pub(crate) fn needs_reset(&self) -> bool {
        !self.pipeline.is_empty() || self.state != ConnectionState::Ready
    }

    pub(crate) fn version(&self) -> BoltVersion {
        self.version
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) fn server_agent(&self) -> Option<&str> {
        self.server_agent.as_deref()
    }

    /// UTC temporal encoding negotiated.
    pub(crate) fn utc(&self) -> bool {
        self.utc
    }

    pub(crate) fn auth_generation(&self) -> u64 {
        self.auth_generation
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn simulate_breakage(&mut self) {
        self.defunct("test-induced breakage");
    }

    #[cfg(test)]
    pub(crate) fn for_test(stream: tokio::io::DuplexStream, version: BoltVersion) -> Self {
        let now = Instant::now();
        Self {
            stream: BoltStream::InMemory(stream),
            codec: MessageCodec::new(),
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            pipeline: ResponsePipeline::new(),
            state: ConnectionState::Ready,
            version,
            address: ServerAddress::new("in-memory", 7687),
            server_agent: None,
            connection_id: None,
            utc: version >= BoltVersion::V5_0,
            auth_generation: 0,
            created_at: now,
            last_used: now,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("pending", &self.pipeline.len())
            .finish()
    }
}

/// Failures during HELLO/LOGON are authentication problems unless the
/// server says otherwise.
fn auth_error(e: Error) -> Error {
    match e {
        Error::Server(server) => Error::Server(server),
        Error::Client(msg) => Error::Security(msg),
        other => other,
    }
}
