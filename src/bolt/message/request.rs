//! Request messages and their version-aware encoding.
//!
//! The same logical request is laid out differently across Bolt versions
//! (extras keys, qid support, PULL n). Encoding therefore takes the
//! negotiated version; the session layer never sees those differences.

use std::collections::HashMap;
use std::time::Duration;

use super::tag;
use crate::bolt::handshake::BoltVersion;
use crate::bolt::packstream::{Encoder, PackStreamError, Value};

/// Transaction access mode. Write is the protocol default and is omitted
/// from extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    Write,
    Read,
}

impl AccessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::Read => "r",
            AccessMode::Write => "w",
        }
    }
}

/// Server-side notification filtering (Bolt 5.2+).
#[derive(Debug, Clone, Default)]
pub struct NotificationsConfig {
    /// "OFF", "WARNING" or "INFORMATION".
    pub minimum_severity: Option<String>,
    pub disabled_categories: Option<Vec<String>>,
}

/// Extras shared by BEGIN and auto-commit RUN. An auto-commit RUN is
/// BEGIN + RUN + COMMIT elided by the server, so both carry the same
/// transaction context.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    pub bookmarks: Vec<String>,
    pub tx_timeout: Option<Duration>,
    pub tx_metadata: HashMap<String, Value>,
    pub mode: AccessMode,
    pub database: Option<String>,
    pub imp_user: Option<String>,
    pub notifications: Option<NotificationsConfig>,
}

impl TxContext {
    fn write_into(&self, extra: &mut HashMap<String, Value>, version: BoltVersion) {
        if !self.bookmarks.is_empty() {
            extra.insert(
                "bookmarks".to_string(),
                Value::List(self.bookmarks.iter().map(|b| b.as_str().into()).collect()),
            );
        }
        if let Some(timeout) = self.tx_timeout {
            extra.insert(
                "tx_timeout".to_string(),
                Value::Integer(timeout.as_millis() as i64),
            );
        }
        if !self.tx_metadata.is_empty() {
            extra.insert(
                "tx_metadata".to_string(),
                Value::Map(self.tx_metadata.clone()),
            );
        }
        if self.mode == AccessMode::Read {
            extra.insert("mode".to_string(), "r".into());
        }
        // Named databases arrived with Bolt 4.0, impersonation with 4.4.
        if version >= BoltVersion::V4_1 {
            if let Some(ref db) = self.database {
                extra.insert("db".to_string(), db.as_str().into());
            }
        }
        if version >= BoltVersion::V4_4 {
            if let Some(ref user) = self.imp_user {
                extra.insert("imp_user".to_string(), user.as_str().into());
            }
        }
        if version.supports_notification_filters() {
            if let Some(ref notifications) = self.notifications {
                if let Some(ref severity) = notifications.minimum_severity {
                    extra.insert(
                        "notifications_minimum_severity".to_string(),
                        severity.as_str().into(),
                    );
                }
                if let Some(ref categories) = notifications.disabled_categories {
                    extra.insert(
                        "notifications_disabled_categories".to_string(),
                        Value::List(categories.iter().map(|c| c.as_str().into()).collect()),
                    );
                }
            }
        }
    }
}

/// HELLO — opens the logical connection.
#[derive(Debug, Clone)]
pub struct Hello {
    pub user_agent: String,
    /// Auth token entries; inlined into extras before Bolt 5.1, sent via
    /// LOGON afterwards.
    pub auth: HashMap<String, Value>,
    /// Routing context; present on routing schemes, absent on direct ones.
    pub routing: Option<HashMap<String, Value>>,
    /// Capability patches requested on 4.3/4.4 (currently just "utc").
    pub patch_bolt: Vec<String>,
}

impl Hello {
    fn extra(&self, version: BoltVersion) -> HashMap<String, Value> {
        let mut extra = HashMap::new();
        extra.insert("user_agent".to_string(), self.user_agent.as_str().into());
        if !version.supports_logon() {
            for (k, v) in &self.auth {
                extra.insert(k.clone(), v.clone());
            }
        }
        if let Some(ref routing) = self.routing {
            extra.insert("routing".to_string(), Value::Map(routing.clone()));
        }
        if version.needs_utc_patch() && !self.patch_bolt.is_empty() {
            extra.insert(
                "patch_bolt".to_string(),
                Value::List(self.patch_bolt.iter().map(|p| p.as_str().into()).collect()),
            );
        }
        extra
    }
}

/// LOGON — authenticates on Bolt 5.1+; also used for re-authentication
/// after a pipelined LOGOFF.
#[derive(Debug, Clone)]
pub struct Logon {
    pub auth: HashMap<String, Value>,
}

/// RUN — executes a query. `context` carries the auto-commit transaction
/// extras; inside an explicit transaction it is `None` and the extras map is
/// empty.
#[derive(Debug, Clone)]
pub struct Run {
    pub query: String,
    pub parameters: HashMap<String, Value>,
    pub context: Option<TxContext>,
}

impl Run {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            parameters: HashMap::new(),
            context: None,
        }
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_context(mut self, context: TxContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// PULL / DISCARD flow control: how many records (-1 = all) and, inside an
/// explicit transaction, which result (qid -1 = latest).
#[derive(Debug, Clone, Copy)]
pub struct Streaming {
    pub n: i64,
    pub qid: Option<i64>,
}

impl Streaming {
    pub fn all() -> Self {
        Self { n: -1, qid: None }
    }

    pub fn some(n: i64) -> Self {
        Self { n, qid: None }
    }

    pub fn with_qid(mut self, qid: i64) -> Self {
        self.qid = Some(qid);
        self
    }

    fn extra(&self) -> HashMap<String, Value> {
        let mut extra = HashMap::new();
        extra.insert("n".to_string(), Value::Integer(self.n));
        if let Some(qid) = self.qid {
            extra.insert("qid".to_string(), Value::Integer(qid));
        }
        extra
    }
}

/// BEGIN — opens an explicit transaction.
#[derive(Debug, Clone, Default)]
pub struct Begin {
    pub context: TxContext,
}

/// ROUTE — requests the routing table (Bolt 4.3+; older versions use the
/// routing procedure via RUN).
#[derive(Debug, Clone)]
pub struct Route {
    pub routing_context: HashMap<String, Value>,
    pub bookmarks: Vec<String>,
    pub database: Option<String>,
    pub imp_user: Option<String>,
}

/// TELEMETRY — reports which API drove the work (Bolt 5.4+).
#[derive(Debug, Clone, Copy)]
pub enum Telemetry {
    ManagedTransaction,
    UnmanagedTransaction,
    AutoCommit,
    DriverLevel,
}

impl Telemetry {
    fn api(self) -> i64 {
        match self {
            Telemetry::ManagedTransaction => 0,
            Telemetry::UnmanagedTransaction => 1,
            Telemetry::AutoCommit => 2,
            Telemetry::DriverLevel => 3,
        }
    }
}

/// All request messages.
#[derive(Debug, Clone)]
pub enum Request {
    Hello(Hello),
    Logon(Logon),
    Logoff,
    Goodbye,
    Reset,
    Run(Run),
    Discard(Streaming),
    Pull(Streaming),
    Begin(Begin),
    Commit,
    Rollback,
    Route(Route),
    Telemetry(Telemetry),
}

/// Request discriminant, used by the connection state machine and the
/// response pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Hello,
    Logon,
    Logoff,
    Goodbye,
    Reset,
    Run,
    Discard,
    Pull,
    Begin,
    Commit,
    Rollback,
    Route,
    Telemetry,
}

impl RequestKind {
    pub fn name(self) -> &'static str {
        match self {
            RequestKind::Hello => "HELLO",
            RequestKind::Logon => "LOGON",
            RequestKind::Logoff => "LOGOFF",
            RequestKind::Goodbye => "GOODBYE",
            RequestKind::Reset => "RESET",
            RequestKind::Run => "RUN",
            RequestKind::Discard => "DISCARD",
            RequestKind::Pull => "PULL",
            RequestKind::Begin => "BEGIN",
            RequestKind::Commit => "COMMIT",
            RequestKind::Rollback => "ROLLBACK",
            RequestKind::Route => "ROUTE",
            RequestKind::Telemetry => "TELEMETRY",
        }
    }

    /// GOODBYE is fire-and-forget; every other request gets exactly one
    /// terminal response.
    pub fn expects_response(self) -> bool {
        !matches!(self, RequestKind::Goodbye)
    }
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Hello(_) => RequestKind::Hello,
            Request::Logon(_) => RequestKind::Logon,
            Request::Logoff => RequestKind::Logoff,
            Request::Goodbye => RequestKind::Goodbye,
            Request::Reset => RequestKind::Reset,
            Request::Run(_) => RequestKind::Run,
            Request::Discard(_) => RequestKind::Discard,
            Request::Pull(_) => RequestKind::Pull,
            Request::Begin(_) => RequestKind::Begin,
            Request::Commit => RequestKind::Commit,
            Request::Rollback => RequestKind::Rollback,
            Request::Route(_) => RequestKind::Route,
            Request::Telemetry(_) => RequestKind::Telemetry,
        }
    }

    /// Encode for the negotiated version.
    pub fn encode(&self, version: BoltVersion, enc: &mut Encoder) -> Result<(), PackStreamError> {
        match self {
            Request::Hello(hello) => {
                let mut w = enc.begin_struct(tag::HELLO, 1)?;
                w.field_map(&hello.extra(version))?;
                w.finish()
            }
            Request::Logon(logon) => {
                let mut w = enc.begin_struct(tag::LOGON, 1)?;
                w.field_map(&logon.auth)?;
                w.finish()
            }
            Request::Logoff => enc.begin_struct(tag::LOGOFF, 0)?.finish(),
            Request::Goodbye => enc.begin_struct(tag::GOODBYE, 0)?.finish(),
            Request::Reset => enc.begin_struct(tag::RESET, 0)?.finish(),
            Request::Run(run) => {
                let mut extra = HashMap::new();
                if let Some(ref context) = run.context {
                    context.write_into(&mut extra, version);
                }
                let mut w = enc.begin_struct(tag::RUN, 3)?;
                w.field_string(&run.query)?;
                w.field_map(&run.parameters)?;
                w.field_map(&extra)?;
                w.finish()
            }
            Request::Pull(streaming) => Self::encode_streaming(tag::PULL, streaming, version, enc),
            Request::Discard(streaming) => {
                Self::encode_streaming(tag::DISCARD, streaming, version, enc)
            }
            Request::Begin(begin) => {
                let mut extra = HashMap::new();
                begin.context.write_into(&mut extra, version);
                let mut w = enc.begin_struct(tag::BEGIN, 1)?;
                w.field_map(&extra)?;
                w.finish()
            }
            Request::Commit => enc.begin_struct(tag::COMMIT, 0)?.finish(),
            Request::Rollback => enc.begin_struct(tag::ROLLBACK, 0)?.finish(),
            Request::Route(route) => {
                let bookmarks =
                    Value::List(route.bookmarks.iter().map(|b| b.as_str().into()).collect());
                let mut w = enc.begin_struct(tag::ROUTE, 3)?;
                w.field(&Value::Map(route.routing_context.clone()))?;
                w.field(&bookmarks)?;
                if version >= BoltVersion::V4_4 {
                    let mut extra = HashMap::new();
                    if let Some(ref db) = route.database {
                        extra.insert("db".to_string(), db.as_str().into());
                    }
                    if let Some(ref user) = route.imp_user {
                        extra.insert("imp_user".to_string(), user.as_str().into());
                    }
                    w.field_map(&extra)?;
                } else {
                    w.field(&route.database.as_deref().map(Value::from).unwrap_or(Value::Null))?;
                }
                w.finish()
            }
            Request::Telemetry(telemetry) => {
                let mut w = enc.begin_struct(tag::TELEMETRY, 1)?;
                w.field(&Value::Integer(telemetry.api()))?;
                w.finish()
            }
        }
    }

    /// Bolt 3.0 streams with bare PULL_ALL/DISCARD_ALL (no extras); 4.0+
    /// sends {n, qid}.
    fn encode_streaming(
        signature: u8,
        streaming: &Streaming,
        version: BoltVersion,
        enc: &mut Encoder,
    ) -> Result<(), PackStreamError> {
        if version.supports_qid() {
            let mut w = enc.begin_struct(signature, 1)?;
            w.field_map(&streaming.extra())?;
            w.finish()
        } else {
            enc.begin_struct(signature, 0)?.finish()
        }
    }
}
