//! Driver error taxonomy.
//!
//! Server FAILURE codes of the form `Neo.Kind.Category.Title` are translated
//! into typed kinds through an explicit longest-wildcard-match table: an
//! exact entry always beats a wildcard, and of two matching wildcards the
//! longer prefix wins. Codes outside the table keep their raw code and
//! message under [`ServerErrorKind::Unknown`].

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::bolt::message::Failure;
use crate::bolt::packstream::{PackStreamError, Value};

pub type Result<T> = std::result::Result<T, Error>;

/// All errors surfaced by the driver.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller-supplied invalid input or local misuse. Fatal.
    #[error("client error: {0}")]
    Client(String),

    /// A FAILURE response, translated through the code table.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// No suitable server could be reached. Retryable at transaction level.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A routed reader/writer is no longer valid for its role. Retryable
    /// once the address has been forgotten.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// The wire format was violated on either side; the connection is
    /// destroyed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS or authentication setup failure. Not retryable.
    #[error("security error: {0}")]
    Security(String),

    /// A value could not be represented in PackStream.
    #[error("encoding error: {0}")]
    Encoding(PackStreamError),

    /// The pool could not hand out a connection within the acquisition
    /// timeout.
    #[error("connection acquisition timed out after {0:?}")]
    AcquisitionTimeout(Duration),

    /// TCP/TLS establishment exceeded the connection timeout.
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The server accepted none of the proposed Bolt versions.
    #[error("handshake rejected: no mutually supported Bolt version")]
    UnsupportedVersion,

    /// The retry budget ran out; earlier retryable failures ride along.
    #[error("transaction retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<Error>,
        suppressed: Vec<Error>,
    },
}

impl Error {
    /// Whether the retry engine may replay a transaction after this error.
    /// Acquisition timeouts are handled separately (first attempt only).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable(_) | Error::SessionExpired(_) => true,
            Error::Server(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn broken_connection(context: &str) -> Self {
        Error::ServiceUnavailable(format!("connection broken: {context}"))
    }
}

impl From<PackStreamError> for Error {
    fn from(e: PackStreamError) -> Self {
        match e {
            // Encode-side: the value was unrepresentable.
            PackStreamError::TooLarge(..) | PackStreamError::StructArity { .. } => {
                Error::Encoding(e)
            }
            // Decode-side: the peer violated the format.
            other => Error::Protocol(other.to_string()),
        }
    }
}

/// Typed classification of a server FAILURE code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// `Neo.ClientError.*`: the request was wrong. Fatal.
    Client,
    /// `Neo.ClientError.Security.*`: authentication/authorization. Fatal.
    Security,
    /// `Neo.ClientError.Security.AuthorizationExpired`: retryable after the
    /// server re-authenticates the connection.
    AuthorizationExpired,
    /// `Neo.TransientError.*`: momentary server-side condition. Retryable.
    Transient,
    /// Writes were sent to a server that is not the leader.
    NotALeader,
    /// Writes were sent to a read-only server.
    ForbiddenOnReadOnlyDatabase,
    /// `Neo.DatabaseError.*`: server-internal failure. Fatal, surfaced
    /// verbatim.
    Database,
    /// Code absent from the table; raw code and message are preserved.
    Unknown,
}

/// A FAILURE response translated into driver terms.
#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct ServerError {
    pub code: String,
    pub message: String,
    pub kind: ServerErrorKind,
    /// GQL cause metadata passed through untouched (Bolt 5.7+).
    pub gql_cause: Option<HashMap<String, Value>>,
}

/// Classification table. Entries without a trailing `.*` are exact; order is
/// irrelevant because matching picks exact first, then the longest wildcard.
const CODE_TABLE: &[(&str, ServerErrorKind)] = &[
    ("Neo.ClientError.Security.AuthorizationExpired", ServerErrorKind::AuthorizationExpired),
    ("Neo.ClientError.Cluster.NotALeader", ServerErrorKind::NotALeader),
    ("Neo.ClientError.General.ForbiddenOnReadOnlyDatabase", ServerErrorKind::ForbiddenOnReadOnlyDatabase),
    ("Neo.ClientError.Security.*", ServerErrorKind::Security),
    ("Neo.ClientError.*", ServerErrorKind::Client),
    ("Neo.TransientError.*", ServerErrorKind::Transient),
    ("Neo.DatabaseError.*", ServerErrorKind::Database),
];

fn classify(code: &str) -> ServerErrorKind {
    let mut best: Option<(usize, ServerErrorKind)> = None;
    for (pattern, kind) in CODE_TABLE {
        match pattern.strip_suffix("*") {
            None => {
                if *pattern == code {
                    return *kind;
                }
            }
            Some(prefix) => {
                if code.starts_with(prefix) && best.map_or(true, |(len, _)| prefix.len() > len) {
                    best = Some((prefix.len(), *kind));
                }
            }
        }
    }
    best.map_or(ServerErrorKind::Unknown, |(_, kind)| kind)
}

impl ServerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let kind = classify(&code);
        Self {
            code,
            message: message.into(),
            kind,
            gql_cause: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ServerErrorKind::Transient
                | ServerErrorKind::AuthorizationExpired
                | ServerErrorKind::NotALeader
                | ServerErrorKind::ForbiddenOnReadOnlyDatabase
        )
    }

    /// Errors that invalidate the address for its routing role.
    pub fn invalidates_writer(&self) -> bool {
        matches!(
            self.kind,
            ServerErrorKind::NotALeader | ServerErrorKind::ForbiddenOnReadOnlyDatabase
        )
    }

    /// `Neo.TransientError.General.DatabaseUnavailable` invalidates the
    /// address for every role.
    pub fn invalidates_server(&self) -> bool {
        self.code == "Neo.TransientError.General.DatabaseUnavailable"
    }

    /// Errors that mean the presented auth token is no longer good; a
    /// managed token source should produce a fresh one.
    pub fn invalidates_token(&self) -> bool {
        self.kind == ServerErrorKind::AuthorizationExpired
            || self.code == "Neo.ClientError.Security.TokenExpired"
    }
}

impl From<Failure> for ServerError {
    fn from(f: Failure) -> Self {
        let kind = classify(&f.code);
        Self {
            code: f.code,
            message: f.message,
            kind,
            gql_cause: f.gql_cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_entry_beats_wildcard() {
        assert_eq!(
            classify("Neo.ClientError.Security.AuthorizationExpired"),
            ServerErrorKind::AuthorizationExpired
        );
        assert_eq!(
            classify("Neo.ClientError.Cluster.NotALeader"),
            ServerErrorKind::NotALeader
        );
    }

    #[test]
    fn longer_wildcard_beats_shorter() {
        // Matches both Neo.ClientError.* and Neo.ClientError.Security.*.
        assert_eq!(
            classify("Neo.ClientError.Security.Unauthorized"),
            ServerErrorKind::Security
        );
        assert_eq!(
            classify("Neo.ClientError.Statement.SyntaxError"),
            ServerErrorKind::Client
        );
    }

    #[test]
    fn broad_kinds() {
        assert_eq!(
            classify("Neo.TransientError.Transaction.DeadlockDetected"),
            ServerErrorKind::Transient
        );
        assert_eq!(
            classify("Neo.DatabaseError.General.UnknownError"),
            ServerErrorKind::Database
        );
    }

    #[test]
    fn unknown_codes_keep_raw_identity() {
        let err = ServerError::new("Vendor.Odd.Code", "strange");
        assert_eq!(err.kind, ServerErrorKind::Unknown);
        assert_eq!(err.code, "Vendor.Odd.Code");
        assert_eq!(err.to_string(), "Vendor.Odd.Code: strange");
    }

    #[test]
    fn retryability() {
        assert!(ServerError::new("Neo.TransientError.General.Whatever", "").is_retryable());
        assert!(
            ServerError::new("Neo.ClientError.Security.AuthorizationExpired", "").is_retryable()
        );
        assert!(ServerError::new("Neo.ClientError.Cluster.NotALeader", "").is_retryable());
        assert!(!ServerError::new("Neo.ClientError.Statement.SyntaxError", "").is_retryable());
        assert!(!ServerError::new("Neo.DatabaseError.General.UnknownError", "").is_retryable());
        assert!(!ServerError::new("Neo.ClientError.Security.Unauthorized", "").is_retryable());

        assert!(Error::ServiceUnavailable("down".into()).is_retryable());
        assert!(Error::SessionExpired("stale".into()).is_retryable());
        assert!(!Error::Client("bad".into()).is_retryable());
        assert!(!Error::Protocol("garbled".into()).is_retryable());
    }

    #[test]
    fn token_invalidation_rules() {
        assert!(
            ServerError::new("Neo.ClientError.Security.AuthorizationExpired", "")
                .invalidates_token()
        );
        assert!(ServerError::new("Neo.ClientError.Security.TokenExpired", "").invalidates_token());
        assert!(!ServerError::new("Neo.ClientError.Security.Unauthorized", "").invalidates_token());
    }

    #[test]
    fn routing_invalidation_rules() {
        assert!(ServerError::new("Neo.ClientError.Cluster.NotALeader", "").invalidates_writer());
        assert!(ServerError::new("Neo.ClientError.General.ForbiddenOnReadOnlyDatabase", "")
            .invalidates_writer());
        let db_down = ServerError::new("Neo.TransientError.General.DatabaseUnavailable", "");
        assert!(db_down.invalidates_server());
        assert!(!db_down.invalidates_writer());
    }

    #[test]
    fn packstream_error_split() {
        let encode_side: Error = PackStreamError::TooLarge("string", 1 << 40).into();
        assert!(matches!(encode_side, Error::Encoding(_)));

        let decode_side: Error = PackStreamError::UnknownMarker(0xC7).into();
        assert!(matches!(decode_side, Error::Protocol(_)));
    }
}
