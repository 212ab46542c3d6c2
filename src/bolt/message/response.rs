//! Response messages.

use std::collections::HashMap;

use super::tag;
use crate::bolt::packstream::{PackStreamError, Structure, Value};

/// All response messages.
#[derive(Debug, Clone)]
pub enum Response {
    Success(Success),
    Record(Vec<Value>),
    Failure(Failure),
    Ignored,
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Success(_) => "SUCCESS",
            Response::Record(_) => "RECORD",
            Response::Failure(_) => "FAILURE",
            Response::Ignored => "IGNORED",
        }
    }

    pub fn from_structure(s: Structure) -> Result<Self, PackStreamError> {
        match s.tag {
            tag::SUCCESS => {
                let metadata = match s.fields.into_iter().next() {
                    Some(Value::Map(m)) => m,
                    None => HashMap::new(),
                    Some(_) => {
                        return Err(PackStreamError::InvalidStructure("SUCCESS".to_string()))
                    }
                };
                Ok(Response::Success(Success { metadata }))
            }
            tag::RECORD => match s.fields.into_iter().next() {
                Some(Value::List(fields)) => Ok(Response::Record(fields)),
                _ => Err(PackStreamError::InvalidStructure("RECORD".to_string())),
            },
            tag::FAILURE => {
                let metadata = match s.fields.into_iter().next() {
                    Some(Value::Map(m)) => m,
                    _ => return Err(PackStreamError::InvalidStructure("FAILURE".to_string())),
                };
                Ok(Response::Failure(Failure::from_metadata(metadata)?))
            }
            tag::IGNORED => Ok(Response::Ignored),
            other => Err(PackStreamError::InvalidStructure(format!(
                "response with signature 0x{other:02X}"
            ))),
        }
    }

    /// Test helper: responses are normally only decoded by the client; the
    /// scripted-server tests need to produce them.
    #[cfg(test)]
    pub fn to_structure(&self) -> Structure {
        match self {
            Response::Success(success) => Structure::new(
                tag::SUCCESS,
                vec![Value::Map(success.metadata.clone())],
            ),
            Response::Record(fields) => {
                Structure::new(tag::RECORD, vec![Value::List(fields.clone())])
            }
            Response::Failure(failure) => {
                let mut metadata = HashMap::new();
                metadata.insert("code".to_string(), failure.code.as_str().into());
                metadata.insert("message".to_string(), failure.message.as_str().into());
                Structure::new(tag::FAILURE, vec![Value::Map(metadata)])
            }
            Response::Ignored => Structure::new(tag::IGNORED, vec![]),
        }
    }
}

/// SUCCESS metadata with accessors for the keys the driver consumes.
#[derive(Debug, Clone, Default)]
pub struct Success {
    pub metadata: HashMap<String, Value>,
}

impl Success {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Column names from a RUN success.
    pub fn fields(&self) -> Option<Vec<String>> {
        self.metadata.get("fields")?.as_string_list()
    }

    /// Result handle inside an explicit transaction.
    pub fn qid(&self) -> Option<i64> {
        self.metadata.get("qid")?.as_int()
    }

    /// Whether the stream has records beyond the last PULL batch.
    pub fn has_more(&self) -> bool {
        self.metadata
            .get("has_more")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn bookmark(&self) -> Option<&str> {
        self.metadata.get("bookmark")?.as_str()
    }

    pub fn server_agent(&self) -> Option<&str> {
        self.metadata.get("server")?.as_str()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.metadata.get("connection_id")?.as_str()
    }

    /// Capability patches the server accepted from HELLO's patch_bolt.
    pub fn accepted_patches(&self) -> Vec<String> {
        self.metadata
            .get("patch_bolt")
            .and_then(Value::as_string_list)
            .unwrap_or_default()
    }

    pub fn db(&self) -> Option<&str> {
        self.metadata.get("db")?.as_str()
    }

    /// Millis until the first record was available (RUN success).
    pub fn t_first(&self) -> Option<i64> {
        self.metadata.get("t_first")?.as_int()
    }

    /// Millis until the stream was exhausted (terminal success).
    pub fn t_last(&self) -> Option<i64> {
        self.metadata.get("t_last")?.as_int()
    }

    pub fn query_type(&self) -> Option<&str> {
        self.metadata.get("type")?.as_str()
    }

    pub fn stats(&self) -> Option<&HashMap<String, Value>> {
        self.metadata.get("stats")?.as_map()
    }

    pub fn notifications(&self) -> Option<&[Value]> {
        self.metadata.get("notifications")?.as_list()
    }

    /// Routing table payload of a ROUTE success.
    pub fn routing_table(&self) -> Option<&HashMap<String, Value>> {
        self.metadata.get("rt")?.as_map()
    }
}

/// FAILURE: a server error code, a human-readable message, and (Bolt 5.7+)
/// an optional GQL cause chain carried verbatim.
#[derive(Debug, Clone)]
pub struct Failure {
    pub code: String,
    pub message: String,
    pub gql_cause: Option<HashMap<String, Value>>,
}

impl Failure {
    fn from_metadata(mut metadata: HashMap<String, Value>) -> Result<Self, PackStreamError> {
        let code = metadata
            .get("code")
            .and_then(Value::as_str)
            // 5.7 GQL failures carry neo4j_code instead.
            .or_else(|| metadata.get("neo4j_code").and_then(Value::as_str))
            .ok_or_else(|| PackStreamError::InvalidStructure("FAILURE code".to_string()))?
            .to_string();
        let message = metadata
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let gql_cause = match metadata.remove("cause") {
            Some(Value::Map(cause)) => Some(cause),
            _ => None,
        };
        Ok(Self {
            code,
            message,
            gql_cause,
        })
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_with(entries: &[(&str, Value)]) -> Success {
        let metadata = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Success { metadata }
    }

    #[test]
    fn parse_success_without_metadata() {
        let response = Response::from_structure(Structure::new(tag::SUCCESS, vec![])).unwrap();
        assert!(matches!(response, Response::Success(s) if s.metadata.is_empty()));
    }

    #[test]
    fn parse_record() {
        let s = Structure::new(
            tag::RECORD,
            vec![Value::List(vec![Value::Integer(1), "a".into()])],
        );
        match Response::from_structure(s).unwrap() {
            Response::Record(fields) => assert_eq!(fields.len(), 2),
            other => panic!("expected record, got {}", other.name()),
        }
    }

    #[test]
    fn record_without_field_list_is_malformed() {
        let s = Structure::new(tag::RECORD, vec![]);
        assert!(Response::from_structure(s).is_err());
    }

    #[test]
    fn parse_failure_with_code_and_message() {
        let mut metadata = HashMap::new();
        metadata.insert(
            "code".to_string(),
            "Neo.ClientError.Statement.SyntaxError".into(),
        );
        metadata.insert("message".to_string(), "bad input".into());
        let s = Structure::new(tag::FAILURE, vec![Value::Map(metadata)]);
        match Response::from_structure(s).unwrap() {
            Response::Failure(failure) => {
                assert_eq!(failure.code, "Neo.ClientError.Statement.SyntaxError");
                assert_eq!(failure.message, "bad input");
                assert!(failure.gql_cause.is_none());
            }
            other => panic!("expected failure, got {}", other.name()),
        }
    }

    #[test]
    fn gql_failure_uses_neo4j_code_and_keeps_cause() {
        let mut cause = HashMap::new();
        cause.insert("gql_status".to_string(), "22N01".into());
        let mut metadata = HashMap::new();
        metadata.insert(
            "neo4j_code".to_string(),
            "Neo.ClientError.Statement.ArgumentError".into(),
        );
        metadata.insert("message".to_string(), "wrong type".into());
        metadata.insert("cause".to_string(), Value::Map(cause));
        let s = Structure::new(tag::FAILURE, vec![Value::Map(metadata)]);
        match Response::from_structure(s).unwrap() {
            Response::Failure(failure) => {
                assert_eq!(failure.code, "Neo.ClientError.Statement.ArgumentError");
                assert!(failure.gql_cause.is_some());
            }
            other => panic!("expected failure, got {}", other.name()),
        }
    }

    #[test]
    fn unknown_signature_rejected() {
        let s = Structure::new(0x55, vec![]);
        assert!(Response::from_structure(s).is_err());
    }

    #[test]
    fn success_accessors() {
        let success = success_with(&[
            (
                "fields",
                Value::List(vec!["name".into(), "age".into()]),
            ),
            ("qid", Value::Integer(7)),
            ("has_more", Value::Boolean(true)),
            ("bookmark", "bm:tx99".into()),
            ("server", "Neo4j/5.13.0".into()),
            ("t_first", Value::Integer(3)),
        ]);
        assert_eq!(success.fields().unwrap(), ["name", "age"]);
        assert_eq!(success.qid(), Some(7));
        assert!(success.has_more());
        assert_eq!(success.bookmark(), Some("bm:tx99"));
        assert_eq!(success.server_agent(), Some("Neo4j/5.13.0"));
        assert_eq!(success.t_first(), Some(3));
        assert!(success.stats().is_none());

        let empty = Success::default();
        assert!(!empty.has_more());
        assert!(empty.fields().is_none());
    }
}
