//! User-facing values.
//!
//! [`Value`] is what queries take as parameters and records hand back.
//! Conversions to and from the wire representation live here; temporal
//! values convert through chrono. Whether datetimes use the UTC or the
//! legacy wire encoding is negotiated per connection and threaded through
//! the conversion functions.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::bolt::packstream::structures::{
    self as sig, WireDuration, WireNode, WirePath, WirePoint, WireRelationship,
    WireUnboundRelationship,
};
use crate::bolt::packstream::{Structure, Value as WireValue};
use crate::error::{Error, Result};

/// Days between 0001-01-01 (CE) and the Unix epoch.
const EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// A value in a record or a query parameter map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    Node(Node),
    Relationship(Relationship),
    Path(Path),
    Point(Point),
    Date(NaiveDate),
    /// Time of day with a UTC offset, kept in wire form.
    Time {
        nanoseconds: i64,
        offset_seconds: i32,
    },
    LocalTime(NaiveTime),
    DateTime(DateTime<FixedOffset>),
    /// Zoned datetime identified by a zone name. Seconds are kept as
    /// transmitted (UTC under the UTC encoding, wall-clock under the legacy
    /// one); resolving zone names needs a tz database the driver does not
    /// carry.
    DateTimeZoneId {
        seconds: i64,
        nanoseconds: i64,
        zone_id: String,
    },
    LocalDateTime(NaiveDateTime),
    Duration(Duration),
}

/// A graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub element_id: Option<String>,
    pub labels: Vec<String>,
    pub properties: HashMap<String, Value>,
}

/// A relationship with both endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: i64,
    pub element_id: Option<String>,
    pub start_node_id: i64,
    pub end_node_id: i64,
    pub typ: String,
    pub properties: HashMap<String, Value>,
}

/// A relationship as it appears inside a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnboundRelationship {
    pub id: i64,
    pub element_id: Option<String>,
    pub typ: String,
    pub properties: HashMap<String, Value>,
}

/// An alternating node/relationship walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    pub nodes: Vec<Node>,
    pub relationships: Vec<UnboundRelationship>,
    pub indices: Vec<i64>,
}

/// A spatial point; `z` distinguishes 3D from 2D.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub srid: i64,
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
}

/// Cypher's duration: calendar months and days plus exact seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Duration {
    pub months: i64,
    pub days: i64,
    pub seconds: i64,
    pub nanoseconds: i64,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Value::Node(n) => Some(n),
            _ => None,
        }
    }

    /// Convert a decoded wire value. `utc` selects the negotiated datetime
    /// encoding.
    pub(crate) fn from_wire(wire: WireValue, utc: bool) -> Result<Self> {
        Ok(match wire {
            WireValue::Null => Value::Null,
            WireValue::Boolean(b) => Value::Boolean(b),
            WireValue::Integer(i) => Value::Integer(i),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::String(s) => Value::String(s),
            WireValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| Self::from_wire(v, utc))
                    .collect::<Result<_>>()?,
            ),
            WireValue::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, Self::from_wire(v, utc)?)))
                    .collect::<Result<_>>()?,
            ),
            WireValue::Structure(s) => Self::from_structure(s, utc)?,
        })
    }

    fn from_structure(s: Structure, utc: bool) -> Result<Self> {
        let int_field = |s: &Structure, i: usize| -> Result<i64> {
            s.field(i)
                .and_then(WireValue::as_int)
                .ok_or_else(|| Error::Protocol(format!("bad field {i} in structure 0x{:02X}", s.tag)))
        };
        Ok(match s.tag {
            sig::NODE => Value::Node(Node::from_wire(WireNode::from_structure(&s)?, utc)?),
            sig::RELATIONSHIP => Value::Relationship(Relationship::from_wire(
                WireRelationship::from_structure(&s)?,
                utc,
            )?),
            sig::PATH => {
                let path = WirePath::from_structure(&s)?;
                Value::Path(Path {
                    nodes: path
                        .nodes
                        .into_iter()
                        .map(|n| Node::from_wire(n, utc))
                        .collect::<Result<_>>()?,
                    relationships: path
                        .relationships
                        .into_iter()
                        .map(|r| UnboundRelationship::from_wire(r, utc))
                        .collect::<Result<_>>()?,
                    indices: path.indices,
                })
            }
            sig::POINT_2D | sig::POINT_3D => {
                let p = WirePoint::from_structure(&s)?;
                Value::Point(Point {
                    srid: p.srid,
                    x: p.x,
                    y: p.y,
                    z: p.z,
                })
            }
            sig::DURATION => {
                let d = WireDuration::from_structure(&s)?;
                Value::Duration(Duration {
                    months: d.months,
                    days: d.days,
                    seconds: d.seconds,
                    nanoseconds: d.nanoseconds,
                })
            }
            sig::DATE => {
                let days = int_field(&s, 0)?;
                let date = NaiveDate::from_num_days_from_ce_opt(
                    i32::try_from(days + EPOCH_DAYS_FROM_CE)
                        .map_err(|_| Error::Protocol("date out of range".to_string()))?,
                )
                .ok_or_else(|| Error::Protocol("date out of range".to_string()))?;
                Value::Date(date)
            }
            sig::LOCAL_TIME => Value::LocalTime(nanos_to_time(int_field(&s, 0)?)?),
            sig::TIME => Value::Time {
                nanoseconds: int_field(&s, 0)?,
                offset_seconds: int_field(&s, 1)? as i32,
            },
            sig::LOCAL_DATE_TIME => {
                Value::LocalDateTime(epoch_to_naive(int_field(&s, 0)?, int_field(&s, 1)?)?)
            }
            sig::DATE_TIME | sig::LEGACY_DATE_TIME => {
                let seconds = int_field(&s, 0)?;
                let nanos = int_field(&s, 1)?;
                let offset = int_field(&s, 2)? as i32;
                // The UTC encoding carries epoch-UTC seconds; the legacy one
                // carries offset-adjusted wall-clock seconds.
                let utc_seconds = if s.tag == sig::DATE_TIME {
                    seconds
                } else {
                    seconds - offset as i64
                };
                let tz = FixedOffset::east_opt(offset)
                    .ok_or_else(|| Error::Protocol("bad datetime offset".to_string()))?;
                let dt = DateTime::from_timestamp(utc_seconds, nanos as u32)
                    .ok_or_else(|| Error::Protocol("datetime out of range".to_string()))?;
                Value::DateTime(dt.with_timezone(&tz))
            }
            sig::DATE_TIME_ZONE_ID | sig::LEGACY_DATE_TIME_ZONE_ID => Value::DateTimeZoneId {
                seconds: int_field(&s, 0)?,
                nanoseconds: int_field(&s, 1)?,
                zone_id: s
                    .field(2)
                    .and_then(WireValue::as_str)
                    .ok_or_else(|| Error::Protocol("bad datetime zone id".to_string()))?
                    .to_string(),
            },
            other => {
                return Err(Error::Protocol(format!(
                    "unknown structure signature 0x{other:02X} in record"
                )))
            }
        })
    }

    /// Convert to the wire representation for parameters. Graph entities
    /// cannot travel client → server.
    pub(crate) fn into_wire(self, utc: bool) -> Result<WireValue> {
        Ok(match self {
            Value::Null => WireValue::Null,
            Value::Boolean(b) => WireValue::Boolean(b),
            Value::Integer(i) => WireValue::Integer(i),
            Value::Float(f) => WireValue::Float(f),
            Value::String(s) => WireValue::String(s),
            Value::Bytes(b) => WireValue::Bytes(b),
            Value::List(items) => WireValue::List(
                items
                    .into_iter()
                    .map(|v| v.into_wire(utc))
                    .collect::<Result<_>>()?,
            ),
            Value::Map(entries) => WireValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, v.into_wire(utc)?)))
                    .collect::<Result<_>>()?,
            ),
            Value::Node(_) | Value::Relationship(_) | Value::Path(_) => {
                return Err(Error::Client(
                    "graph entities cannot be used as query parameters".to_string(),
                ))
            }
            Value::Point(p) => WireValue::Structure(
                WirePoint {
                    srid: p.srid,
                    x: p.x,
                    y: p.y,
                    z: p.z,
                }
                .to_structure(),
            ),
            Value::Duration(d) => WireValue::Structure(
                WireDuration {
                    months: d.months,
                    days: d.days,
                    seconds: d.seconds,
                    nanoseconds: d.nanoseconds,
                }
                .to_structure(),
            ),
            Value::Date(date) => WireValue::Structure(Structure::new(
                sig::DATE,
                vec![WireValue::Integer(
                    date.num_days_from_ce() as i64 - EPOCH_DAYS_FROM_CE,
                )],
            )),
            Value::LocalTime(time) => WireValue::Structure(Structure::new(
                sig::LOCAL_TIME,
                vec![WireValue::Integer(time_to_nanos(time))],
            )),
            Value::Time {
                nanoseconds,
                offset_seconds,
            } => WireValue::Structure(Structure::new(
                sig::TIME,
                vec![
                    WireValue::Integer(nanoseconds),
                    WireValue::Integer(offset_seconds as i64),
                ],
            )),
            Value::LocalDateTime(ndt) => {
                let utc_dt = ndt.and_utc();
                WireValue::Structure(Structure::new(
                    sig::LOCAL_DATE_TIME,
                    vec![
                        WireValue::Integer(utc_dt.timestamp()),
                        WireValue::Integer(utc_dt.timestamp_subsec_nanos() as i64),
                    ],
                ))
            }
            Value::DateTime(dt) => {
                let offset = dt.offset().local_minus_utc();
                let (tag, seconds) = if utc {
                    (sig::DATE_TIME, dt.timestamp())
                } else {
                    (sig::LEGACY_DATE_TIME, dt.timestamp() + offset as i64)
                };
                WireValue::Structure(Structure::new(
                    tag,
                    vec![
                        WireValue::Integer(seconds),
                        WireValue::Integer(dt.timestamp_subsec_nanos() as i64),
                        WireValue::Integer(offset as i64),
                    ],
                ))
            }
            Value::DateTimeZoneId {
                seconds,
                nanoseconds,
                zone_id,
            } => {
                let tag = if utc {
                    sig::DATE_TIME_ZONE_ID
                } else {
                    sig::LEGACY_DATE_TIME_ZONE_ID
                };
                WireValue::Structure(Structure::new(
                    tag,
                    vec![
                        WireValue::Integer(seconds),
                        WireValue::Integer(nanoseconds),
                        WireValue::String(zone_id),
                    ],
                ))
            }
        })
    }
}

fn convert_properties(
    properties: HashMap<String, WireValue>,
    utc: bool,
) -> Result<HashMap<String, Value>> {
    properties
        .into_iter()
        .map(|(k, v)| Ok((k, Value::from_wire(v, utc)?)))
        .collect()
}

impl Node {
    fn from_wire(node: WireNode, utc: bool) -> Result<Self> {
        Ok(Self {
            id: node.id,
            element_id: node.element_id,
            labels: node.labels,
            properties: convert_properties(node.properties, utc)?,
        })
    }
}

impl Relationship {
    fn from_wire(rel: WireRelationship, utc: bool) -> Result<Self> {
        Ok(Self {
            id: rel.id,
            element_id: rel.element_id,
            start_node_id: rel.start_node_id,
            end_node_id: rel.end_node_id,
            typ: rel.typ,
            properties: convert_properties(rel.properties, utc)?,
        })
    }
}

impl UnboundRelationship {
    fn from_wire(rel: WireUnboundRelationship, utc: bool) -> Result<Self> {
        Ok(Self {
            id: rel.id,
            element_id: rel.element_id,
            typ: rel.typ,
            properties: convert_properties(rel.properties, utc)?,
        })
    }
}

fn nanos_to_time(nanos: i64) -> Result<NaiveTime> {
    let seconds = u32::try_from(nanos / 1_000_000_000)
        .map_err(|_| Error::Protocol("time of day out of range".to_string()))?;
    let subsec = (nanos % 1_000_000_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(seconds, subsec)
        .ok_or_else(|| Error::Protocol("time of day out of range".to_string()))
}

fn time_to_nanos(time: NaiveTime) -> i64 {
    time.num_seconds_from_midnight() as i64 * 1_000_000_000 + time.nanosecond() as i64
}

fn epoch_to_naive(seconds: i64, nanos: i64) -> Result<NaiveDateTime> {
    DateTime::from_timestamp(seconds, nanos as u32)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| Error::Protocol("datetime out of range".to_string()))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => write!(f, "{{{} entries}}", entries.len()),
            Value::Node(n) => write!(f, "(:{} id={})", n.labels.join(":"), n.id),
            Value::Relationship(r) => write!(f, "[:{} id={}]", r.typ, r.id),
            Value::Path(p) => write!(f, "path[{} nodes]", p.nodes.len()),
            Value::Point(p) => match p.z {
                Some(z) => write!(f, "point({}, {}, {})", p.x, p.y, z),
                None => write!(f, "point({}, {})", p.x, p.y),
            },
            Value::Date(d) => write!(f, "{d}"),
            Value::Time { .. } => write!(f, "time"),
            Value::LocalTime(t) => write!(f, "{t}"),
            Value::DateTime(dt) => write!(f, "{dt}"),
            Value::DateTimeZoneId { zone_id, .. } => write!(f, "datetime[{zone_id}]"),
            Value::LocalDateTime(dt) => write!(f, "{dt}"),
            Value::Duration(_) => write!(f, "duration"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

macro_rules! try_from_value {
    ($target:ty, $variant:path, $expected:literal) => {
        impl TryFrom<Value> for $target {
            type Error = Error;

            fn try_from(value: Value) -> Result<Self> {
                match value {
                    $variant(inner) => Ok(inner),
                    other => Err(Error::Client(format!(
                        "expected {} but record holds {other}",
                        $expected
                    ))),
                }
            }
        }
    };
}

try_from_value!(bool, Value::Boolean, "a boolean");
try_from_value!(i64, Value::Integer, "an integer");
try_from_value!(f64, Value::Float, "a float");
try_from_value!(String, Value::String, "a string");
try_from_value!(Vec<u8>, Value::Bytes, "bytes");
try_from_value!(Node, Value::Node, "a node");
try_from_value!(Relationship, Value::Relationship, "a relationship");
try_from_value!(Path, Value::Path, "a path");

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value, utc: bool) -> Value {
        let wire = value.into_wire(utc).unwrap();
        Value::from_wire(wire, utc).unwrap()
    }

    #[test]
    fn scalar_round_trips() {
        for v in [
            Value::Null,
            Value::Boolean(true),
            Value::Integer(-42),
            Value::Float(2.5),
            Value::String("hi".into()),
            Value::Bytes(vec![1, 2]),
        ] {
            assert_eq!(round_trip(v.clone(), true), v);
        }
    }

    #[test]
    fn date_conversion() {
        // 2021-01-01 is 18628 days after the epoch.
        let date = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        let wire = Value::Date(date).into_wire(true).unwrap();
        let s = wire.as_structure().unwrap();
        assert_eq!(s.tag, sig::DATE);
        assert_eq!(s.fields[0], WireValue::Integer(18628));
        assert_eq!(round_trip(Value::Date(date), true), Value::Date(date));
    }

    #[test]
    fn epoch_date_is_day_zero() {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        let wire = Value::Date(epoch).into_wire(true).unwrap();
        assert_eq!(
            wire.as_structure().unwrap().fields[0],
            WireValue::Integer(0)
        );
    }

    #[test]
    fn datetime_utc_vs_legacy_seconds() {
        let tz = FixedOffset::east_opt(3600).unwrap();
        let dt = DateTime::from_timestamp(1_000_000, 0)
            .unwrap()
            .with_timezone(&tz);

        let utc_wire = Value::DateTime(dt).into_wire(true).unwrap();
        let s = utc_wire.as_structure().unwrap();
        assert_eq!(s.tag, sig::DATE_TIME);
        assert_eq!(s.fields[0], WireValue::Integer(1_000_000));

        let legacy_wire = Value::DateTime(dt).into_wire(false).unwrap();
        let s = legacy_wire.as_structure().unwrap();
        assert_eq!(s.tag, sig::LEGACY_DATE_TIME);
        // Legacy seconds are offset-adjusted.
        assert_eq!(s.fields[0], WireValue::Integer(1_003_600));

        for utc in [true, false] {
            assert_eq!(round_trip(Value::DateTime(dt), utc), Value::DateTime(dt));
        }
    }

    #[test]
    fn local_time_nanos() {
        let t = NaiveTime::from_hms_nano_opt(1, 2, 3, 4).unwrap();
        let expected = ((3600 + 120 + 3) as i64) * 1_000_000_000 + 4;
        let wire = Value::LocalTime(t).into_wire(true).unwrap();
        assert_eq!(
            wire.as_structure().unwrap().fields[0],
            WireValue::Integer(expected)
        );
        assert_eq!(round_trip(Value::LocalTime(t), true), Value::LocalTime(t));
    }

    #[test]
    fn duration_and_point_round_trip() {
        let d = Value::Duration(Duration {
            months: 1,
            days: 2,
            seconds: 3,
            nanoseconds: 4,
        });
        assert_eq!(round_trip(d.clone(), true), d);

        let p = Value::Point(Point {
            srid: 7203,
            x: 1.5,
            y: -2.5,
            z: None,
        });
        assert_eq!(round_trip(p.clone(), true), p);
    }

    #[test]
    fn node_decodes_with_converted_properties() {
        let mut props = HashMap::new();
        props.insert("since".to_string(), WireValue::Integer(1999));
        let node_struct = Structure::new(
            sig::NODE,
            vec![
                WireValue::Integer(5),
                WireValue::List(vec!["Person".into()]),
                WireValue::Map(props),
                WireValue::String("4:x:5".into()),
            ],
        );
        let value = Value::from_wire(WireValue::Structure(node_struct), true).unwrap();
        let node = value.as_node().unwrap();
        assert_eq!(node.id, 5);
        assert_eq!(node.element_id.as_deref(), Some("4:x:5"));
        assert_eq!(node.properties.get("since"), Some(&Value::Integer(1999)));
    }

    #[test]
    fn graph_entities_rejected_as_parameters() {
        let node = Value::Node(Node {
            id: 1,
            element_id: None,
            labels: vec![],
            properties: HashMap::new(),
        });
        assert!(matches!(node.into_wire(true), Err(Error::Client(_))));
    }

    #[test]
    fn typed_extraction() {
        assert_eq!(i64::try_from(Value::Integer(9)).unwrap(), 9);
        assert_eq!(String::try_from(Value::from("x")).unwrap(), "x");
        assert!(bool::try_from(Value::Integer(1)).is_err());
    }
}
