//! Well-known PackStream structure signatures.
//!
//! Graph entities, temporal values and spatial points travel as tagged
//! structures. Nodes and relationships gained a trailing element-id field in
//! Bolt 5.0; both arities are accepted on decode.

use std::collections::HashMap;

use super::types::{Structure, Value};
use super::PackStreamError;

/// Graph entity signatures
pub const NODE: u8 = 0x4E; // 'N'
pub const RELATIONSHIP: u8 = 0x52; // 'R'
pub const UNBOUND_RELATIONSHIP: u8 = 0x72; // 'r'
pub const PATH: u8 = 0x50; // 'P'

/// Temporal signatures
pub const DATE: u8 = 0x44; // 'D'
pub const TIME: u8 = 0x54; // 'T'
pub const LOCAL_TIME: u8 = 0x74; // 't'
pub const DATE_TIME: u8 = 0x49; // 'I' (UTC encoding, Bolt 5.0+/patched 4.x)
pub const DATE_TIME_ZONE_ID: u8 = 0x69; // 'i'
pub const LEGACY_DATE_TIME: u8 = 0x46; // 'F'
pub const LEGACY_DATE_TIME_ZONE_ID: u8 = 0x66; // 'f'
pub const LOCAL_DATE_TIME: u8 = 0x64; // 'd'
pub const DURATION: u8 = 0x45; // 'E'

/// Spatial signatures
pub const POINT_2D: u8 = 0x58; // 'X'
pub const POINT_3D: u8 = 0x59; // 'Y'

fn wrong_shape(what: &'static str) -> PackStreamError {
    PackStreamError::InvalidStructure(what.to_string())
}

/// A graph node as it appears on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct WireNode {
    pub id: i64,
    pub labels: Vec<String>,
    pub properties: HashMap<String, Value>,
    /// Present from Bolt 5.0 onwards.
    pub element_id: Option<String>,
}

impl WireNode {
    pub fn from_structure(s: &Structure) -> Result<Self, PackStreamError> {
        if s.tag != NODE || s.fields.len() < 3 {
            return Err(wrong_shape("node"));
        }
        Ok(Self {
            id: s.fields[0].as_int().ok_or_else(|| wrong_shape("node id"))?,
            labels: s.fields[1]
                .as_string_list()
                .ok_or_else(|| wrong_shape("node labels"))?,
            properties: s.fields[2]
                .as_map()
                .cloned()
                .ok_or_else(|| wrong_shape("node properties"))?,
            element_id: s.field(3).and_then(|v| v.as_str()).map(String::from),
        })
    }
}

/// A bound relationship (knows both endpoints).
#[derive(Debug, Clone, PartialEq)]
pub struct WireRelationship {
    pub id: i64,
    pub start_node_id: i64,
    pub end_node_id: i64,
    pub typ: String,
    pub properties: HashMap<String, Value>,
    pub element_id: Option<String>,
}

impl WireRelationship {
    pub fn from_structure(s: &Structure) -> Result<Self, PackStreamError> {
        if s.tag != RELATIONSHIP || s.fields.len() < 5 {
            return Err(wrong_shape("relationship"));
        }
        Ok(Self {
            id: s.fields[0].as_int().ok_or_else(|| wrong_shape("rel id"))?,
            start_node_id: s.fields[1]
                .as_int()
                .ok_or_else(|| wrong_shape("rel start"))?,
            end_node_id: s.fields[2].as_int().ok_or_else(|| wrong_shape("rel end"))?,
            typ: s.fields[3]
                .as_str()
                .ok_or_else(|| wrong_shape("rel type"))?
                .to_string(),
            properties: s.fields[4]
                .as_map()
                .cloned()
                .ok_or_else(|| wrong_shape("rel properties"))?,
            element_id: s.field(5).and_then(|v| v.as_str()).map(String::from),
        })
    }
}

/// A relationship inside a path, without endpoint ids.
#[derive(Debug, Clone, PartialEq)]
pub struct WireUnboundRelationship {
    pub id: i64,
    pub typ: String,
    pub properties: HashMap<String, Value>,
    pub element_id: Option<String>,
}

impl WireUnboundRelationship {
    pub fn from_structure(s: &Structure) -> Result<Self, PackStreamError> {
        if s.tag != UNBOUND_RELATIONSHIP || s.fields.len() < 3 {
            return Err(wrong_shape("unbound relationship"));
        }
        Ok(Self {
            id: s.fields[0].as_int().ok_or_else(|| wrong_shape("rel id"))?,
            typ: s.fields[1]
                .as_str()
                .ok_or_else(|| wrong_shape("rel type"))?
                .to_string(),
            properties: s.fields[2]
                .as_map()
                .cloned()
                .ok_or_else(|| wrong_shape("rel properties"))?,
            element_id: s.field(3).and_then(|v| v.as_str()).map(String::from),
        })
    }
}

/// A path: node list, unbound relationship list, and the index sequence
/// describing how they interleave.
#[derive(Debug, Clone, PartialEq)]
pub struct WirePath {
    pub nodes: Vec<WireNode>,
    pub relationships: Vec<WireUnboundRelationship>,
    pub indices: Vec<i64>,
}

impl WirePath {
    pub fn from_structure(s: &Structure) -> Result<Self, PackStreamError> {
        if s.tag != PATH || s.fields.len() != 3 {
            return Err(wrong_shape("path"));
        }
        let nodes = s.fields[0]
            .as_list()
            .ok_or_else(|| wrong_shape("path nodes"))?
            .iter()
            .map(|v| {
                v.as_structure()
                    .ok_or_else(|| wrong_shape("path node"))
                    .and_then(WireNode::from_structure)
            })
            .collect::<Result<_, _>>()?;
        let relationships = s.fields[1]
            .as_list()
            .ok_or_else(|| wrong_shape("path rels"))?
            .iter()
            .map(|v| {
                v.as_structure()
                    .ok_or_else(|| wrong_shape("path rel"))
                    .and_then(WireUnboundRelationship::from_structure)
            })
            .collect::<Result<_, _>>()?;
        let indices = s.fields[2]
            .as_list()
            .ok_or_else(|| wrong_shape("path indices"))?
            .iter()
            .map(|v| v.as_int().ok_or_else(|| wrong_shape("path index")))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            nodes,
            relationships,
            indices,
        })
    }
}

/// Months/days/seconds/nanoseconds duration, the wire shape of Cypher's
/// duration type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireDuration {
    pub months: i64,
    pub days: i64,
    pub seconds: i64,
    pub nanoseconds: i64,
}

impl WireDuration {
    pub fn to_structure(self) -> Structure {
        Structure::new(
            DURATION,
            vec![
                self.months.into(),
                self.days.into(),
                self.seconds.into(),
                self.nanoseconds.into(),
            ],
        )
    }

    pub fn from_structure(s: &Structure) -> Result<Self, PackStreamError> {
        if s.tag != DURATION || s.fields.len() != 4 {
            return Err(wrong_shape("duration"));
        }
        let int = |i: usize| s.fields[i].as_int().ok_or_else(|| wrong_shape("duration"));
        Ok(Self {
            months: int(0)?,
            days: int(1)?,
            seconds: int(2)?,
            nanoseconds: int(3)?,
        })
    }
}

/// A 2D or 3D point with a spatial reference system id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WirePoint {
    pub srid: i64,
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
}

impl WirePoint {
    pub fn to_structure(self) -> Structure {
        match self.z {
            Some(z) => Structure::new(
                POINT_3D,
                vec![self.srid.into(), self.x.into(), self.y.into(), z.into()],
            ),
            None => Structure::new(POINT_2D, vec![self.srid.into(), self.x.into(), self.y.into()]),
        }
    }

    pub fn from_structure(s: &Structure) -> Result<Self, PackStreamError> {
        let float = |v: &Value| -> Result<f64, PackStreamError> {
            v.as_float().ok_or_else(|| wrong_shape("point coordinate"))
        };
        match (s.tag, s.fields.len()) {
            (POINT_2D, 3) => Ok(Self {
                srid: s.fields[0].as_int().ok_or_else(|| wrong_shape("srid"))?,
                x: float(&s.fields[1])?,
                y: float(&s.fields[2])?,
                z: None,
            }),
            (POINT_3D, 4) => Ok(Self {
                srid: s.fields[0].as_int().ok_or_else(|| wrong_shape("srid"))?,
                x: float(&s.fields[1])?,
                y: float(&s.fields[2])?,
                z: Some(float(&s.fields[3])?),
            }),
            _ => Err(wrong_shape("point")),
        }
    }
}
