//! Client-side routing table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::bolt::message::AccessMode;
use crate::bolt::packstream::Value;
use crate::error::{Error, Result};

use super::super::driver::ServerAddress;

/// Role sets for one database, valid until `expires_at`. The generation
/// counter rises on every refresh so observers can tell tables apart.
#[derive(Debug, Clone)]
pub(crate) struct RoutingTable {
    pub database: String,
    pub routers: Vec<ServerAddress>,
    pub readers: Vec<ServerAddress>,
    pub writers: Vec<ServerAddress>,
    pub expires_at: Instant,
    pub generation: u64,
}

impl RoutingTable {
    /// Parse the `rt` payload of a ROUTE success (or the equivalent record
    /// of the legacy routing procedure): a ttl in seconds and a list of
    /// `{addresses, role}` entries.
    pub fn parse(
        database: &str,
        generation: u64,
        rt: &HashMap<String, Value>,
    ) -> Result<Self> {
        let ttl = rt
            .get("ttl")
            .and_then(Value::as_int)
            .ok_or_else(|| Error::Protocol("routing table without ttl".to_string()))?;
        let servers = rt
            .get("servers")
            .and_then(Value::as_list)
            .ok_or_else(|| Error::Protocol("routing table without servers".to_string()))?;

        let mut table = Self {
            database: database.to_string(),
            routers: Vec::new(),
            readers: Vec::new(),
            writers: Vec::new(),
            expires_at: Instant::now() + Duration::from_secs(ttl.max(0) as u64),
            generation,
        };

        for entry in servers {
            let entry = entry
                .as_map()
                .ok_or_else(|| Error::Protocol("malformed routing entry".to_string()))?;
            let role = entry.get("role").and_then(Value::as_str).unwrap_or("");
            let addresses: Vec<ServerAddress> = entry
                .get("addresses")
                .and_then(Value::as_list)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .filter_map(parse_address)
                        .collect()
                })
                .unwrap_or_default();
            let target = match role {
                "ROUTE" => &mut table.routers,
                "READ" => &mut table.readers,
                "WRITE" => &mut table.writers,
                _ => continue,
            };
            for address in addresses {
                if !target.contains(&address) {
                    target.push(address);
                }
            }
        }

        if table.routers.is_empty() {
            return Err(Error::Protocol(
                "routing table contains no routers".to_string(),
            ));
        }
        Ok(table)
    }

    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }

    pub fn servers(&self, mode: AccessMode) -> &[ServerAddress] {
        match mode {
            AccessMode::Read => &self.readers,
            AccessMode::Write => &self.writers,
        }
    }

    pub fn has_role(&self, mode: AccessMode) -> bool {
        !self.servers(mode).is_empty()
    }

    /// Remove an address from every role set.
    pub fn forget(&mut self, address: &ServerAddress) {
        self.routers.retain(|a| a != address);
        self.readers.retain(|a| a != address);
        self.writers.retain(|a| a != address);
    }

    /// Remove an address from the writers only.
    pub fn forget_writer(&mut self, address: &ServerAddress) {
        self.writers.retain(|a| a != address);
    }
}

/// `host:port` with the Bolt default port when none is given.
fn parse_address(text: &str) -> Option<ServerAddress> {
    match text.rsplit_once(':') {
        None => Some(ServerAddress::new(text, 7687)),
        Some((host, port)) => port.parse().ok().map(|p| ServerAddress::new(host, p)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn rt_payload(
        ttl: i64,
        routers: &[&str],
        readers: &[&str],
        writers: &[&str],
    ) -> HashMap<String, Value> {
        let entry = |role: &str, addresses: &[&str]| {
            let mut map = HashMap::new();
            map.insert("role".to_string(), role.into());
            map.insert(
                "addresses".to_string(),
                Value::List(addresses.iter().map(|a| (*a).into()).collect()),
            );
            Value::Map(map)
        };
        let mut rt = HashMap::new();
        rt.insert("ttl".to_string(), Value::Integer(ttl));
        rt.insert(
            "servers".to_string(),
            Value::List(vec![
                entry("ROUTE", routers),
                entry("READ", readers),
                entry("WRITE", writers),
            ]),
        );
        rt
    }

    #[test]
    fn parses_roles_and_ttl() {
        let rt = rt_payload(
            300,
            &["r1:7687"],
            &["read1:7687", "read2:7688"],
            &["write1"],
        );
        let table = RoutingTable::parse("movies", 3, &rt).unwrap();
        assert_eq!(table.generation, 3);
        assert_eq!(table.routers, [ServerAddress::new("r1", 7687)]);
        assert_eq!(table.readers.len(), 2);
        assert_eq!(table.readers[1].port, 7688);
        // Address without a port takes the Bolt default.
        assert_eq!(table.writers, [ServerAddress::new("write1", 7687)]);
        assert!(table.is_fresh());
        assert!(table.has_role(AccessMode::Read));
        assert!(table.has_role(AccessMode::Write));
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let rt = rt_payload(0, &["r1"], &["x"], &["y"]);
        let table = RoutingTable::parse("", 1, &rt).unwrap();
        assert!(!table.is_fresh());
    }

    #[test]
    fn missing_routers_is_an_error() {
        let mut rt = rt_payload(60, &[], &["x"], &["y"]);
        // Strip the (empty) router entry entirely as some servers do.
        rt.insert("servers".to_string(), Value::List(vec![]));
        assert!(RoutingTable::parse("", 1, &rt).is_err());
    }

    #[test]
    fn malformed_payloads_rejected() {
        assert!(RoutingTable::parse("", 1, &HashMap::new()).is_err());
        let mut rt = HashMap::new();
        rt.insert("ttl".to_string(), Value::Integer(60));
        rt.insert("servers".to_string(), Value::from("oops"));
        assert!(RoutingTable::parse("", 1, &rt).is_err());
    }

    #[test]
    fn forget_rules() {
        let rt = rt_payload(60, &["a"], &["a", "b"], &["a", "c"]);
        let mut table = RoutingTable::parse("", 1, &rt).unwrap();

        let a = ServerAddress::new("a", 7687);
        table.forget_writer(&a);
        assert!(table.writers.iter().all(|addr| addr != &a));
        assert!(table.readers.contains(&a), "writer forget leaves other roles");

        table.forget(&a);
        assert!(!table.readers.contains(&a));
        assert!(!table.routers.contains(&a));
    }

    #[test]
    fn duplicate_addresses_collapse() {
        let rt = rt_payload(60, &["r"], &["x", "x"], &["w"]);
        let table = RoutingTable::parse("", 1, &rt).unwrap();
        assert_eq!(table.readers.len(), 1);
    }
}
