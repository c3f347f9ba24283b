//! Port identity and detected-port snapshots.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A board port as reported by the device scanner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortIdentifier {
    pub protocol: String,
    pub address: String,
}

impl PortIdentifier {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
        }
    }

    pub fn serial(address: impl Into<String>) -> Self {
        Self::new("serial", address)
    }

    /// Canonical map key for this port.
    pub fn key(&self) -> PortKey {
        PortKey(format!("{}:{}", self.protocol, self.address))
    }

    /// Serial-like protocols cannot be opened without a baud rate.
    pub fn requires_baudrate(&self) -> bool {
        self.protocol == "serial"
    }
}

impl fmt::Display for PortIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.address)
    }
}

/// Canonical string form of a [`PortIdentifier`] (`protocol:address`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortKey(String);

impl PortKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the identifier. The protocol never contains `:`, the address may.
    pub fn to_port(&self) -> PortIdentifier {
        match self.0.split_once(':') {
            Some((protocol, address)) => PortIdentifier::new(protocol, address),
            None => PortIdentifier::new(self.0.clone(), ""),
        }
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((protocol, address)) if !protocol.is_empty() && !address.is_empty() => {
                Ok(PortIdentifier::new(protocol, address).key())
            }
            _ => Err(format!("invalid port key (expected protocol:address): {s}")),
        }
    }
}

impl From<&PortIdentifier> for PortKey {
    fn from(port: &PortIdentifier) -> Self {
        port.key()
    }
}

/// One entry of a detection snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedPort {
    pub port: PortIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_label: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl DetectedPort {
    pub fn new(port: PortIdentifier) -> Self {
        Self {
            port,
            label: None,
            protocol_label: None,
            properties: BTreeMap::new(),
        }
    }
}

/// Full snapshot of the ports currently present. Always replaced, never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectedPorts(HashMap<PortKey, DetectedPort>);

impl DetectedPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ports(ports: impl IntoIterator<Item = DetectedPort>) -> Self {
        Self(ports.into_iter().map(|d| (d.port.key(), d)).collect())
    }

    pub fn get(&self, key: &PortKey) -> Option<&DetectedPort> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &PortKey) -> bool {
        self.0.contains_key(key)
    }

    pub fn contains_port(&self, port: &PortIdentifier) -> bool {
        self.contains(&port.key())
    }

    pub fn keys(&self) -> impl Iterator<Item = &PortKey> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectedPort> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ports sorted by key, for stable output.
    pub fn sorted(&self) -> Vec<&DetectedPort> {
        let mut ports: Vec<_> = self.0.values().collect();
        ports.sort_by(|a, b| a.port.cmp(&b.port));
        ports
    }
}

impl Serialize for DetectedPorts {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.sorted())
    }
}

impl<'de> Deserialize<'de> for DetectedPorts {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ports = Vec::<DetectedPort>::deserialize(deserializer)?;
        Ok(Self::from_ports(ports))
    }
}
