pub mod tx;

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A chain address, optionally carrying the value it moved in one transaction.
///
/// Equality and hashing only look at the address string; `value` is context
/// from the transaction the address was read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>, // sats
}

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            value: None,
        }
    }

    pub fn with_value(address: impl Into<String>, value: u64) -> Self {
        Self {
            address: address.into(),
            value: Some(value),
        }
    }

    /// Same address without the per-transaction value.
    pub fn bare(&self) -> Self {
        Self::new(self.address.clone())
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

/// A confirmed transaction as surfaced by a provider.
///
/// Providers drop coinbase inputs and never return `time == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub time: i64, // unix seconds
    #[serde(default)]
    pub inputs: Vec<Address>,
    #[serde(default)]
    pub outputs: Vec<Address>,
}

impl Transaction {
    pub fn contains_input(&self, address: &str) -> bool {
        self.inputs.iter().any(|i| i.address == address)
    }

    pub fn contains_output(&self, address: &str) -> bool {
        self.outputs.iter().any(|o| o.address == address)
    }
}

/// One step of ownership (or flow) expansion from `source` to `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: Address,
    pub target: Address,
    pub transaction: Transaction,
    #[serde(default)]
    pub is_change: bool,
}

impl Edge {
    pub fn new(source: Address, target: Address, transaction: Transaction) -> Self {
        Self {
            source,
            target,
            transaction,
            is_change: false,
        }
    }

    pub fn change(source: Address, target: Address, transaction: Transaction) -> Self {
        Self {
            source,
            target,
            transaction,
            is_change: true,
        }
    }
}

/// Addresses believed to be controlled by one actor, plus the edges that found them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub addresses: Vec<Address>,
    pub edges: Vec<Edge>,
}

impl Cluster {
    pub fn contains(&self, address: &str) -> bool {
        self.addresses.iter().any(|a| a.address == address)
    }

    pub fn address_set(&self) -> HashSet<&str> {
        self.addresses.iter().map(|a| a.address.as_str()).collect()
    }
}
