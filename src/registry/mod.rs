//! Node registry
//!
//! The authoritative in-memory directory of known peers, keyed by
//! call-sign. The registry has no internal locking: it is exclusively
//! owned by the node's reactor task and mutated only inside the
//! message-handling turn. Nothing here survives a restart.

use crate::protocol::NodeInfo;
use std::collections::HashMap;
use std::time::SystemTime;

/// Reachability status of a registered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// A live link to the peer exists (or the peer just registered)
    Online,
    /// Known endpoint, no live link
    Offline,
}

/// A registered peer
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    /// Unique call-sign of the peer
    pub call_sign: String,
    /// Last advertised IP address
    pub ip: String,
    /// Last advertised listening port
    pub port: u16,
    /// Current reachability status
    pub status: NodeStatus,
    /// When this record was last registered or refreshed
    pub last_seen: SystemTime,
}

impl NodeRecord {
    /// Project this record into its wire representation
    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            call_sign: self.call_sign.clone(),
            ip: self.ip.clone(),
            port: self.port,
        }
    }
}

/// Outcome of a [`NodeRegistry::register`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    /// A record for a previously unknown call-sign was created
    Added,
    /// An existing record's endpoint was overwritten (last-writer-wins)
    Updated,
    /// An existing record was re-registered with identical endpoint
    Refreshed,
}

/// Directory of known peers, keyed by call-sign
///
/// Records are listed in insertion order; re-registering an existing
/// call-sign keeps its original position. Registration never rejects: a
/// conflicting endpoint overwrites the stored one (a policy choice, not
/// impersonation protection).
#[derive(Debug, Default)]
pub struct NodeRegistry {
    records: HashMap<String, NodeRecord>,
    /// Insertion order of call-signs, kept in lockstep with `records`
    order: Vec<String>,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a peer record
    ///
    /// Creates the record on first sight of the call-sign, otherwise
    /// overwrites the endpoint fields and refreshes `last_seen`. Always
    /// succeeds. The returned [`RegistryChange`] tells the caller which
    /// notification to publish.
    pub fn register(&mut self, call_sign: &str, ip: &str, port: u16) -> RegistryChange {
        let now = SystemTime::now();

        if let Some(record) = self.records.get_mut(call_sign) {
            let unchanged = record.ip == ip && record.port == port;
            record.ip = ip.to_string();
            record.port = port;
            record.status = NodeStatus::Online;
            record.last_seen = now;
            if unchanged {
                RegistryChange::Refreshed
            } else {
                RegistryChange::Updated
            }
        } else {
            self.records.insert(
                call_sign.to_string(),
                NodeRecord {
                    call_sign: call_sign.to_string(),
                    ip: ip.to_string(),
                    port,
                    status: NodeStatus::Online,
                    last_seen: now,
                },
            );
            self.order.push(call_sign.to_string());
            RegistryChange::Added
        }
    }

    /// Look up a peer by call-sign
    pub fn lookup(&self, call_sign: &str) -> Option<&NodeRecord> {
        self.records.get(call_sign)
    }

    /// Remove a peer record; no-op when absent
    pub fn remove(&mut self, call_sign: &str) -> Option<NodeRecord> {
        let removed = self.records.remove(call_sign);
        if removed.is_some() {
            self.order.retain(|cs| cs != call_sign);
        }
        removed
    }

    /// Update the status of an existing record; no-op when absent
    pub fn set_status(&mut self, call_sign: &str, status: NodeStatus) {
        if let Some(record) = self.records.get_mut(call_sign) {
            record.status = status;
        }
    }

    /// Snapshot of all records in insertion order
    pub fn list(&self) -> Vec<NodeRecord> {
        self.order
            .iter()
            .filter_map(|cs| self.records.get(cs))
            .cloned()
            .collect()
    }

    /// Snapshot of all records as wire entries, in insertion order
    pub fn snapshot(&self) -> Vec<NodeInfo> {
        self.order
            .iter()
            .filter_map(|cs| self.records.get(cs))
            .map(NodeRecord::info)
            .collect()
    }

    /// Number of registered peers
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
