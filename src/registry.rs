//! # Location Directory
//!
//! In-memory map from node ids to addresses and from content ids to the
//! nodes serving them. Each association is stored in both directions and
//! every mutation keeps the two sides in step: a node is listed for a content
//! id exactly when that content id is in the node's file list.
//!
//! The registry does no locking of its own. The owning endpoint serializes
//! access to it.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info};

use crate::protocol::{ContentId, NodeId, PeerAddress};

/// A directory entry for one node.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub address: PeerAddress,
    pub last_seen: DateTime<Utc>,
    pub files: BTreeSet<ContentId>,
}

/// The instant `max_age` ago. `None` when that lies outside the calendar,
/// in which case nothing can be that old.
pub(crate) fn age_cutoff(max_age: Duration) -> Option<DateTime<Utc>> {
    let max_age = chrono::Duration::from_std(max_age).ok()?;
    Utc::now().checked_sub_signed(max_age)
}

#[derive(Debug, Default)]
pub struct LocationRegistry {
    nodes: HashMap<NodeId, NodeEntry>,
    locations: HashMap<ContentId, Vec<NodeId>>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false, leaving the entry untouched, if the id is already known.
    pub fn add_node(&mut self, id: NodeId, address: PeerAddress) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        info!("Added node {} at {}", id.short(), address);
        self.nodes.insert(
            id.clone(),
            NodeEntry {
                id,
                address,
                last_seen: Utc::now(),
                files: BTreeSet::new(),
            },
        );
        true
    }

    /// Removes the node and every location that pointed at it.
    pub fn remove_node(&mut self, id: &NodeId) -> bool {
        let Some(entry) = self.nodes.remove(id) else {
            return false;
        };
        for file in &entry.files {
            self.unlink(file, id);
        }
        info!("Removed node {}", id.short());
        true
    }

    /// Returns false if the node is unknown.
    pub fn add_file(&mut self, content_id: ContentId, node_id: &NodeId) -> bool {
        let Some(entry) = self.nodes.get_mut(node_id) else {
            return false;
        };
        entry.files.insert(content_id.clone());
        let holders = self.locations.entry(content_id.clone()).or_default();
        if !holders.contains(node_id) {
            holders.push(node_id.clone());
        }
        debug!("Added file {} to node {}", content_id, node_id.short());
        true
    }

    /// Returns false if the node is unknown. Removing a file the node does not
    /// serve is not an error.
    pub fn remove_file(&mut self, content_id: &ContentId, node_id: &NodeId) -> bool {
        let Some(entry) = self.nodes.get_mut(node_id) else {
            return false;
        };
        entry.files.remove(content_id);
        self.unlink(content_id, node_id);
        debug!("Removed file {} from node {}", content_id, node_id.short());
        true
    }

    /// Addresses of every node serving the content, in registration order.
    pub fn find_file(&self, content_id: &ContentId) -> Vec<PeerAddress> {
        self.locations
            .get(content_id)
            .map(|holders| {
                holders
                    .iter()
                    .filter_map(|id| self.nodes.get(id))
                    .map(|entry| entry.address.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_peers(&self) -> Vec<PeerAddress> {
        self.nodes.values().map(|entry| entry.address.clone()).collect()
    }

    /// Refreshes `last_seen`. Returns false if the node is unknown.
    pub fn touch(&mut self, id: &NodeId) -> bool {
        match self.nodes.get_mut(id) {
            Some(entry) => {
                entry.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Evicts every node unseen for longer than `max_age_secs`, with the same
    /// cascade as [`remove_node`](Self::remove_node).
    pub fn cleanup(&mut self, max_age_secs: u64) -> Vec<NodeId> {
        let Some(cutoff) = age_cutoff(Duration::from_secs(max_age_secs)) else {
            return Vec::new();
        };
        let stale: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|entry| entry.last_seen < cutoff)
            .map(|entry| entry.id.clone())
            .collect();

        for id in &stale {
            self.remove_node(id);
        }
        if !stale.is_empty() {
            info!("Cleaned up {} stale nodes", stale.len());
        }
        stale
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeEntry> {
        self.nodes.get(id)
    }

    pub fn node_address(&self, id: &NodeId) -> Option<PeerAddress> {
        self.nodes.get(id).map(|entry| entry.address.clone())
    }

    pub fn files_of(&self, id: &NodeId) -> Vec<ContentId> {
        self.nodes
            .get(id)
            .map(|entry| entry.files.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn unlink(&mut self, content_id: &ContentId, node_id: &NodeId) {
        if let Some(holders) = self.locations.get_mut(content_id) {
            holders.retain(|holder| holder != node_id);
            if holders.is_empty() {
                self.locations.remove(content_id);
            }
        }
    }
}
