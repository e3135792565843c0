//! Read-mostly membership snapshot shared across controller subsystems.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use pulsegrid_cib::CibDocument;
use tracing::{debug, info};

/// How the view is shared between the daemon and its subsystems.
pub type SharedClusterView = Arc<RwLock<ClusterView>>;

/// The controller's picture of the cluster around it.
#[derive(Debug, Clone)]
pub struct ClusterView {
    node_id: String,
    quorum: bool,
    ever_had_quorum: bool,
    membership_seq: u64,
    watchdog_present: bool,
    members: BTreeSet<String>,
    known_nodes: BTreeSet<String>,
}

impl ClusterView {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            quorum: false,
            ever_had_quorum: false,
            membership_seq: 0,
            watchdog_present: false,
            members: BTreeSet::new(),
            known_nodes: BTreeSet::new(),
        }
    }

    pub fn into_shared(self) -> SharedClusterView {
        Arc::new(RwLock::new(self))
    }

    /// Name of the local node.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Record the partition's quorum state. Once quorum has been held, the
    /// fact that it was is remembered for the life of the process.
    pub fn set_quorum(&mut self, quorum: bool) {
        if quorum {
            self.ever_had_quorum = true;
        }
        if self.quorum != quorum {
            info!(quorum, "cluster quorum changed");
            self.quorum = quorum;
        }
    }

    pub fn has_quorum(&self) -> bool {
        self.quorum
    }

    /// Whether this process has ever seen its partition quorate.
    pub fn ever_had_quorum(&self) -> bool {
        self.ever_had_quorum
    }

    pub fn set_membership_seq(&mut self, seq: u64) {
        self.membership_seq = seq;
    }

    /// Sequence number of the most recent membership event.
    pub fn membership_seq(&self) -> u64 {
        self.membership_seq
    }

    pub fn set_watchdog(&mut self, present: bool) {
        self.watchdog_present = present;
    }

    /// Whether a hardware watchdog backs this node.
    pub fn watchdog_present(&self) -> bool {
        self.watchdog_present
    }

    /// Install the live member set from a membership event.
    pub fn set_members<I, S>(&mut self, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members = members.into_iter().map(Into::into).collect();
        self.known_nodes.extend(self.members.iter().cloned());
    }

    pub fn members(&self) -> &BTreeSet<String> {
        &self.members
    }

    /// Every node this process has ever seen configured or alive. Never
    /// shrinks; departed nodes still matter for placement history.
    pub fn known_nodes(&self) -> &BTreeSet<String> {
        &self.known_nodes
    }

    /// Reconcile the node caches against a fresh CIB document: the member
    /// cache is rebuilt from the configured nodes, the known-node cache only
    /// grows.
    pub fn refresh_caches(&mut self, doc: &CibDocument) {
        self.members = doc.node_names().map(str::to_owned).collect();
        self.known_nodes.extend(self.members.iter().cloned());
        debug!(
            members = self.members.len(),
            known = self.known_nodes.len(),
            "node caches refreshed from cluster state"
        );
    }
}
