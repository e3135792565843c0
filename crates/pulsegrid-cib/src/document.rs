//! Typed model of the cluster information base document.
//!
//! Controllers mostly treat the CIB as opaque state to ship to the
//! scheduler, but they do stamp a handful of top-level attributes and
//! cluster properties first. The model keeps those paths typed and leaves
//! the resource status section as raw JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Well-known attribute and property names.
pub mod keys {
    /// Top-level attribute naming the current coordinator.
    pub const DC_UUID: &str = "dc-uuid";
    /// Top-level attribute: "1" when the coordinator's partition has quorum.
    pub const HAVE_QUORUM: &str = "have-quorum";
    /// Cluster property: whether a hardware watchdog is available.
    pub const HAVE_WATCHDOG: &str = "have-watchdog";
    /// Top-level attribute set once quorum was held and then lost.
    pub const NO_QUORUM_PANIC: &str = "no-quorum-panic";
    /// Id of the property set that bootstrap-level options live in.
    pub const BOOTSTRAP_OPTIONS: &str = "cib-bootstrap-options";
}

/// One name/value pair inside a property set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NvPair {
    pub id: String,
    pub name: String,
    pub value: String,
}

/// A named group of cluster properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySet {
    pub id: String,
    #[serde(default)]
    pub nvpairs: Vec<NvPair>,
}

/// A cluster node as recorded in the configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CibNode {
    pub id: String,
    pub uname: String,
}

/// The `configuration` section: cluster properties and the node list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub crm_config: Vec<PropertySet>,
    #[serde(default)]
    pub nodes: Vec<CibNode>,
}

/// The full CIB document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CibDocument {
    /// Configuration generation, bumped on every configuration change.
    #[serde(default)]
    pub epoch: u64,
    /// Status-change counter within the current epoch.
    #[serde(default)]
    pub num_updates: u64,
    /// Top-level document attributes.
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub configuration: Configuration,
    /// Resource and node status, carried verbatim.
    #[serde(default)]
    pub status: serde_json::Value,
}

impl CibDocument {
    /// Set a top-level document attribute, replacing any previous value.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(name.into(), value.into());
    }

    /// Read a top-level document attribute.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Force a cluster property to `value`.
    ///
    /// Every pair with that name, in any property set, is overwritten so a
    /// stale duplicate cannot shadow the forced value. When no pair exists
    /// anywhere, one is created in the bootstrap options set (creating the
    /// set too if needed) under the id `cib-bootstrap-options-<name>`.
    ///
    /// Returns how many existing pairs were overwritten; zero means the
    /// property was created.
    pub fn upsert_cluster_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> usize {
        let name = name.into();
        let value = value.into();

        let mut updated = 0;
        for set in &mut self.configuration.crm_config {
            for pair in set.nvpairs.iter_mut().filter(|p| p.name == name) {
                pair.value = value.clone();
                updated += 1;
            }
        }
        if updated > 0 {
            return updated;
        }

        let sets = &mut self.configuration.crm_config;
        let slot = match sets.iter().position(|set| set.id == keys::BOOTSTRAP_OPTIONS) {
            Some(i) => i,
            None => {
                sets.push(PropertySet {
                    id: keys::BOOTSTRAP_OPTIONS.to_string(),
                    nvpairs: Vec::new(),
                });
                sets.len() - 1
            }
        };
        sets[slot].nvpairs.push(NvPair {
            id: format!("{}-{name}", keys::BOOTSTRAP_OPTIONS),
            name,
            value,
        });
        0
    }

    /// Read a cluster property; the first pair with that name wins.
    pub fn cluster_property(&self, name: &str) -> Option<&str> {
        self.configuration
            .crm_config
            .iter()
            .flat_map(|set| set.nvpairs.iter())
            .find(|pair| pair.name == name)
            .map(|pair| pair.value.as_str())
    }

    /// Names of all configured nodes.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.configuration.nodes.iter().map(|n| n.uname.as_str())
    }
}
