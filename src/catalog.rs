//! Two-tier tool source for a chat request: the static local registry, plus the
//! tools discovered on the caller's bridge when it connected.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::{bridge::BridgeConnection, models::ToolDescriptor, tools::ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolTier {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ToolSource {
    #[serde(rename = "local")]
    LocalOnly,
    #[serde(rename = "local+remote")]
    Merged,
}

#[derive(Debug, Clone)]
pub struct ToolCatalog {
    entries: Vec<(ToolDescriptor, ToolTier)>,
    index: HashMap<String, usize>,
    source: ToolSource,
}

impl ToolCatalog {
    pub fn local(registry: &ToolRegistry) -> Self {
        let mut catalog = Self {
            entries: Vec::with_capacity(registry.len()),
            index: HashMap::new(),
            source: ToolSource::LocalOnly,
        };
        for descriptor in registry.descriptors() {
            catalog.insert(descriptor, ToolTier::Local);
        }
        catalog
    }

    /// The remote tier is added only for a connected bridge. Local names win.
    pub fn merged(registry: &ToolRegistry, bridge: Option<&BridgeConnection>) -> Self {
        let mut catalog = Self::local(registry);
        let Some(bridge) = bridge.filter(|b| b.is_connected()) else {
            return catalog;
        };

        catalog.source = ToolSource::Merged;
        for descriptor in bridge.tools() {
            if registry.contains(&descriptor.name) {
                debug!(tool = %descriptor.name, "Remote tool shadowed by local tool");
                continue;
            }
            catalog.insert(descriptor.clone(), ToolTier::Remote);
        }
        catalog
    }

    fn insert(&mut self, descriptor: ToolDescriptor, tier: ToolTier) {
        self.index.insert(descriptor.name.clone(), self.entries.len());
        self.entries.push((descriptor, tier));
    }

    pub fn route(&self, name: &str) -> Option<ToolTier> {
        self.index.get(name).map(|idx| self.entries[*idx].1)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.entries.iter().map(|(descriptor, _)| descriptor)
    }

    pub fn source(&self) -> ToolSource {
        self.source
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
