//! In-memory entity repository.
//!
//! Holds every record kind in a typed map keyed by identity. All mutation is
//! funneled through the ingest path (a single logical writer); everything
//! else reads through the shared lock held by the owning collector state.
//! `BTreeMap`s keep listings in stable identity order so projections
//! serialize deterministically.

use std::collections::BTreeMap;

use serde_json::Value;

use super::types::*;

#[derive(Default)]
pub struct EntityStore {
    pub(crate) sites: BTreeMap<String, SiteRecord>,
    pub(crate) hosts: BTreeMap<String, HostRecord>,
    pub(crate) routers: BTreeMap<String, RouterRecord>,
    pub(crate) links: BTreeMap<String, LinkRecord>,
    pub(crate) listeners: BTreeMap<String, ListenerRecord>,
    pub(crate) connectors: BTreeMap<String, ConnectorRecord>,
    pub(crate) addresses: BTreeMap<String, AddressRecord>,
    pub(crate) processes: BTreeMap<String, ProcessRecord>,
    pub(crate) process_groups: BTreeMap<String, ProcessGroupRecord>,
    pub(crate) flows: BTreeMap<String, FlowRecord>,
    pub(crate) flow_pairs: BTreeMap<String, FlowPairRecord>,
    pub(crate) site_pairs: BTreeMap<String, PairRecord>,
    pub(crate) process_pairs: BTreeMap<String, PairRecord>,
    pub(crate) process_group_pairs: BTreeMap<String, PairRecord>,
    pub(crate) event_sources: BTreeMap<String, EventSourceRecord>,
}

fn to_json<T: serde::Serialize>(record: &T) -> Value {
    serde_json::to_value(record).unwrap_or(Value::Null)
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialized item lookup. `RecordKind::Collector` records are not held
    /// here; the query layer synthesizes them.
    pub fn get_json(&self, kind: RecordKind, id: &str) -> Option<Value> {
        match kind {
            RecordKind::Site => self.sites.get(id).map(to_json),
            RecordKind::Host => self.hosts.get(id).map(to_json),
            RecordKind::Router => self.routers.get(id).map(to_json),
            RecordKind::Link => self.links.get(id).map(to_json),
            RecordKind::Listener => self.listeners.get(id).map(to_json),
            RecordKind::Connector => self.connectors.get(id).map(to_json),
            RecordKind::Address => self.addresses.get(id).map(to_json),
            RecordKind::Process => self.processes.get(id).map(to_json),
            RecordKind::ProcessGroup => self.process_groups.get(id).map(to_json),
            RecordKind::Flow => self.flows.get(id).map(to_json),
            RecordKind::FlowPair => self.flow_pairs.get(id).map(to_json),
            RecordKind::SitePair => self.site_pairs.get(id).map(to_json),
            RecordKind::ProcessPair => self.process_pairs.get(id).map(to_json),
            RecordKind::ProcessGroupPair => self.process_group_pairs.get(id).map(to_json),
            RecordKind::EventSource => self.event_sources.get(id).map(to_json),
            RecordKind::Collector => None,
        }
    }

    /// Serialized listing of every record of a kind, in identity order.
    pub fn list_json(&self, kind: RecordKind) -> Vec<Value> {
        match kind {
            RecordKind::Site => self.sites.values().map(to_json).collect(),
            RecordKind::Host => self.hosts.values().map(to_json).collect(),
            RecordKind::Router => self.routers.values().map(to_json).collect(),
            RecordKind::Link => self.links.values().map(to_json).collect(),
            RecordKind::Listener => self.listeners.values().map(to_json).collect(),
            RecordKind::Connector => self.connectors.values().map(to_json).collect(),
            RecordKind::Address => self.addresses.values().map(to_json).collect(),
            RecordKind::Process => self.processes.values().map(to_json).collect(),
            RecordKind::ProcessGroup => self.process_groups.values().map(to_json).collect(),
            RecordKind::Flow => self.flows.values().map(to_json).collect(),
            RecordKind::FlowPair => self.flow_pairs.values().map(to_json).collect(),
            RecordKind::SitePair => self.site_pairs.values().map(to_json).collect(),
            RecordKind::ProcessPair => self.process_pairs.values().map(to_json).collect(),
            RecordKind::ProcessGroupPair => {
                self.process_group_pairs.values().map(to_json).collect()
            }
            RecordKind::EventSource => self.event_sources.values().map(to_json).collect(),
            RecordKind::Collector => Vec::new(),
        }
    }

    /// Removes a record by kind and id. Removing an id that is already gone
    /// is a no-op returning `false`.
    pub fn delete(&mut self, kind: RecordKind, id: &str) -> bool {
        match kind {
            RecordKind::Site => self.sites.remove(id).is_some(),
            RecordKind::Host => self.hosts.remove(id).is_some(),
            RecordKind::Router => self.routers.remove(id).is_some(),
            RecordKind::Link => self.links.remove(id).is_some(),
            RecordKind::Listener => self.listeners.remove(id).is_some(),
            RecordKind::Connector => self.connectors.remove(id).is_some(),
            RecordKind::Address => self.addresses.remove(id).is_some(),
            RecordKind::Process => self.processes.remove(id).is_some(),
            RecordKind::ProcessGroup => self.process_groups.remove(id).is_some(),
            RecordKind::Flow => self.flows.remove(id).is_some(),
            RecordKind::FlowPair => self.flow_pairs.remove(id).is_some(),
            RecordKind::SitePair => self.site_pairs.remove(id).is_some(),
            RecordKind::ProcessPair => self.process_pairs.remove(id).is_some(),
            RecordKind::ProcessGroupPair => self.process_group_pairs.remove(id).is_some(),
            RecordKind::EventSource => self.event_sources.remove(id).is_some(),
            RecordKind::Collector => false,
        }
    }

    // Relationship resolution used by pairing and the query projections.

    /// Router owning a listener or connector id.
    pub fn router_of_parent(&self, parent: &str) -> Option<&RouterRecord> {
        let router_id = self
            .listeners
            .get(parent)
            .map(|l| l.parent.as_str())
            .or_else(|| self.connectors.get(parent).map(|c| c.parent.as_str()))?;
        self.routers.get(router_id)
    }

    /// Site a flow leg is attached at, via its listener/connector parent.
    pub fn site_of_flow(&self, flow: &FlowRecord) -> Option<&SiteRecord> {
        let router = self.router_of_parent(&flow.parent)?;
        self.sites.get(&router.parent)
    }

    /// Logical address served by a listener or connector id.
    pub fn address_of_parent(&self, parent: &str) -> Option<&str> {
        self.listeners
            .get(parent)
            .and_then(|l| l.address.as_deref())
            .or_else(|| self.connectors.get(parent).and_then(|c| c.address.as_deref()))
    }

    /// Workload attribution for a flow: the explicit reference when the
    /// router reported one, otherwise the process behind the connector for
    /// server-side legs.
    pub fn process_of_flow(&self, flow: &FlowRecord) -> Option<&ProcessRecord> {
        if let Some(id) = flow.process.as_deref() {
            return self.processes.get(id);
        }
        self.connectors
            .get(&flow.parent)
            .and_then(|c| c.process.as_deref())
            .and_then(|id| self.processes.get(id))
    }

    // Owner-filtered listings backing the sub-resource projections. An
    // unknown owning id simply yields an empty sequence.

    pub fn routers_for_site(&self, site: &str) -> Vec<Value> {
        self.routers
            .values()
            .filter(|r| r.parent == site)
            .map(to_json)
            .collect()
    }

    pub fn hosts_for_site(&self, site: &str) -> Vec<Value> {
        self.hosts
            .values()
            .filter(|h| h.parent == site)
            .map(to_json)
            .collect()
    }

    pub fn processes_for_site(&self, site: &str) -> Vec<Value> {
        self.processes
            .values()
            .filter(|p| p.parent == site)
            .map(to_json)
            .collect()
    }

    pub fn links_for_site(&self, site: &str) -> Vec<Value> {
        self.links
            .values()
            .filter(|l| {
                self.routers
                    .get(&l.parent)
                    .map(|r| r.parent == site)
                    .unwrap_or(false)
            })
            .map(to_json)
            .collect()
    }

    pub fn links_for_router(&self, router: &str) -> Vec<Value> {
        self.links
            .values()
            .filter(|l| l.parent == router)
            .map(to_json)
            .collect()
    }

    pub fn listeners_for_router(&self, router: &str) -> Vec<Value> {
        self.listeners
            .values()
            .filter(|l| l.parent == router)
            .map(to_json)
            .collect()
    }

    pub fn connectors_for_router(&self, router: &str) -> Vec<Value> {
        self.connectors
            .values()
            .filter(|c| c.parent == router)
            .map(to_json)
            .collect()
    }

    pub fn flows_for_parent(&self, parent: &str) -> Vec<Value> {
        self.flows
            .values()
            .filter(|f| f.parent == parent)
            .map(to_json)
            .collect()
    }

    pub fn flows_for_router(&self, router: &str) -> Vec<Value> {
        self.flows
            .values()
            .filter(|f| {
                self.router_of_parent(&f.parent)
                    .map(|r| r.identity == router)
                    .unwrap_or(false)
            })
            .map(to_json)
            .collect()
    }

    pub fn flows_for_process(&self, process: &str) -> Vec<Value> {
        self.flows
            .values()
            .filter(|f| {
                self.process_of_flow(f)
                    .map(|p| p.identity == process)
                    .unwrap_or(false)
            })
            .map(to_json)
            .collect()
    }

    pub fn listeners_for_address(&self, address: &str) -> Vec<Value> {
        self.listeners
            .values()
            .filter(|l| l.address.as_deref() == Some(address))
            .map(to_json)
            .collect()
    }

    pub fn connectors_for_address(&self, address: &str) -> Vec<Value> {
        self.connectors
            .values()
            .filter(|c| c.address.as_deref() == Some(address))
            .map(to_json)
            .collect()
    }

    pub fn flows_for_address(&self, address: &str) -> Vec<Value> {
        self.flows
            .values()
            .filter(|f| self.address_of_parent(&f.parent) == Some(address))
            .map(to_json)
            .collect()
    }

    pub fn flow_pairs_for_address(&self, address: &str) -> Vec<Value> {
        self.flow_pairs
            .values()
            .filter(|p| p.address.as_deref() == Some(address))
            .map(to_json)
            .collect()
    }

    pub fn processes_for_group(&self, group: &str) -> Vec<Value> {
        self.processes
            .values()
            .filter(|p| p.group_identity.as_deref() == Some(group))
            .map(to_json)
            .collect()
    }
}
