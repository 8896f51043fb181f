//! Single-writer mutation path.
//!
//! `Collector` owns the entity store together with the pairing engine and
//! address aggregator and is the only place records are written. The
//! `IngestProcessor` drains the router event channel and applies one event
//! at a time under the shared write lock, so pairing and aggregation are
//! either fully applied or not started from any reader's point of view.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error_handling::types::IngestError;
use crate::metrics::PipelineMetrics;
use crate::pairing::{AddressAggregator, PairingEngine};
use crate::store::*;

use super::types::*;

pub struct Collector {
    pub(crate) store: EntityStore,
    pub(crate) pairing: PairingEngine,
    pub(crate) aggregator: AddressAggregator,
    pub(crate) metrics: PipelineMetrics,
    identity: String,
    origin: String,
    started: chrono::DateTime<Utc>,
}

impl Collector {
    pub fn new(origin: String, metrics: PipelineMetrics) -> Self {
        Self {
            store: EntityStore::new(),
            pairing: PairingEngine::new(),
            aggregator: AddressAggregator::new(),
            metrics,
            identity: Uuid::new_v4().to_string(),
            origin,
            started: Utc::now(),
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn aggregator(&self) -> &AddressAggregator {
        &self.aggregator
    }

    pub fn pairing(&self) -> &PairingEngine {
        &self.pairing
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Snapshot of the collector's own record for the diagnostics surface.
    pub fn info(&self) -> CollectorInfo {
        CollectorInfo {
            identity: self.identity.clone(),
            origin: self.origin.clone(),
            start_time: self.started,
            events_processed: self.metrics.events_processed.get(),
            events_dropped: self.metrics.events_dropped.get(),
            flow_pairs_formed: self.metrics.flow_pairs_formed.get(),
            flows_evicted: self.metrics.flows_evicted.get(),
        }
    }

    /// Applies one router event. Malformed events are logged and dropped;
    /// nothing here is fatal and nothing rolls back.
    pub fn apply(&mut self, event: RecordEvent) {
        self.touch_event_source(&event.source);
        match self.apply_event(&event) {
            Ok(()) => self.metrics.events_processed.inc(),
            Err(e) => {
                warn!(
                    "dropping {} {:?} event for {} from {}: {}",
                    event.kind_label(),
                    event.op,
                    event.identity(),
                    event.source,
                    e
                );
                self.metrics.events_dropped.inc();
            }
        }
        self.sync_gauges();
    }

    /// Evicts one flow and everything referencing it. Safe to call for an
    /// id that is already gone.
    pub fn evict_flow(&mut self, flow_id: &str) -> bool {
        let removed = self
            .pairing
            .remove_flow(&mut self.store, &mut self.aggregator, flow_id);
        if removed {
            self.metrics.flows_evicted.inc();
        }
        self.sync_gauges();
        removed
    }

    fn note_formed(&self, formed: &[String]) {
        if !formed.is_empty() {
            self.metrics.flow_pairs_formed.inc_by(formed.len() as u64);
        }
    }

    fn sync_gauges(&self) {
        self.metrics
            .flow_pairs_active
            .set(self.store.flow_pairs.len() as i64);
        self.metrics
            .pending_pairings
            .set(self.pairing.pending_pair_count() as i64);
        self.metrics
            .pending_attributions
            .set(self.pairing.pending_attribution_count() as i64);
    }

    fn touch_event_source(&mut self, source: &str) {
        let now = Utc::now();
        self.store
            .event_sources
            .entry(source.to_string())
            .and_modify(|s| {
                s.messages += 1;
                s.last_heard = now;
            })
            .or_insert_with(|| EventSourceRecord {
                identity: source.to_string(),
                beacon_type: "ROUTER".to_string(),
                start_time: now,
                last_heard: now,
                messages: 1,
            });
    }

    fn apply_event(&mut self, event: &RecordEvent) -> Result<(), IngestError> {
        match (&event.payload, event.op) {
            (EventPayload::Site(d), EventOp::Delete) => {
                // sites are aged out, never dropped outright
                if let Some(site) = self.store.sites.get_mut(&d.identity) {
                    site.end_time = Some(Utc::now());
                }
                Ok(())
            }
            (EventPayload::Site(d), _) => {
                let now = Utc::now();
                let record = self
                    .store
                    .sites
                    .entry(d.identity.clone())
                    .or_insert_with(|| SiteRecord {
                        identity: d.identity.clone(),
                        start_time: now,
                        end_time: None,
                        name: d.identity.clone(),
                        provider: None,
                    });
                if let Some(name) = &d.name {
                    record.name = name.clone();
                }
                if d.provider.is_some() {
                    record.provider = d.provider.clone();
                }
                record.end_time = None;
                let formed = self
                    .pairing
                    .topology_changed(&mut self.store, &mut self.aggregator);
                self.note_formed(&formed);
                Ok(())
            }

            (EventPayload::Host(d), EventOp::Delete) => {
                self.store.delete(RecordKind::Host, &d.identity);
                Ok(())
            }
            (EventPayload::Host(d), _) => {
                let now = Utc::now();
                if !self.store.hosts.contains_key(&d.identity) {
                    let parent = d
                        .parent
                        .clone()
                        .ok_or(IngestError::MissingField("parent"))?;
                    self.store.hosts.insert(
                        d.identity.clone(),
                        HostRecord {
                            identity: d.identity.clone(),
                            parent,
                            start_time: now,
                            end_time: None,
                            name: d.identity.clone(),
                            provider: None,
                        },
                    );
                }
                if let Some(record) = self.store.hosts.get_mut(&d.identity) {
                    if let Some(name) = &d.name {
                        record.name = name.clone();
                    }
                    if d.provider.is_some() {
                        record.provider = d.provider.clone();
                    }
                }
                Ok(())
            }

            (EventPayload::Router(d), EventOp::Delete) => {
                self.remove_router(&d.identity);
                Ok(())
            }
            (EventPayload::Router(d), _) => {
                let now = Utc::now();
                if !self.store.routers.contains_key(&d.identity) {
                    let parent = d
                        .parent
                        .clone()
                        .ok_or(IngestError::MissingField("parent"))?;
                    self.ensure_site(&parent);
                    self.store.routers.insert(
                        d.identity.clone(),
                        RouterRecord {
                            identity: d.identity.clone(),
                            parent,
                            start_time: now,
                            end_time: None,
                            name: d.identity.clone(),
                            hostname: None,
                        },
                    );
                }
                if let Some(record) = self.store.routers.get_mut(&d.identity) {
                    if let Some(name) = &d.name {
                        record.name = name.clone();
                    }
                    if d.hostname.is_some() {
                        record.hostname = d.hostname.clone();
                    }
                }
                let formed = self
                    .pairing
                    .topology_changed(&mut self.store, &mut self.aggregator);
                self.note_formed(&formed);
                Ok(())
            }

            (EventPayload::Link(d), EventOp::Delete) => {
                self.store.delete(RecordKind::Link, &d.identity);
                Ok(())
            }
            (EventPayload::Link(d), _) => {
                let now = Utc::now();
                if !self.store.links.contains_key(&d.identity) {
                    let parent = d
                        .parent
                        .clone()
                        .ok_or(IngestError::MissingField("parent"))?;
                    self.store.links.insert(
                        d.identity.clone(),
                        LinkRecord {
                            identity: d.identity.clone(),
                            parent,
                            start_time: now,
                            end_time: None,
                            name: d.identity.clone(),
                            peer: None,
                            link_cost: None,
                        },
                    );
                }
                if let Some(record) = self.store.links.get_mut(&d.identity) {
                    if let Some(name) = &d.name {
                        record.name = name.clone();
                    }
                    if d.peer.is_some() {
                        record.peer = d.peer.clone();
                    }
                    if d.link_cost.is_some() {
                        record.link_cost = d.link_cost;
                    }
                }
                Ok(())
            }

            (EventPayload::Listener(d), EventOp::Delete) => {
                self.store.delete(RecordKind::Listener, &d.identity);
                Ok(())
            }
            (EventPayload::Listener(d), _) => {
                let now = Utc::now();
                if !self.store.listeners.contains_key(&d.identity) {
                    let parent = d
                        .parent
                        .clone()
                        .ok_or(IngestError::MissingField("parent"))?;
                    self.store.listeners.insert(
                        d.identity.clone(),
                        ListenerRecord {
                            identity: d.identity.clone(),
                            parent,
                            start_time: now,
                            end_time: None,
                            name: None,
                            address: None,
                            protocol: None,
                        },
                    );
                }
                if let Some(record) = self.store.listeners.get_mut(&d.identity) {
                    if d.name.is_some() {
                        record.name = d.name.clone();
                    }
                    if d.address.is_some() {
                        record.address = d.address.clone();
                    }
                    if d.protocol.is_some() {
                        record.protocol = d.protocol.clone();
                    }
                }
                if let Some(address) = &d.address {
                    self.ensure_address(address, d.protocol.as_deref());
                }
                let formed = self
                    .pairing
                    .topology_changed(&mut self.store, &mut self.aggregator);
                self.note_formed(&formed);
                Ok(())
            }

            (EventPayload::Connector(d), EventOp::Delete) => {
                self.store.delete(RecordKind::Connector, &d.identity);
                let formed = self
                    .pairing
                    .connector_changed(&mut self.store, &mut self.aggregator, &d.identity);
                self.note_formed(&formed);
                Ok(())
            }
            (EventPayload::Connector(d), _) => {
                let now = Utc::now();
                if !self.store.connectors.contains_key(&d.identity) {
                    let parent = d
                        .parent
                        .clone()
                        .ok_or(IngestError::MissingField("parent"))?;
                    self.store.connectors.insert(
                        d.identity.clone(),
                        ConnectorRecord {
                            identity: d.identity.clone(),
                            parent,
                            start_time: now,
                            end_time: None,
                            address: None,
                            protocol: None,
                            dest_host: None,
                            dest_port: None,
                            process: None,
                        },
                    );
                }
                if let Some(record) = self.store.connectors.get_mut(&d.identity) {
                    if d.address.is_some() {
                        record.address = d.address.clone();
                    }
                    if d.protocol.is_some() {
                        record.protocol = d.protocol.clone();
                    }
                    if d.dest_host.is_some() {
                        record.dest_host = d.dest_host.clone();
                    }
                    if d.dest_port.is_some() {
                        record.dest_port = d.dest_port.clone();
                    }
                    if d.process.is_some() {
                        record.process = d.process.clone();
                    }
                }
                if let Some(address) = &d.address {
                    self.ensure_address(address, d.protocol.as_deref());
                }
                let formed = self
                    .pairing
                    .connector_changed(&mut self.store, &mut self.aggregator, &d.identity);
                self.note_formed(&formed);
                Ok(())
            }

            (EventPayload::Process(d), EventOp::Delete) => {
                if let Some(p) = self.store.processes.get_mut(&d.identity) {
                    p.end_time = Some(Utc::now());
                }
                Ok(())
            }
            (EventPayload::Process(d), _) => {
                let now = Utc::now();
                if !self.store.processes.contains_key(&d.identity) {
                    let parent = d
                        .parent
                        .clone()
                        .ok_or(IngestError::MissingField("parent"))?;
                    self.store.processes.insert(
                        d.identity.clone(),
                        ProcessRecord {
                            identity: d.identity.clone(),
                            parent,
                            start_time: now,
                            end_time: None,
                            name: d.identity.clone(),
                            group_name: None,
                            group_identity: None,
                            source_host: None,
                            image_name: None,
                        },
                    );
                }
                let group = d.group.clone();
                if let Some(record) = self.store.processes.get_mut(&d.identity) {
                    if let Some(name) = &d.name {
                        record.name = name.clone();
                    }
                    if d.source_host.is_some() {
                        record.source_host = d.source_host.clone();
                    }
                    if d.image_name.is_some() {
                        record.image_name = d.image_name.clone();
                    }
                    if let Some(group) = &group {
                        record.group_name = Some(group.clone());
                        record.group_identity = Some(group.clone());
                    }
                }
                if let Some(group) = &group {
                    self.ensure_group(group);
                }
                self.pairing
                    .process_changed(&mut self.store, &mut self.aggregator);
                Ok(())
            }

            (EventPayload::Flow(d), EventOp::Delete) => {
                self.evict_flow(&d.identity);
                Ok(())
            }
            (EventPayload::Flow(d), _) => {
                if !self.store.flows.contains_key(&d.identity) {
                    let parent = d
                        .parent
                        .clone()
                        .ok_or(IngestError::MissingField("parent"))?;
                    self.store.flows.insert(
                        d.identity.clone(),
                        FlowRecord {
                            identity: d.identity.clone(),
                            parent,
                            start_time: d.start_time.unwrap_or_else(Utc::now),
                            end_time: None,
                            counter_flow: None,
                            source_host: None,
                            source_port: None,
                            octets: 0,
                            process: None,
                            state: FlowState::Active,
                        },
                    );
                }
                if let Some(record) = self.store.flows.get_mut(&d.identity) {
                    match (&record.counter_flow, &d.counter_flow) {
                        (None, Some(c)) => record.counter_flow = Some(c.clone()),
                        (Some(existing), Some(c)) if existing != c => {
                            // counterflow is immutable once set
                            warn!(
                                "flow {} counterflow change {} -> {} ignored",
                                d.identity, existing, c
                            );
                        }
                        _ => {}
                    }
                    if d.source_host.is_some() {
                        record.source_host = d.source_host.clone();
                    }
                    if d.source_port.is_some() {
                        record.source_port = d.source_port.clone();
                    }
                    if let Some(octets) = d.octets {
                        record.octets = octets;
                    }
                    if d.process.is_some() {
                        record.process = d.process.clone();
                    }
                    if d.end_time.is_some() {
                        record.end_time = d.end_time;
                    }
                }
                let formed =
                    self.pairing
                        .flow_changed(&mut self.store, &mut self.aggregator, &d.identity);
                self.note_formed(&formed);
                if d.process.is_some() {
                    self.pairing
                        .process_changed(&mut self.store, &mut self.aggregator);
                }
                Ok(())
            }
        }
    }

    /// Removes a router and, transitively, its links, listeners and
    /// connectors. The owning site is marked ended once its last router is
    /// gone.
    fn remove_router(&mut self, router_id: &str) {
        let router = match self.store.routers.remove(router_id) {
            Some(r) => r,
            None => return,
        };
        let links: Vec<String> = self
            .store
            .links
            .values()
            .filter(|l| l.parent == router_id)
            .map(|l| l.identity.clone())
            .collect();
        for id in links {
            self.store.links.remove(&id);
        }
        let listeners: Vec<String> = self
            .store
            .listeners
            .values()
            .filter(|l| l.parent == router_id)
            .map(|l| l.identity.clone())
            .collect();
        for id in listeners {
            self.store.listeners.remove(&id);
        }
        let connectors: Vec<String> = self
            .store
            .connectors
            .values()
            .filter(|c| c.parent == router_id)
            .map(|c| c.identity.clone())
            .collect();
        for id in connectors {
            self.store.connectors.remove(&id);
            let formed = self
                .pairing
                .connector_changed(&mut self.store, &mut self.aggregator, &id);
            self.note_formed(&formed);
        }

        let site_empty = !self
            .store
            .routers
            .values()
            .any(|r| r.parent == router.parent);
        if site_empty {
            if let Some(site) = self.store.sites.get_mut(&router.parent) {
                debug!("site {} has no routers left, marking ended", site.identity);
                site.end_time = Some(Utc::now());
            }
        }
    }

    fn ensure_site(&mut self, site_id: &str) {
        let record = self
            .store
            .sites
            .entry(site_id.to_string())
            .or_insert_with(|| SiteRecord {
                identity: site_id.to_string(),
                start_time: Utc::now(),
                end_time: None,
                name: site_id.to_string(),
                provider: None,
            });
        // a live router resurrects an aged-out site
        record.end_time = None;
    }

    fn ensure_address(&mut self, name: &str, protocol: Option<&str>) {
        let record = self
            .store
            .addresses
            .entry(name.to_string())
            .or_insert_with(|| AddressRecord {
                identity: name.to_string(),
                start_time: Utc::now(),
                end_time: None,
                name: name.to_string(),
                protocol: None,
            });
        if protocol.is_some() && record.protocol.is_none() {
            record.protocol = protocol.map(|p| p.to_string());
        }
    }

    fn ensure_group(&mut self, name: &str) {
        self.store
            .process_groups
            .entry(name.to_string())
            .or_insert_with(|| ProcessGroupRecord {
                identity: name.to_string(),
                start_time: Utc::now(),
                end_time: None,
                name: name.to_string(),
            });
    }
}

/// The single consumer of the router event channel. Events from one source
/// are serialized by channel order; the processor applies them under the
/// shared write lock and stops cooperatively between events.
pub struct IngestProcessor {
    collector: Arc<RwLock<Collector>>,
    events_rx: Receiver<RecordEvent>,
    cancel: CancellationToken,
}

impl IngestProcessor {
    pub fn new(
        collector: Arc<RwLock<Collector>>,
        events_rx: Receiver<RecordEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            collector,
            events_rx,
            cancel,
        }
    }

    pub async fn run(mut self) {
        info!("ingest processor started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.collector.write().apply(event),
                    None => break,
                },
            }
        }
        info!("ingest processor stopped");
    }
}
