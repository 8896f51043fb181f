//! Counterflow correlation.
//!
//! Each half-flow carries the identity of its peer leg. The engine matches
//! the two legs into a `FlowPairRecord` exactly once per id pair, orienting
//! the leg attached at a listener as the client side and the leg attached at
//! a connector as the server side, then derives site, process and
//! process-group pairs from the matched legs. Work that cannot complete yet
//! (peer not arrived, topology not announced, process not resolvable) is
//! parked and retried when the missing record shows up; the parked tables
//! double as the collector's pipeline diagnostics.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::debug;

use super::aggregator::AddressAggregator;
use crate::store::{EntityStore, FlowPairRecord, FlowPairState, FlowState, PairRecord};

enum ParentKind {
    Listener,
    Connector,
    Unknown,
}

fn pair_identity(source: &str, dest: &str) -> String {
    format!("{}-to-{}", source, dest)
}

#[derive(Default)]
pub struct PairingEngine {
    /// Awaited flow id -> the flow waiting for it.
    pending_pairs: BTreeMap<String, String>,
    /// Mutually matched legs that could not be oriented yet because their
    /// listener/connector/router/site records have not all arrived.
    unoriented: Vec<(String, String)>,
    /// Membership index: flow id -> flow pair id. Checked before insert so a
    /// pair is formed at most once per id pair.
    paired: BTreeMap<String, String>,
    /// Flow pairs whose process attribution is incomplete.
    pending_attribution: BTreeSet<String>,
    /// Connectors whose process reference has not resolved.
    unresolved_connectors: BTreeSet<String>,
    /// Pairs queued for aggregate propagation; drained within the same
    /// mutation, so non-empty content means interrupted work.
    aggregate_queue: Vec<String>,
}

impl PairingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reacts to a flow create/update. Returns the identities of any flow
    /// pairs formed by this change.
    pub fn flow_changed(
        &mut self,
        store: &mut EntityStore,
        agg: &mut AddressAggregator,
        flow_id: &str,
    ) -> Vec<String> {
        let flow = match store.flows.get(flow_id) {
            Some(f) => f.clone(),
            None => return Vec::new(),
        };

        if let Some(pair_id) = self.paired.get(flow_id).cloned() {
            self.sync_pair_end(store, &pair_id);
            return Vec::new();
        }

        let mut formed = Vec::new();

        if let Some(counter) = flow.counter_flow.clone() {
            let mutual = store
                .flows
                .get(&counter)
                .map(|peer| peer.counter_flow.as_deref() == Some(flow_id))
                .unwrap_or(false);
            if mutual {
                formed.extend(self.try_pair(store, agg, flow_id, &counter));
            } else {
                self.pending_pairs
                    .insert(counter, flow_id.to_string());
            }
        }

        // Someone may have been waiting for this leg.
        if let Some(waiting) = self.pending_pairs.remove(flow_id) {
            let mutual = flow.counter_flow.as_deref() == Some(waiting.as_str());
            if mutual {
                formed.extend(self.try_pair(store, agg, &waiting, flow_id));
            } else {
                // counterflow not set on this leg yet; keep waiting
                self.pending_pairs.insert(flow_id.to_string(), waiting);
            }
        }

        formed
    }

    /// Retry parked work after a topology record (site, router, listener,
    /// connector) arrived.
    pub fn topology_changed(
        &mut self,
        store: &mut EntityStore,
        agg: &mut AddressAggregator,
    ) -> Vec<String> {
        let mut formed = Vec::new();
        let parked = std::mem::take(&mut self.unoriented);
        for (a, b) in parked {
            formed.extend(self.try_pair(store, agg, &a, &b));
        }
        self.retry_attributions(store, agg);
        formed
    }

    /// Recomputes the unresolved state of one connector, then retries parked
    /// work that may depend on it.
    pub fn connector_changed(
        &mut self,
        store: &mut EntityStore,
        agg: &mut AddressAggregator,
        connector_id: &str,
    ) -> Vec<String> {
        match store.connectors.get(connector_id) {
            Some(c) => {
                let resolved = c
                    .process
                    .as_deref()
                    .map(|p| store.processes.contains_key(p))
                    .unwrap_or(false);
                if resolved {
                    self.unresolved_connectors.remove(connector_id);
                } else {
                    self.unresolved_connectors.insert(connector_id.to_string());
                }
            }
            None => {
                self.unresolved_connectors.remove(connector_id);
            }
        }
        self.topology_changed(store, agg)
    }

    /// Retry parked work after a process or process-group record arrived.
    pub fn process_changed(&mut self, store: &mut EntityStore, agg: &mut AddressAggregator) {
        let connectors: Vec<String> = self.unresolved_connectors.iter().cloned().collect();
        for id in connectors {
            let resolved = store
                .connectors
                .get(&id)
                .and_then(|c| c.process.as_deref())
                .map(|p| store.processes.contains_key(p))
                .unwrap_or(false);
            if resolved {
                self.unresolved_connectors.remove(&id);
            }
        }
        self.retry_attributions(store, agg);
    }

    /// Evicts one flow together with any flow pair referencing it,
    /// decrementing derived pairs and aggregates first so no dangling
    /// reference survives. Every step is a no-op when its target is already
    /// gone, so an interrupted sweep can safely re-run.
    pub fn remove_flow(
        &mut self,
        store: &mut EntityStore,
        agg: &mut AddressAggregator,
        flow_id: &str,
    ) -> bool {
        if let Some(pair_id) = self.paired.remove(flow_id) {
            self.pending_attribution.remove(&pair_id);
            if let Some(pair) = store.flow_pairs.remove(&pair_id) {
                if let Some(address) = pair.address.as_deref() {
                    agg.pair_evicted(address);
                    if let (Some(pp), Some(gp)) =
                        (pair.process_pair.as_deref(), pair.process_group_pair.as_deref())
                    {
                        agg.pairs_detached(address, pp, gp);
                    }
                }
                decrement_pair(
                    &mut store.site_pairs,
                    &pair_identity(&pair.source_site, &pair.dest_site),
                );
                if let Some(pp) = pair.process_pair.as_deref() {
                    decrement_pair(&mut store.process_pairs, pp);
                }
                if let Some(gp) = pair.process_group_pair.as_deref() {
                    decrement_pair(&mut store.process_group_pairs, gp);
                }
                self.paired.remove(&pair.client_flow);
                self.paired.remove(&pair.server_flow);
            }
        }

        self.pending_pairs
            .retain(|awaited, waiting| awaited != flow_id && waiting != flow_id);
        self.unoriented
            .retain(|(a, b)| a != flow_id && b != flow_id);

        store.flows.remove(flow_id).is_some()
    }

    // Diagnostics surface.

    pub fn pending_pair_count(&self) -> usize {
        self.pending_pairs.len() + self.unoriented.len()
    }

    pub fn pending_attribution_count(&self) -> usize {
        self.pending_attribution.len()
    }

    /// Flows parked awaiting their peer leg, as `(waiting, awaited)` pairs.
    pub fn flows_to_pair(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .pending_pairs
            .iter()
            .map(|(awaited, waiting)| (waiting.clone(), awaited.clone()))
            .collect();
        out.extend(self.unoriented.iter().cloned());
        out
    }

    /// Flow pairs parked awaiting process attribution.
    pub fn flows_to_process(&self) -> Vec<String> {
        self.pending_attribution.iter().cloned().collect()
    }

    pub fn connectors_to_process(&self) -> Vec<String> {
        self.unresolved_connectors.iter().cloned().collect()
    }

    pub fn pair_to_aggregate(&self) -> Vec<String> {
        self.aggregate_queue.clone()
    }

    fn try_pair(
        &mut self,
        store: &mut EntityStore,
        agg: &mut AddressAggregator,
        a: &str,
        b: &str,
    ) -> Option<String> {
        if self.paired.contains_key(a) || self.paired.contains_key(b) {
            return None;
        }
        let (flow_a, flow_b) = match (store.flows.get(a), store.flows.get(b)) {
            (Some(fa), Some(fb)) => (fa.clone(), fb.clone()),
            _ => return None,
        };
        if flow_a.counter_flow.as_deref() != Some(b) || flow_b.counter_flow.as_deref() != Some(a) {
            return None;
        }

        let (client, server) = match (
            parent_kind(store, &flow_a.parent),
            parent_kind(store, &flow_b.parent),
        ) {
            (ParentKind::Listener, ParentKind::Connector) => (flow_a, flow_b),
            (ParentKind::Connector, ParentKind::Listener) => (flow_b, flow_a),
            _ => {
                debug!("pairing parked, legs {}/{} not orientable yet", a, b);
                self.park_unoriented(a, b);
                return None;
            }
        };

        let (source_site, dest_site) = match (
            store.site_of_flow(&client).map(|s| s.identity.clone()),
            store.site_of_flow(&server).map(|s| s.identity.clone()),
        ) {
            (Some(src), Some(dst)) => (src, dst),
            _ => {
                debug!(
                    "pairing parked, sites for legs {}/{} not announced yet",
                    client.identity, server.identity
                );
                self.park_unoriented(&client.identity, &server.identity);
                return None;
            }
        };

        let address = store
            .address_of_parent(&client.parent)
            .or_else(|| store.address_of_parent(&server.parent))
            .map(|a| a.to_string());

        let pair_id = pair_identity(&client.identity, &server.identity);
        if store.flow_pairs.contains_key(&pair_id) {
            self.paired.insert(client.identity.clone(), pair_id.clone());
            self.paired.insert(server.identity.clone(), pair_id.clone());
            return None;
        }

        let end_time = pair_end(client.end_time, server.end_time);
        let record = FlowPairRecord {
            identity: pair_id.clone(),
            start_time: client.start_time.min(server.start_time),
            end_time,
            address: address.clone(),
            source_site: source_site.clone(),
            dest_site: dest_site.clone(),
            client_flow: client.identity.clone(),
            server_flow: server.identity.clone(),
            process_pair: None,
            process_group_pair: None,
            state: FlowPairState::Pending,
        };
        store.flow_pairs.insert(pair_id.clone(), record);
        self.paired.insert(client.identity.clone(), pair_id.clone());
        self.paired.insert(server.identity.clone(), pair_id.clone());
        for leg in [&client.identity, &server.identity] {
            if let Some(f) = store.flows.get_mut(leg) {
                f.state = FlowState::Paired;
            }
        }

        upsert_pair(
            &mut store.site_pairs,
            &source_site,
            &dest_site,
            client.start_time,
        );

        self.aggregate_queue.push(pair_id.clone());
        self.propagate_aggregates(store, agg);
        self.attempt_attribution(store, agg, &pair_id);

        debug!("flow pair {} formed ({} -> {})", pair_id, source_site, dest_site);
        Some(pair_id)
    }

    fn park_unoriented(&mut self, a: &str, b: &str) {
        let present = self
            .unoriented
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a));
        if !present {
            self.unoriented.push((a.to_string(), b.to_string()));
        }
    }

    fn propagate_aggregates(&mut self, store: &EntityStore, agg: &mut AddressAggregator) {
        let queued = std::mem::take(&mut self.aggregate_queue);
        for pair_id in queued {
            if let Some(address) = store
                .flow_pairs
                .get(&pair_id)
                .and_then(|p| p.address.as_deref())
            {
                agg.pair_created(address);
            }
        }
    }

    fn retry_attributions(&mut self, store: &mut EntityStore, agg: &mut AddressAggregator) {
        let parked: Vec<String> = self.pending_attribution.iter().cloned().collect();
        for pair_id in parked {
            self.attempt_attribution(store, agg, &pair_id);
        }
    }

    /// Completes the process / process-group derivation for a pair when both
    /// legs resolve to a process; parks it otherwise. Parked derivations are
    /// invisible to queries until completed.
    fn attempt_attribution(
        &mut self,
        store: &mut EntityStore,
        agg: &mut AddressAggregator,
        pair_id: &str,
    ) {
        let pair = match store.flow_pairs.get(pair_id) {
            Some(p) => p.clone(),
            None => {
                self.pending_attribution.remove(pair_id);
                return;
            }
        };
        if pair.state == FlowPairState::Complete {
            return;
        }

        let resolve = |store: &EntityStore, leg: &str| {
            store
                .flows
                .get(leg)
                .and_then(|f| store.process_of_flow(f))
                .map(|p| (p.identity.clone(), p.group_identity.clone()))
        };
        let client = resolve(store, &pair.client_flow);
        let server = resolve(store, &pair.server_flow);

        let ((client_proc, client_group), (server_proc, server_group)) = match (client, server) {
            (Some(c), Some(s)) => (c, s),
            _ => {
                self.pending_attribution.insert(pair_id.to_string());
                return;
            }
        };
        let (client_group, server_group) = match (client_group, server_group) {
            (Some(c), Some(s)) => (c, s),
            _ => {
                self.pending_attribution.insert(pair_id.to_string());
                return;
            }
        };

        let pp_id = pair_identity(&client_proc, &server_proc);
        let gp_id = pair_identity(&client_group, &server_group);
        upsert_pair(
            &mut store.process_pairs,
            &client_proc,
            &server_proc,
            pair.start_time,
        );
        upsert_pair(
            &mut store.process_group_pairs,
            &client_group,
            &server_group,
            pair.start_time,
        );
        if let Some(p) = store.flow_pairs.get_mut(pair_id) {
            p.process_pair = Some(pp_id.clone());
            p.process_group_pair = Some(gp_id.clone());
            p.state = FlowPairState::Complete;
        }
        if let Some(address) = pair.address.as_deref() {
            agg.pairs_attached(address, &pp_id, &gp_id);
        }
        self.pending_attribution.remove(pair_id);
    }

    /// Keeps a pair's end stamp in step with its legs: set once both legs
    /// have ended.
    fn sync_pair_end(&self, store: &mut EntityStore, pair_id: &str) {
        let ends = match store.flow_pairs.get(pair_id) {
            Some(p) => (
                store.flows.get(&p.client_flow).and_then(|f| f.end_time),
                store.flows.get(&p.server_flow).and_then(|f| f.end_time),
            ),
            None => return,
        };
        if let Some(end) = pair_end(ends.0, ends.1) {
            if let Some(p) = store.flow_pairs.get_mut(pair_id) {
                p.end_time = Some(end);
            }
        }
    }
}

fn parent_kind(store: &EntityStore, parent: &str) -> ParentKind {
    if store.listeners.contains_key(parent) {
        ParentKind::Listener
    } else if store.connectors.contains_key(parent) {
        ParentKind::Connector
    } else {
        ParentKind::Unknown
    }
}

fn pair_end(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}

fn upsert_pair(
    map: &mut BTreeMap<String, PairRecord>,
    source: &str,
    dest: &str,
    start_time: DateTime<Utc>,
) {
    let id = pair_identity(source, dest);
    map.entry(id.clone())
        .and_modify(|p| p.record_count += 1)
        .or_insert_with(|| PairRecord {
            identity: id,
            start_time,
            source_id: source.to_string(),
            dest_id: dest.to_string(),
            record_count: 1,
        });
}

fn decrement_pair(map: &mut BTreeMap<String, PairRecord>, id: &str) {
    if let Some(p) = map.get_mut(id) {
        p.record_count = p.record_count.saturating_sub(1);
        if p.record_count == 0 {
            map.remove(id);
        }
    }
}
