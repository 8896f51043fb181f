//! Read-only projections of the collector state.
//!
//! Everything here works on an immutable borrow taken under the shared read
//! lock, so one call always sees a complete, internally consistent
//! snapshot. Unknown item ids signal `NotFound`; list sub-resources of an
//! unknown owning id yield an empty sequence, never an error.

use serde_json::{json, Value};

use crate::error_handling::types::QueryError;
use crate::ingest::Collector;
use crate::store::RecordKind;

fn to_json<T: serde::Serialize>(record: &T) -> Value {
    serde_json::to_value(record).unwrap_or(Value::Null)
}

/// Address records carry their live aggregate counts on the query surface.
fn with_aggregate(collector: &Collector, mut value: Value) -> Value {
    let (live, total) = value
        .get("identity")
        .and_then(Value::as_str)
        .and_then(|id| collector.aggregator().aggregate(id))
        .map(|a| (a.flow_pairs_live, a.flow_pairs_total))
        .unwrap_or((0, 0));
    if let Some(map) = value.as_object_mut() {
        map.insert("currentFlows".to_string(), json!(live));
        map.insert("totalFlows".to_string(), json!(total));
    }
    value
}

pub fn list(collector: &Collector, kind: RecordKind) -> Vec<Value> {
    match kind {
        RecordKind::Address => collector
            .store()
            .list_json(kind)
            .into_iter()
            .map(|v| with_aggregate(collector, v))
            .collect(),
        RecordKind::Collector => vec![to_json(&collector.info())],
        _ => collector.store().list_json(kind),
    }
}

pub fn item(collector: &Collector, kind: RecordKind, id: &str) -> Result<Value, QueryError> {
    match kind {
        RecordKind::Address => collector
            .store()
            .get_json(kind, id)
            .map(|v| with_aggregate(collector, v))
            .ok_or(QueryError::NotFound),
        RecordKind::Collector => {
            let info = collector.info();
            if info.identity == id {
                Ok(to_json(&info))
            } else {
                Err(QueryError::NotFound)
            }
        }
        _ => collector
            .store()
            .get_json(kind, id)
            .ok_or(QueryError::NotFound),
    }
}

/// Kind-specific sub-resource views. List-shaped views return an array
/// (empty for an unknown owning id); singular views return the referenced
/// item or `NotFound`.
pub fn sub_resource(
    collector: &Collector,
    kind: RecordKind,
    id: &str,
    sub: &str,
) -> Result<Value, QueryError> {
    let store = collector.store();
    match (kind, sub) {
        (RecordKind::Site, "processes") => Ok(Value::Array(store.processes_for_site(id))),
        (RecordKind::Site, "routers") => Ok(Value::Array(store.routers_for_site(id))),
        (RecordKind::Site, "links") => Ok(Value::Array(store.links_for_site(id))),
        (RecordKind::Site, "hosts") => Ok(Value::Array(store.hosts_for_site(id))),

        (RecordKind::Router, "flows") => Ok(Value::Array(store.flows_for_router(id))),
        (RecordKind::Router, "links") => Ok(Value::Array(store.links_for_router(id))),
        (RecordKind::Router, "listeners") => Ok(Value::Array(store.listeners_for_router(id))),
        (RecordKind::Router, "connectors") => Ok(Value::Array(store.connectors_for_router(id))),

        (RecordKind::Listener, "flows") => Ok(Value::Array(store.flows_for_parent(id))),

        (RecordKind::Connector, "flows") => Ok(Value::Array(store.flows_for_parent(id))),
        (RecordKind::Connector, "process") => store
            .connectors
            .get(id)
            .and_then(|c| c.process.as_deref())
            .and_then(|p| store.get_json(RecordKind::Process, p))
            .ok_or(QueryError::NotFound),

        (RecordKind::Address, "processes") => {
            let processes: Vec<Value> = store
                .connectors
                .values()
                .filter(|c| c.address.as_deref() == Some(id))
                .filter_map(|c| c.process.as_deref())
                .filter_map(|p| store.get_json(RecordKind::Process, p))
                .collect();
            Ok(Value::Array(processes))
        }
        (RecordKind::Address, "processpairs") => {
            let pairs: Vec<Value> = collector
                .aggregator()
                .process_pair_ids(id)
                .iter()
                .filter_map(|pp| store.get_json(RecordKind::ProcessPair, pp))
                .collect();
            Ok(Value::Array(pairs))
        }
        (RecordKind::Address, "flows") => Ok(Value::Array(store.flows_for_address(id))),
        (RecordKind::Address, "flowpairs") => Ok(Value::Array(store.flow_pairs_for_address(id))),
        (RecordKind::Address, "listeners") => Ok(Value::Array(store.listeners_for_address(id))),
        (RecordKind::Address, "connectors") => Ok(Value::Array(store.connectors_for_address(id))),

        (RecordKind::Process, "flows") => Ok(Value::Array(store.flows_for_process(id))),
        (RecordKind::Process, "addresses") => {
            let addresses: Vec<Value> = store
                .connectors
                .values()
                .filter(|c| c.process.as_deref() == Some(id))
                .filter_map(|c| c.address.as_deref())
                .filter_map(|a| store.get_json(RecordKind::Address, a))
                .map(|v| with_aggregate(collector, v))
                .collect();
            Ok(Value::Array(addresses))
        }
        (RecordKind::Process, "connector") => store
            .connectors
            .values()
            .find(|c| c.process.as_deref() == Some(id))
            .map(to_json)
            .ok_or(QueryError::NotFound),

        (RecordKind::ProcessGroup, "processes") => Ok(Value::Array(store.processes_for_group(id))),

        (RecordKind::Flow, "process") => store
            .flows
            .get(id)
            .and_then(|f| store.process_of_flow(f))
            .map(to_json)
            .ok_or(QueryError::NotFound),

        (RecordKind::Collector, "connectors-to-process") => {
            Ok(diagnostics_for(collector, id, |c| {
                c.pairing()
                    .connectors_to_process()
                    .into_iter()
                    .map(|id| json!({ "connector": id }))
                    .collect()
            }))
        }
        (RecordKind::Collector, "flows-to-pair") => Ok(diagnostics_for(collector, id, |c| {
            c.pairing()
                .flows_to_pair()
                .into_iter()
                .map(|(waiting, awaited)| json!({ "flow": waiting, "awaiting": awaited }))
                .collect()
        })),
        (RecordKind::Collector, "flows-to-process") => Ok(diagnostics_for(collector, id, |c| {
            c.pairing()
                .flows_to_process()
                .into_iter()
                .map(|id| json!({ "flowPair": id }))
                .collect()
        })),
        (RecordKind::Collector, "pair-to-aggregate") => Ok(diagnostics_for(collector, id, |c| {
            c.pairing()
                .pair_to_aggregate()
                .into_iter()
                .map(|id| json!({ "flowPair": id }))
                .collect()
        })),

        _ => Err(QueryError::NotFound),
    }
}

fn diagnostics_for<F>(collector: &Collector, id: &str, build: F) -> Value
where
    F: FnOnce(&Collector) -> Vec<Value>,
{
    if collector.info().identity == id {
        Value::Array(build(collector))
    } else {
        Value::Array(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::*;
    use crate::metrics::PipelineMetrics;

    fn collector_with_topology() -> Collector {
        let mut c = Collector::new("origin".to_string(), PipelineMetrics::new().unwrap());
        let apply = |c: &mut Collector, payload| {
            c.apply(RecordEvent {
                source: "r1".to_string(),
                op: EventOp::Create,
                payload,
            })
        };
        apply(
            &mut c,
            EventPayload::Router(RouterDelta {
                identity: "r1".into(),
                parent: Some("s1".into()),
                ..Default::default()
            }),
        );
        apply(
            &mut c,
            EventPayload::Listener(ListenerDelta {
                identity: "l1".into(),
                parent: Some("r1".into()),
                address: Some("svc".into()),
                ..Default::default()
            }),
        );
        c
    }

    #[test]
    fn unknown_item_is_not_found() {
        let c = collector_with_topology();
        assert_eq!(
            item(&c, RecordKind::Site, "missing").unwrap_err(),
            QueryError::NotFound
        );
        assert!(item(&c, RecordKind::Site, "s1").is_ok());
    }

    #[test]
    fn unknown_owner_sub_resource_is_an_empty_sequence() {
        let c = collector_with_topology();
        let flows = sub_resource(&c, RecordKind::Router, "missing", "flows").unwrap();
        assert_eq!(flows, Value::Array(Vec::new()));
    }

    #[test]
    fn unknown_sub_path_is_not_found() {
        let c = collector_with_topology();
        assert_eq!(
            sub_resource(&c, RecordKind::Router, "r1", "widgets").unwrap_err(),
            QueryError::NotFound
        );
    }

    #[test]
    fn address_item_carries_aggregate_counts() {
        let c = collector_with_topology();
        let address = item(&c, RecordKind::Address, "svc").unwrap();
        assert_eq!(address["currentFlows"], json!(0));
        assert_eq!(address["totalFlows"], json!(0));
    }

    #[test]
    fn collector_diagnostics_require_the_collector_id() {
        let c = collector_with_topology();
        let id = c.info().identity;
        let listed = list(&c, RecordKind::Collector);
        assert_eq!(listed.len(), 1);
        assert!(item(&c, RecordKind::Collector, &id).is_ok());
        assert_eq!(
            item(&c, RecordKind::Collector, "other").unwrap_err(),
            QueryError::NotFound
        );
        let diag = sub_resource(&c, RecordKind::Collector, &id, "flows-to-pair").unwrap();
        assert_eq!(diag, Value::Array(Vec::new()));
    }
}
