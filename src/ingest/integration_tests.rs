//! End-to-end pipeline scenarios: events in, query projections out.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error_handling::types::QueryError;
use crate::ingest::processor::{Collector, IngestProcessor};
use crate::ingest::types::*;
use crate::metrics::PipelineMetrics;
use crate::query::query_layer;
use crate::reaper::ttl_reaper;
use crate::store::RecordKind;

fn collector() -> Collector {
    Collector::new("origin".to_string(), PipelineMetrics::new().unwrap())
}

fn apply(c: &mut Collector, op: EventOp, payload: EventPayload) {
    c.apply(RecordEvent {
        source: "test-router".to_string(),
        op,
        payload,
    });
}

/// Two sites, one address: connector c1 behind router r1 at site s1,
/// listener l1 on router r2 at site s2.
fn ingest_topology(c: &mut Collector) {
    apply(
        c,
        EventOp::Create,
        EventPayload::Router(RouterDelta {
            identity: "r1".into(),
            parent: Some("s1".into()),
            ..Default::default()
        }),
    );
    apply(
        c,
        EventOp::Create,
        EventPayload::Connector(ConnectorDelta {
            identity: "c1".into(),
            parent: Some("r1".into()),
            address: Some("a".into()),
            ..Default::default()
        }),
    );
    apply(
        c,
        EventOp::Create,
        EventPayload::Router(RouterDelta {
            identity: "r2".into(),
            parent: Some("s2".into()),
            ..Default::default()
        }),
    );
    apply(
        c,
        EventOp::Create,
        EventPayload::Listener(ListenerDelta {
            identity: "l1".into(),
            parent: Some("r2".into()),
            address: Some("a".into()),
            ..Default::default()
        }),
    );
}

fn ingest_flow(c: &mut Collector, id: &str, parent: &str, counter: &str) {
    apply(
        c,
        EventOp::Create,
        EventPayload::Flow(FlowDelta {
            identity: id.into(),
            parent: Some(parent.into()),
            counter_flow: Some(counter.into()),
            ..Default::default()
        }),
    );
}

#[test]
fn flow_pair_and_site_pair_show_up_on_the_query_surface() {
    let mut c = collector();
    ingest_topology(&mut c);
    ingest_flow(&mut c, "f1", "l1", "g1");
    ingest_flow(&mut c, "g1", "c1", "f1");

    let pairs = query_layer::list(&c, RecordKind::FlowPair);
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0]["clientFlow"], "f1");
    assert_eq!(pairs[0]["serverFlow"], "g1");

    let by_address =
        query_layer::sub_resource(&c, RecordKind::Address, "a", "flowpairs").unwrap();
    assert_eq!(by_address, Value::Array(pairs.clone()));

    let site_pairs = query_layer::list(&c, RecordKind::SitePair);
    assert_eq!(site_pairs.len(), 1);
    assert_eq!(site_pairs[0]["sourceId"], "s2");
    assert_eq!(site_pairs[0]["destId"], "s1");
}

#[test]
fn re_ingesting_identical_creates_changes_nothing() {
    let mut c = collector();
    ingest_topology(&mut c);
    ingest_flow(&mut c, "f1", "l1", "g1");
    ingest_flow(&mut c, "g1", "c1", "f1");

    // the whole stream again, verbatim
    ingest_topology(&mut c);
    ingest_flow(&mut c, "f1", "l1", "g1");
    ingest_flow(&mut c, "g1", "c1", "f1");

    assert_eq!(c.store().flows.len(), 2);
    assert_eq!(c.store().flow_pairs.len(), 1);
    assert_eq!(c.store().site_pairs.len(), 1);
    assert_eq!(query_layer::list(&c, RecordKind::Router).len(), 2);
    assert_eq!(
        c.aggregator().aggregate("a").map(|a| a.flow_pairs_live),
        Some(1)
    );
}

#[test]
fn retention_sweep_clears_pairs_and_aggregates() {
    let mut c = collector();
    ingest_topology(&mut c);
    ingest_flow(&mut c, "f1", "l1", "g1");
    ingest_flow(&mut c, "g1", "c1", "f1");

    // both legs ended beyond the retention window
    let ended = Utc::now() - chrono::Duration::seconds(5);
    for id in ["f1", "g1"] {
        apply(
            &mut c,
            EventOp::Update,
            EventPayload::Flow(FlowDelta {
                identity: id.into(),
                end_time: Some(ended),
                ..Default::default()
            }),
        );
    }
    assert!(c
        .store()
        .flow_pairs
        .get("f1-to-g1")
        .and_then(|p| p.end_time)
        .is_some());

    let evicted = ttl_reaper::sweep(&mut c, chrono::Duration::seconds(1), Utc::now());
    assert_eq!(evicted, 2);

    assert!(query_layer::list(&c, RecordKind::FlowPair).is_empty());
    let address = query_layer::item(&c, RecordKind::Address, "a").unwrap();
    assert_eq!(address["currentFlows"], serde_json::json!(0));
}

#[test]
fn duplicate_create_is_an_update() {
    let mut c = collector();
    ingest_topology(&mut c);
    apply(
        &mut c,
        EventOp::Create,
        EventPayload::Router(RouterDelta {
            identity: "r1".into(),
            parent: Some("s1".into()),
            name: Some("renamed".into()),
            ..Default::default()
        }),
    );
    assert_eq!(c.store().routers.len(), 2);
    assert_eq!(c.store().routers.get("r1").unwrap().name, "renamed");
}

#[test]
fn delete_of_unknown_ids_is_a_no_op() {
    let mut c = collector();
    ingest_topology(&mut c);
    for payload in [
        EventPayload::Router(RouterDelta {
            identity: "ghost".into(),
            ..Default::default()
        }),
        EventPayload::Flow(FlowDelta {
            identity: "ghost".into(),
            ..Default::default()
        }),
        EventPayload::Listener(ListenerDelta {
            identity: "ghost".into(),
            ..Default::default()
        }),
    ] {
        apply(&mut c, EventOp::Delete, payload);
    }
    assert_eq!(c.store().routers.len(), 2);
    assert_eq!(c.store().listeners.len(), 1);
}

#[test]
fn malformed_events_are_dropped_not_fatal() {
    let mut c = collector();
    // flow without a parent cannot be placed anywhere
    apply(
        &mut c,
        EventOp::Create,
        EventPayload::Flow(FlowDelta {
            identity: "f1".into(),
            ..Default::default()
        }),
    );
    assert!(c.store().flows.is_empty());
    assert_eq!(c.info().events_dropped, 1);

    // pipeline keeps going afterwards
    ingest_topology(&mut c);
    assert_eq!(c.store().routers.len(), 2);
}

#[test]
fn router_removal_cascades_to_its_children() {
    let mut c = collector();
    ingest_topology(&mut c);
    apply(
        &mut c,
        EventOp::Create,
        EventPayload::Link(LinkDelta {
            identity: "k1".into(),
            parent: Some("r1".into()),
            peer: Some("r2".into()),
            ..Default::default()
        }),
    );

    apply(
        &mut c,
        EventOp::Delete,
        EventPayload::Router(RouterDelta {
            identity: "r1".into(),
            ..Default::default()
        }),
    );

    assert!(!c.store().routers.contains_key("r1"));
    assert!(c.store().links.is_empty());
    assert!(c.store().connectors.is_empty());
    // s1 lost its last router and is now aging out
    assert!(c.store().sites.get("s1").unwrap().end_time.is_some());
    assert!(c.store().sites.get("s2").unwrap().end_time.is_none());
}

#[test]
fn counterflow_is_immutable_once_set() {
    let mut c = collector();
    ingest_topology(&mut c);
    ingest_flow(&mut c, "f1", "l1", "g1");
    apply(
        &mut c,
        EventOp::Update,
        EventPayload::Flow(FlowDelta {
            identity: "f1".into(),
            counter_flow: Some("other".into()),
            ..Default::default()
        }),
    );
    assert_eq!(
        c.store().flows.get("f1").unwrap().counter_flow.as_deref(),
        Some("g1")
    );
}

#[test]
fn unknown_owner_and_unknown_item_query_semantics() {
    let mut c = collector();
    ingest_topology(&mut c);

    let flows = query_layer::sub_resource(&c, RecordKind::Listener, "nope", "flows").unwrap();
    assert_eq!(flows, Value::Array(Vec::new()));
    assert_eq!(
        query_layer::item(&c, RecordKind::Flow, "nope").unwrap_err(),
        QueryError::NotFound
    );
}

#[test]
fn hosts_are_listed_under_their_site() {
    let mut c = collector();
    ingest_topology(&mut c);
    apply(
        &mut c,
        EventOp::Create,
        EventPayload::Host(HostDelta {
            identity: "h1".into(),
            parent: Some("s1".into()),
            name: Some("node-a".into()),
            ..Default::default()
        }),
    );

    let hosts = query_layer::sub_resource(&c, RecordKind::Site, "s1", "hosts").unwrap();
    assert_eq!(hosts.as_array().map(|a| a.len()), Some(1));
    assert!(query_layer::item(&c, RecordKind::Host, "h1").is_ok());
}

#[test]
fn event_sources_are_tracked_per_emitter() {
    let mut c = collector();
    ingest_topology(&mut c);
    let sources = query_layer::list(&c, RecordKind::EventSource);
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0]["identity"], "test-router");
    assert_eq!(sources[0]["messages"], serde_json::json!(4));
}

#[tokio::test]
async fn processor_drains_the_channel_until_cancelled() {
    let collector = Arc::new(RwLock::new(collector()));
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let processor = IngestProcessor::new(collector.clone(), rx, cancel.clone());
    let task = tokio::spawn(processor.run());

    tx.send(RecordEvent {
        source: "r1".to_string(),
        op: EventOp::Create,
        payload: EventPayload::Router(RouterDelta {
            identity: "r1".into(),
            parent: Some("s1".into()),
            ..Default::default()
        }),
    })
    .await
    .unwrap();

    // wait for the event to be applied
    for _ in 0..100 {
        if collector.read().store().routers.contains_key("r1") {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(collector.read().store().routers.contains_key("r1"));
    assert!(collector.read().store().sites.contains_key("s1"));

    cancel.cancel();
    task.await.unwrap();
}
