//! Retention sweep.
//!
//! Periodically evicts completed flows (and, through the pairing engine,
//! any flow pair and aggregate contribution referencing them) once their
//! end stamp is older than the configured retention. Ended sites and
//! processes are swept on the same pass. Runs as just another writer on the
//! shared mutation path; every removal step is a no-op when its target is
//! already gone, so an interrupted pass can safely re-run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::ingest::processor::Collector;

pub struct TtlReaper {
    collector: Arc<RwLock<Collector>>,
    retention: chrono::Duration,
    period: Duration,
    cancel: CancellationToken,
}

impl TtlReaper {
    pub fn new(
        collector: Arc<RwLock<Collector>>,
        retention: chrono::Duration,
        period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            collector,
            retention,
            period,
            cancel,
        }
    }

    pub async fn run(self) {
        if self.retention.is_zero() {
            info!("flow record retention disabled, reaper not running");
            return;
        }
        info!(
            "reaper started, retention {}s period {}s",
            self.retention.num_seconds(),
            self.period.as_secs()
        );
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = sweep(&mut self.collector.write(), self.retention, Utc::now());
                    if evicted > 0 {
                        info!("reaper evicted {} expired flows", evicted);
                    }
                }
            }
        }
        info!("reaper stopped");
    }
}

/// One sweep pass over the store. Returns the number of flows evicted.
pub fn sweep(collector: &mut Collector, retention: chrono::Duration, now: DateTime<Utc>) -> usize {
    let expired = |end: Option<DateTime<Utc>>| end.map(|e| now - e > retention).unwrap_or(false);

    // flows first: each eviction removes the referencing pair and its
    // aggregate contributions before the flow itself
    let flows: Vec<String> = collector
        .store()
        .flows
        .values()
        .filter(|f| expired(f.end_time))
        .map(|f| f.identity.clone())
        .collect();
    let mut evicted = 0;
    for id in &flows {
        if collector.evict_flow(id) {
            debug!("evicted expired flow {}", id);
            evicted += 1;
        }
    }

    // sites aged out with their last router, and their hosts
    let sites: Vec<String> = collector
        .store()
        .sites
        .values()
        .filter(|s| expired(s.end_time))
        .filter(|s| {
            !collector
                .store()
                .routers
                .values()
                .any(|r| r.parent == s.identity)
        })
        .map(|s| s.identity.clone())
        .collect();
    for site in sites {
        let hosts: Vec<String> = collector
            .store()
            .hosts
            .values()
            .filter(|h| h.parent == site)
            .map(|h| h.identity.clone())
            .collect();
        for host in hosts {
            collector.store.hosts.remove(&host);
        }
        collector.store.sites.remove(&site);
        debug!("evicted aged-out site {}", site);
    }

    // ended processes, unless a surviving derived pair still references them
    let processes: Vec<String> = collector
        .store()
        .processes
        .values()
        .filter(|p| expired(p.end_time))
        .filter(|p| {
            !collector
                .store()
                .process_pairs
                .values()
                .any(|pair| pair.source_id == p.identity || pair.dest_id == p.identity)
        })
        .map(|p| p.identity.clone())
        .collect();
    for process in processes {
        collector.store.processes.remove(&process);
    }

    // groups left with no members
    let groups: Vec<String> = collector
        .store()
        .process_groups
        .values()
        .filter(|g| {
            !collector
                .store()
                .processes
                .values()
                .any(|p| p.group_identity.as_deref() == Some(&g.identity))
        })
        .filter(|g| {
            !collector
                .store()
                .process_group_pairs
                .values()
                .any(|pair| pair.source_id == g.identity || pair.dest_id == g.identity)
        })
        .map(|g| g.identity.clone())
        .collect();
    for group in groups {
        collector.store.process_groups.remove(&group);
    }

    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::*;
    use crate::metrics::PipelineMetrics;

    fn collector() -> Collector {
        Collector::new("test-origin".to_string(), PipelineMetrics::new().unwrap())
    }

    fn event(op: EventOp, payload: EventPayload) -> RecordEvent {
        RecordEvent {
            source: "r1".to_string(),
            op,
            payload,
        }
    }

    fn paired_collector(ended: Option<DateTime<Utc>>) -> Collector {
        let mut c = collector();
        c.apply(event(
            EventOp::Create,
            EventPayload::Router(RouterDelta {
                identity: "r1".into(),
                parent: Some("s1".into()),
                ..Default::default()
            }),
        ));
        c.apply(event(
            EventOp::Create,
            EventPayload::Router(RouterDelta {
                identity: "r2".into(),
                parent: Some("s2".into()),
                ..Default::default()
            }),
        ));
        c.apply(event(
            EventOp::Create,
            EventPayload::Connector(ConnectorDelta {
                identity: "c1".into(),
                parent: Some("r1".into()),
                address: Some("svc".into()),
                ..Default::default()
            }),
        ));
        c.apply(event(
            EventOp::Create,
            EventPayload::Listener(ListenerDelta {
                identity: "l1".into(),
                parent: Some("r2".into()),
                address: Some("svc".into()),
                ..Default::default()
            }),
        ));
        c.apply(event(
            EventOp::Create,
            EventPayload::Flow(FlowDelta {
                identity: "f1".into(),
                parent: Some("l1".into()),
                counter_flow: Some("g1".into()),
                end_time: ended,
                ..Default::default()
            }),
        ));
        c.apply(event(
            EventOp::Create,
            EventPayload::Flow(FlowDelta {
                identity: "g1".into(),
                parent: Some("c1".into()),
                counter_flow: Some("f1".into()),
                end_time: ended,
                ..Default::default()
            }),
        ));
        c
    }

    #[test]
    fn active_flows_survive_any_age() {
        let mut c = paired_collector(None);
        let evicted = sweep(&mut c, chrono::Duration::seconds(1), Utc::now());
        assert_eq!(evicted, 0);
        assert_eq!(c.store().flows.len(), 2);
        assert_eq!(c.store().flow_pairs.len(), 1);
    }

    #[test]
    fn expired_flows_and_their_pair_are_evicted() {
        let ended = Utc::now() - chrono::Duration::seconds(10);
        let mut c = paired_collector(Some(ended));
        assert_eq!(c.store().flow_pairs.len(), 1);

        let evicted = sweep(&mut c, chrono::Duration::seconds(1), Utc::now());
        assert_eq!(evicted, 2);
        assert!(c.store().flows.is_empty());
        assert!(c.store().flow_pairs.is_empty());
        assert!(c.store().site_pairs.is_empty());
        assert!(c.aggregator().aggregate("svc").is_none());

        // a second pass over the same state is a clean no-op
        assert_eq!(sweep(&mut c, chrono::Duration::seconds(1), Utc::now()), 0);
    }

    #[test]
    fn recent_completions_are_kept() {
        let ended = Utc::now();
        let mut c = paired_collector(Some(ended));
        let evicted = sweep(&mut c, chrono::Duration::seconds(300), Utc::now());
        assert_eq!(evicted, 0);
        assert_eq!(c.store().flow_pairs.len(), 1);
    }

    #[test]
    fn aged_out_site_is_swept_after_its_last_router() {
        let ended = Utc::now() - chrono::Duration::seconds(10);
        let mut c = paired_collector(Some(ended));
        c.apply(event(
            EventOp::Delete,
            EventPayload::Router(RouterDelta {
                identity: "r1".into(),
                ..Default::default()
            }),
        ));
        assert!(c.store().sites.get("s1").unwrap().end_time.is_some());

        // not yet past retention
        sweep(&mut c, chrono::Duration::hours(1), Utc::now());
        assert!(c.store().sites.contains_key("s1"));

        // force the site end stamp into the past and sweep again
        if let Some(site) = c.store.sites.get_mut("s1") {
            site.end_time = Some(Utc::now() - chrono::Duration::hours(2));
        }
        sweep(&mut c, chrono::Duration::hours(1), Utc::now());
        assert!(!c.store().sites.contains_key("s1"));
        assert!(c.store().sites.contains_key("s2"));
    }
}
