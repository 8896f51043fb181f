//! Address-scoped relationship summaries.
//!
//! For every logical address the aggregator tracks how many flow pairs are
//! live, how many were ever seen, and which derived process / process-group
//! pairs contribute to it. Updates are incremental on pair creation and
//! eviction; a full rebuild exists only as a recovery fallback.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::store::EntityStore;

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressAggregate {
    pub flow_pairs_live: u64,
    pub flow_pairs_total: u64,
    /// Derived pair id -> live flow pairs contributing to it.
    #[serde(skip)]
    pub process_pairs: BTreeMap<String, u64>,
    #[serde(skip)]
    pub process_group_pairs: BTreeMap<String, u64>,
}

#[derive(Default)]
pub struct AddressAggregator {
    aggregates: BTreeMap<String, AddressAggregate>,
}

impl AddressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(&self, address: &str) -> Option<&AddressAggregate> {
        self.aggregates.get(address)
    }

    /// Distinct derived process-pair ids observed on an address.
    pub fn process_pair_ids(&self, address: &str) -> Vec<String> {
        self.aggregates
            .get(address)
            .map(|a| a.process_pairs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pair_created(&mut self, address: &str) {
        let entry = self.aggregates.entry(address.to_string()).or_default();
        entry.flow_pairs_live += 1;
        entry.flow_pairs_total += 1;
    }

    /// Decrements the live count and drops the entry once it reaches zero.
    /// Counts saturate: evicting more than was created never goes negative.
    pub fn pair_evicted(&mut self, address: &str) {
        if let Some(entry) = self.aggregates.get_mut(address) {
            entry.flow_pairs_live = entry.flow_pairs_live.saturating_sub(1);
            if entry.flow_pairs_live == 0 {
                self.aggregates.remove(address);
            }
        }
    }

    /// Records a completed process / process-group derivation for a pair on
    /// this address.
    pub fn pairs_attached(&mut self, address: &str, process_pair: &str, group_pair: &str) {
        let entry = self.aggregates.entry(address.to_string()).or_default();
        *entry
            .process_pairs
            .entry(process_pair.to_string())
            .or_insert(0) += 1;
        *entry
            .process_group_pairs
            .entry(group_pair.to_string())
            .or_insert(0) += 1;
    }

    pub fn pairs_detached(&mut self, address: &str, process_pair: &str, group_pair: &str) {
        if let Some(entry) = self.aggregates.get_mut(address) {
            if let Some(count) = entry.process_pairs.get_mut(process_pair) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    entry.process_pairs.remove(process_pair);
                }
            }
            if let Some(count) = entry.process_group_pairs.get_mut(group_pair) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    entry.process_group_pairs.remove(group_pair);
                }
            }
        }
    }

    /// Recovery fallback: recompute every aggregate from the pairs currently
    /// held in the store. Not used on the steady-state path.
    pub fn rebuild(&mut self, store: &EntityStore) {
        self.aggregates.clear();
        for pair in store.flow_pairs.values() {
            let address = match pair.address.as_deref() {
                Some(a) => a,
                None => continue,
            };
            self.pair_created(address);
            // totals cannot be recovered from live records
            if let Some(entry) = self.aggregates.get_mut(address) {
                entry.flow_pairs_total = entry.flow_pairs_live;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_count_rises_and_falls() {
        let mut agg = AddressAggregator::new();
        agg.pair_created("svc");
        agg.pair_created("svc");
        assert_eq!(agg.aggregate("svc").map(|a| a.flow_pairs_live), Some(2));
        assert_eq!(agg.aggregate("svc").map(|a| a.flow_pairs_total), Some(2));

        agg.pair_evicted("svc");
        assert_eq!(agg.aggregate("svc").map(|a| a.flow_pairs_live), Some(1));

        agg.pair_evicted("svc");
        assert!(agg.aggregate("svc").is_none());
    }

    #[test]
    fn eviction_never_goes_negative() {
        let mut agg = AddressAggregator::new();
        agg.pair_evicted("svc");
        assert!(agg.aggregate("svc").is_none());

        agg.pair_created("svc");
        agg.pair_evicted("svc");
        agg.pair_evicted("svc");
        assert!(agg.aggregate("svc").is_none());
    }

    #[test]
    fn attached_pairs_tracked_per_address() {
        let mut agg = AddressAggregator::new();
        agg.pair_created("svc");
        agg.pairs_attached("svc", "pp1", "gp1");
        agg.pairs_attached("svc", "pp1", "gp1");
        assert_eq!(agg.process_pair_ids("svc"), vec!["pp1".to_string()]);

        agg.pairs_detached("svc", "pp1", "gp1");
        assert_eq!(agg.process_pair_ids("svc"), vec!["pp1".to_string()]);
        agg.pairs_detached("svc", "pp1", "gp1");
        assert!(agg.process_pair_ids("svc").is_empty());
    }
}
