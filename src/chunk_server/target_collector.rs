use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Placement-relevant view of one candidate node.
#[derive(Clone, Debug)]
pub struct PlacementCandidate {
    pub node_id: String,
    pub rack: Option<String>,
    pub fill_factor: f64,
    pub pending_placements: usize,
}

/// Picks write targets for one chunk. Nodes already holding a replica are forbidden, and so is
/// every rack at its replica limit.
pub struct TargetCollector {
    max_replicas_per_rack: usize,
    per_rack_counters: BTreeMap<String, usize>,
    forbidden_nodes: BTreeSet<String>,
    added_nodes: Vec<String>,
}

impl TargetCollector {
    /// `existing` lists the (node, rack) pairs of the chunk's stored replicas.
    pub fn new<'a, I>(max_replicas_per_rack: usize, existing: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
    {
        let mut collector = TargetCollector {
            max_replicas_per_rack,
            per_rack_counters: BTreeMap::new(),
            forbidden_nodes: BTreeSet::new(),
            added_nodes: Vec::new(),
        };
        for (node_id, rack) in existing {
            collector.increase_rack_usage(rack);
            collector.forbidden_nodes.insert(node_id.to_string());
        }
        collector
    }

    /// Forbids a node without counting it against its rack.
    pub fn forbid_node(&mut self, node_id: &str) {
        self.forbidden_nodes.insert(node_id.to_string());
    }

    pub fn check_node(&self, candidate: &PlacementCandidate) -> bool {
        if self.forbidden_nodes.contains(&candidate.node_id) {
            return false;
        }
        match &candidate.rack {
            Some(rack) => self.per_rack_counters.get(rack).copied().unwrap_or(0) < self.max_replicas_per_rack,
            None => true,
        }
    }

    pub fn add_node(&mut self, candidate: &PlacementCandidate) {
        self.increase_rack_usage(candidate.rack.as_deref());
        self.forbidden_nodes.insert(candidate.node_id.clone());
        self.added_nodes.push(candidate.node_id.clone());
    }

    /// Adds up to `count` of the least loaded admissible candidates.
    pub fn collect(mut self, candidates: &[PlacementCandidate], count: usize) -> Vec<String> {
        let mut ordered: Vec<&PlacementCandidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| compare_load(a, b));

        for candidate in ordered {
            if self.added_nodes.len() >= count {
                break;
            }
            if self.check_node(candidate) {
                self.add_node(candidate);
            }
        }
        self.added_nodes
    }

    fn increase_rack_usage(&mut self, rack: Option<&str>) {
        if let Some(rack) = rack {
            *self.per_rack_counters.entry(rack.to_string()).or_insert(0) += 1;
        }
    }
}

fn compare_load(a: &PlacementCandidate, b: &PlacementCandidate) -> Ordering {
    a.fill_factor
        .partial_cmp(&b.fill_factor)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.pending_placements.cmp(&b.pending_placements))
        .then_with(|| a.node_id.cmp(&b.node_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(node_id: &str, rack: Option<&str>, fill_factor: f64, pending: usize) -> PlacementCandidate {
        PlacementCandidate {
            node_id: node_id.to_string(),
            rack: rack.map(str::to_string),
            fill_factor,
            pending_placements: pending,
        }
    }

    #[test]
    fn prefers_empty_nodes_and_skips_replica_holders() {
        let candidates = vec![
            candidate("n1", None, 0.9, 0),
            candidate("n2", None, 0.1, 0),
            candidate("n3", None, 0.1, 2),
            candidate("n4", None, 0.0, 0),
        ];
        let collector = TargetCollector::new(1, vec![("n4", None)]);
        assert_eq!(collector.collect(&candidates, 2), vec!["n2".to_string(), "n3".to_string()]);
    }

    #[test]
    fn rack_limit_spreads_replicas() {
        let candidates = vec![
            candidate("a1", Some("a"), 0.0, 0),
            candidate("a2", Some("a"), 0.0, 0),
            candidate("b1", Some("b"), 0.5, 0),
            candidate("c1", Some("c"), 0.7, 0),
        ];
        let collector = TargetCollector::new(1, vec![("c0", Some("c"))]);
        // Rack c is full already; rack a takes one.
        assert_eq!(collector.collect(&candidates, 3), vec!["a1".to_string(), "b1".to_string()]);
    }
}
