//! Incremental single-linkage clustering at a fixed SNV threshold.
//!
//! Each configured algorithm maintains connected components over the
//! stored guids, linked by edges at or below its threshold and filtered by
//! its mixture policy. Cluster identity is stable: a cluster's id is the
//! smallest id it has ever carried, merges keep the smaller id, and
//! retired ids are never reused. Every membership change stamps the
//! affected guids with a fresh change-id so pollers can fetch deltas.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::dsu::DisjointSet;
use crate::core::config::ClusteringConfig;
use crate::core::errors::CoreError;
use crate::core::types::{ClusterId, Guid, MixturePolicy};
use crate::persist::SCHEMA_VERSION;

/// Per-cluster counts for the summary query.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub cluster_id: ClusterId,
    pub n_members: usize,
    pub n_mixed: usize,
    pub n_unmixed: usize,
}

/// One row of the delta query.
#[derive(Debug, Clone, Serialize)]
pub struct GuidClusterEntry {
    pub guid: Guid,
    pub cluster_id: ClusterId,
    pub change_id: u64,
    pub mixed: bool,
}

/// Durable snapshot of one clusterer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStateRecord {
    pub schema_version: u32,
    pub name: String,
    pub change_id: u64,
    pub next_cluster_id: u64,
    pub members: Vec<MemberRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRecord {
    pub guid: Guid,
    pub cluster_id: ClusterId,
    pub change_id: u64,
    pub mixed: bool,
    /// Host guid for mixed members held by `exclude_mixed_from_growth`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<Guid>,
}

pub struct Clusterer {
    config: ClusteringConfig,
    node_of: HashMap<Guid, usize>,
    guid_of: Vec<Guid>,
    dsu: DisjointSet,
    /// Stable cluster id per forest root; only roots of unattached nodes
    /// appear here
    cluster_of_root: HashMap<usize, ClusterId>,
    /// Mixed guids that joined a cluster through a host without being
    /// unioned; they never bridge
    attachment: HashMap<Guid, Guid>,
    mixed: HashMap<Guid, bool>,
    stamps: HashMap<Guid, u64>,
    change_id: u64,
    next_cluster_id: u64,
}

impl Clusterer {
    #[must_use]
    pub fn new(config: ClusteringConfig) -> Self {
        Self {
            config,
            node_of: HashMap::new(),
            guid_of: Vec::new(),
            dsu: DisjointSet::new(),
            cluster_of_root: HashMap::new(),
            attachment: HashMap::new(),
            mixed: HashMap::new(),
            stamps: HashMap::new(),
            change_id: 0,
            next_cluster_id: 1,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    #[must_use]
    pub fn change_id(&self) -> u64 {
        self.change_id
    }

    #[must_use]
    pub fn contains(&self, guid: &Guid) -> bool {
        self.node_of.contains_key(guid)
    }

    #[must_use]
    pub fn is_mixed(&self, guid: &Guid) -> Option<bool> {
        self.mixed.get(guid).copied()
    }

    /// Add a guid with its neighbour distances and update memberships.
    ///
    /// Neighbours above the threshold are ignored here, so the caller can
    /// pass every stored edge of the new guid. Advances the change-id by
    /// exactly one (a new guid is always a membership change). Re-inserting
    /// a known guid is a no-op.
    pub fn insert(&mut self, guid: &Guid, is_mixed: bool, neighbours: &[(Guid, u32)]) {
        if self.node_of.contains_key(guid) {
            return;
        }
        let node = self.dsu.add();
        self.node_of.insert(guid.clone(), node);
        self.guid_of.push(guid.clone());
        self.mixed.insert(guid.clone(), is_mixed);

        let fresh_id = ClusterId(self.next_cluster_id);
        self.next_cluster_id += 1;
        self.cluster_of_root.insert(node, fresh_id);

        let mut changed: HashSet<Guid> = HashSet::new();
        changed.insert(guid.clone());

        let mut admissible: Vec<(Guid, u32)> = neighbours
            .iter()
            .filter(|(other, snv)| *snv <= self.config.threshold && self.node_of.contains_key(other))
            .cloned()
            .collect();
        admissible.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        match self.config.mixture_policy {
            MixturePolicy::IncludeMixed => {
                for (other, _) in &admissible {
                    self.link(guid, other, &mut changed);
                }
            }
            MixturePolicy::ExcludeMixed => {
                if !is_mixed {
                    for (other, _) in &admissible {
                        if self.mixed.get(other) == Some(&false) {
                            self.link(guid, other, &mut changed);
                        }
                    }
                }
            }
            MixturePolicy::ExcludeMixedFromGrowth => {
                if is_mixed {
                    // nearest unmixed neighbour hosts this sample
                    if let Some((host, _)) =
                        admissible.iter().find(|(other, _)| self.mixed.get(other) == Some(&false))
                    {
                        self.attach(guid, &host.clone(), &mut changed);
                    }
                } else {
                    for (other, _) in &admissible {
                        if self.mixed.get(other) == Some(&false) {
                            self.link(guid, other, &mut changed);
                        }
                    }
                    // unhosted mixed neighbours now join this cluster,
                    // without becoming links themselves
                    for (other, _) in &admissible {
                        if self.mixed.get(other) == Some(&true)
                            && !self.attachment.contains_key(other)
                        {
                            self.attach(&other.clone(), guid, &mut changed);
                        }
                    }
                }
            }
        }

        self.advance(changed);
    }

    /// Apply one late-arriving edge. Advances the change-id only if a
    /// membership actually changed.
    pub fn apply_edge(&mut self, g1: &Guid, g2: &Guid, snv: u32) {
        if snv > self.config.threshold
            || !self.node_of.contains_key(g1)
            || !self.node_of.contains_key(g2)
        {
            return;
        }
        let mut changed = HashSet::new();
        match self.config.mixture_policy {
            MixturePolicy::IncludeMixed => self.link(g1, g2, &mut changed),
            MixturePolicy::ExcludeMixed => {
                if self.mixed.get(g1) == Some(&false) && self.mixed.get(g2) == Some(&false) {
                    self.link(g1, g2, &mut changed);
                }
            }
            MixturePolicy::ExcludeMixedFromGrowth => {
                match (self.mixed.get(g1) == Some(&true), self.mixed.get(g2) == Some(&true)) {
                    (false, false) => self.link(g1, g2, &mut changed),
                    (true, false) if !self.attachment.contains_key(g1) => {
                        self.attach(g1, g2, &mut changed);
                    }
                    (false, true) if !self.attachment.contains_key(g2) => {
                        self.attach(g2, g1, &mut changed);
                    }
                    _ => {}
                }
            }
        }
        if !changed.is_empty() {
            self.advance(changed);
        }
    }

    /// The cluster holding `guid`.
    #[must_use]
    pub fn cluster_of(&self, guid: &Guid) -> Option<ClusterId> {
        let resolved = self.attachment.get(guid).unwrap_or(guid);
        let node = *self.node_of.get(resolved)?;
        self.cluster_of_root.get(&self.dsu.find_readonly(node)).copied()
    }

    /// Every cluster with its members, ascending by cluster id.
    #[must_use]
    pub fn clusters(&self) -> BTreeMap<ClusterId, BTreeSet<Guid>> {
        let mut result: BTreeMap<ClusterId, BTreeSet<Guid>> = BTreeMap::new();
        for guid in &self.guid_of {
            if let Some(id) = self.cluster_of(guid) {
                result.entry(id).or_default().insert(guid.clone());
            }
        }
        result
    }

    /// Mixed/unmixed counts per cluster.
    #[must_use]
    pub fn summary(&self) -> Vec<ClusterSummary> {
        self.clusters()
            .into_iter()
            .map(|(cluster_id, members)| {
                let n_mixed = members
                    .iter()
                    .filter(|g| self.mixed.get(*g).copied().unwrap_or(false))
                    .count();
                ClusterSummary {
                    cluster_id,
                    n_members: members.len(),
                    n_mixed,
                    n_unmixed: members.len() - n_mixed,
                }
            })
            .collect()
    }

    /// Members of one cluster.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for a retired or never-issued id.
    pub fn members_of(&self, cluster_id: ClusterId) -> Result<Vec<Guid>, CoreError> {
        let members: Vec<Guid> = self
            .clusters()
            .remove(&cluster_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        if members.is_empty() {
            return Err(CoreError::NotFound(format!(
                "no cluster {cluster_id} in algorithm {}",
                self.config.name
            )));
        }
        Ok(members)
    }

    /// Live cluster ids, ascending.
    #[must_use]
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.clusters().into_keys().collect()
    }

    /// Guid-to-cluster rows, restricted to membership changes after
    /// `after_change_id` when given.
    #[must_use]
    pub fn guids2clusters(&self, after_change_id: Option<u64>) -> Vec<GuidClusterEntry> {
        let mut rows: Vec<GuidClusterEntry> = self
            .guid_of
            .iter()
            .filter(|guid| match after_change_id {
                Some(after) => self.stamps.get(*guid).copied().unwrap_or(0) > after,
                None => true,
            })
            .filter_map(|guid| {
                Some(GuidClusterEntry {
                    guid: guid.clone(),
                    cluster_id: self.cluster_of(guid)?,
                    change_id: self.stamps.get(guid).copied().unwrap_or(0),
                    mixed: self.mixed.get(guid).copied().unwrap_or(false),
                })
            })
            .collect();
        rows.sort_by(|a, b| a.guid.cmp(&b.guid));
        rows
    }

    /// Snapshot for persistence.
    #[must_use]
    pub fn to_record(&self) -> ClusterStateRecord {
        let mut members: Vec<MemberRecord> = self
            .guid_of
            .iter()
            .filter_map(|guid| {
                Some(MemberRecord {
                    guid: guid.clone(),
                    cluster_id: self.cluster_of(guid)?,
                    change_id: self.stamps.get(guid).copied().unwrap_or(0),
                    mixed: self.mixed.get(guid).copied().unwrap_or(false),
                    attached_to: self.attachment.get(guid).cloned(),
                })
            })
            .collect();
        members.sort_by(|a, b| a.guid.cmp(&b.guid));
        ClusterStateRecord {
            schema_version: SCHEMA_VERSION,
            name: self.config.name.clone(),
            change_id: self.change_id,
            next_cluster_id: self.next_cluster_id,
            members,
        }
    }

    /// Rebuild a clusterer from its persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Internal` if the record names a different
    /// algorithm.
    pub fn from_record(
        config: ClusteringConfig,
        record: &ClusterStateRecord,
    ) -> Result<Self, CoreError> {
        if record.name != config.name {
            return Err(CoreError::Internal(format!(
                "cluster record for '{}' offered to algorithm '{}'",
                record.name, config.name
            )));
        }
        let mut clusterer = Self::new(config);
        clusterer.change_id = record.change_id;
        clusterer.next_cluster_id = record.next_cluster_id;

        for member in &record.members {
            let node = clusterer.dsu.add();
            clusterer.node_of.insert(member.guid.clone(), node);
            clusterer.guid_of.push(member.guid.clone());
            clusterer.mixed.insert(member.guid.clone(), member.mixed);
            clusterer.stamps.insert(member.guid.clone(), member.change_id);
            if let Some(host) = &member.attached_to {
                clusterer.attachment.insert(member.guid.clone(), host.clone());
            }
        }

        // re-union unattached members cluster by cluster; linkage history
        // beyond membership is not needed for future merges
        let mut by_cluster: BTreeMap<ClusterId, Vec<usize>> = BTreeMap::new();
        for member in &record.members {
            if member.attached_to.is_none() {
                by_cluster
                    .entry(member.cluster_id)
                    .or_default()
                    .push(clusterer.node_of[&member.guid]);
            }
        }
        for (cluster_id, nodes) in by_cluster {
            let mut root = nodes[0];
            for &node in &nodes[1..] {
                root = clusterer.dsu.union(root, node);
            }
            clusterer.cluster_of_root.insert(clusterer.dsu.find(root), cluster_id);
        }
        Ok(clusterer)
    }

    /// Union the components of two unmixed guids, keeping the smaller
    /// cluster id.
    fn link(&mut self, g1: &Guid, g2: &Guid, changed: &mut HashSet<Guid>) {
        let n1 = self.node_of[g1];
        let n2 = self.node_of[g2];
        let r1 = self.dsu.find(n1);
        let r2 = self.dsu.find(n2);
        if r1 == r2 {
            return;
        }
        let id1 = self.cluster_of_root[&r1];
        let id2 = self.cluster_of_root[&r2];
        let (winner_id, loser_id) = if id1 <= id2 { (id1, id2) } else { (id2, id1) };

        // collect the losing side's membership (attached hangers-on
        // included) before the forest changes under it
        for guid in self.members_with_attached(loser_id) {
            changed.insert(guid);
        }

        self.cluster_of_root.remove(&r1);
        self.cluster_of_root.remove(&r2);
        let root = self.dsu.union(r1, r2);
        self.cluster_of_root.insert(root, winner_id);
        debug!(
            algorithm = %self.config.name,
            winner = %winner_id,
            retired = %loser_id,
            "clusters merged"
        );
    }

    /// Membership for a mixed guid under `exclude_mixed_from_growth`: it
    /// follows `host`'s cluster but contributes no linkage.
    fn attach(&mut self, guid: &Guid, host: &Guid, changed: &mut HashSet<Guid>) {
        self.attachment.insert(guid.clone(), host.clone());
        changed.insert(guid.clone());
    }

    fn members_with_attached(&self, cluster_id: ClusterId) -> Vec<Guid> {
        self.guid_of
            .iter()
            .filter(|guid| self.cluster_of(guid) == Some(cluster_id))
            .cloned()
            .collect()
    }

    fn advance(&mut self, changed: HashSet<Guid>) {
        self.change_id += 1;
        for guid in changed {
            self.stamps.insert(guid, self.change_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::UncertainChar;

    fn config(policy: MixturePolicy, threshold: u32) -> ClusteringConfig {
        ClusteringConfig {
            name: "test".to_string(),
            threshold,
            uncertain_char: UncertainChar::N,
            mixture_policy: policy,
        }
    }

    fn g(s: &str) -> Guid {
        Guid::new(s)
    }

    #[test]
    fn test_singleton_then_join() {
        let mut c = Clusterer::new(config(MixturePolicy::IncludeMixed, 2));
        c.insert(&g("a"), false, &[]);
        assert_eq!(c.cluster_of(&g("a")), Some(ClusterId(1)));
        assert_eq!(c.change_id(), 1);

        c.insert(&g("b"), false, &[(g("a"), 1)]);
        // b's fresh id is retired; the earlier id survives
        assert_eq!(c.cluster_of(&g("b")), Some(ClusterId(1)));
        assert_eq!(c.change_id(), 2);
        assert_eq!(c.clusters().len(), 1);
    }

    #[test]
    fn test_threshold_filters_links() {
        let mut c = Clusterer::new(config(MixturePolicy::IncludeMixed, 2));
        c.insert(&g("a"), false, &[]);
        c.insert(&g("b"), false, &[(g("a"), 3)]);
        assert_ne!(c.cluster_of(&g("a")), c.cluster_of(&g("b")));
    }

    #[test]
    fn test_merge_keeps_smaller_id_and_restamps() {
        let mut c = Clusterer::new(config(MixturePolicy::IncludeMixed, 2));
        c.insert(&g("a"), false, &[]); // cluster 1
        c.insert(&g("b"), false, &[]); // cluster 2
        assert_eq!(c.cluster_of(&g("b")), Some(ClusterId(2)));

        // bridge merges both; id 2 is retired
        c.insert(&g("bridge"), false, &[(g("a"), 1), (g("b"), 1)]);
        assert_eq!(c.cluster_of(&g("a")), Some(ClusterId(1)));
        assert_eq!(c.cluster_of(&g("b")), Some(ClusterId(1)));
        assert_eq!(c.change_id(), 3);

        // b's membership changed in the merge, so a delta query after
        // change 2 reports it
        let deltas = c.guids2clusters(Some(2));
        let guids: Vec<&str> = deltas.iter().map(|r| r.guid.as_str()).collect();
        assert!(guids.contains(&"b"));
        assert!(guids.contains(&"bridge"));
        assert!(!guids.contains(&"a") || c.stamps[&g("a")] > 2);
    }

    #[test]
    fn test_retired_id_is_never_reused() {
        let mut c = Clusterer::new(config(MixturePolicy::IncludeMixed, 2));
        c.insert(&g("a"), false, &[]); // 1
        c.insert(&g("b"), false, &[]); // 2
        c.insert(&g("bridge"), false, &[(g("a"), 1), (g("b"), 1)]); // retires 2
        c.insert(&g("c"), false, &[]);
        assert_eq!(c.cluster_of(&g("c")), Some(ClusterId(4)));
    }

    #[test]
    fn test_exclude_mixed_keeps_mixed_singleton() {
        let mut c = Clusterer::new(config(MixturePolicy::ExcludeMixed, 2));
        c.insert(&g("a"), false, &[]);
        c.insert(&g("m"), true, &[(g("a"), 0)]);
        c.insert(&g("b"), false, &[(g("a"), 1), (g("m"), 0)]);

        // a and b cluster together; m stays alone despite zero distances
        assert_eq!(c.cluster_of(&g("a")), c.cluster_of(&g("b")));
        assert_ne!(c.cluster_of(&g("m")), c.cluster_of(&g("a")));
        let summary = c.summary();
        assert_eq!(summary.len(), 2);
    }

    #[test]
    fn test_exclude_mixed_from_growth_attaches_without_bridging() {
        let mut c = Clusterer::new(config(MixturePolicy::ExcludeMixedFromGrowth, 2));
        c.insert(&g("a"), false, &[]);
        c.insert(&g("m"), true, &[(g("a"), 1)]);
        // m joins a's cluster
        assert_eq!(c.cluster_of(&g("m")), c.cluster_of(&g("a")));

        // b is near m only: m must not bridge b into a's cluster
        c.insert(&g("b"), false, &[(g("m"), 1)]);
        assert_ne!(c.cluster_of(&g("b")), c.cluster_of(&g("a")));
    }

    #[test]
    fn test_unhosted_mixed_neighbour_joins_new_cluster() {
        let mut c = Clusterer::new(config(MixturePolicy::ExcludeMixedFromGrowth, 2));
        c.insert(&g("m"), true, &[]);
        assert_eq!(c.cluster_of(&g("m")), Some(ClusterId(1)));
        c.insert(&g("a"), false, &[(g("m"), 1)]);
        // the singleton mixed sample is adopted by a's cluster
        assert_eq!(c.cluster_of(&g("m")), c.cluster_of(&g("a")));
    }

    #[test]
    fn test_apply_edge_merges_lazily() {
        let mut c = Clusterer::new(config(MixturePolicy::IncludeMixed, 2));
        c.insert(&g("a"), false, &[]);
        c.insert(&g("b"), false, &[]);
        let before = c.change_id();
        c.apply_edge(&g("a"), &g("b"), 2);
        assert_eq!(c.cluster_of(&g("a")), c.cluster_of(&g("b")));
        assert_eq!(c.change_id(), before + 1);

        // repeating the edge changes nothing
        c.apply_edge(&g("a"), &g("b"), 2);
        assert_eq!(c.change_id(), before + 1);
    }

    #[test]
    fn test_change_id_advances_once_per_insert() {
        let mut c = Clusterer::new(config(MixturePolicy::IncludeMixed, 5));
        c.insert(&g("a"), false, &[]);
        c.insert(&g("b"), false, &[]);
        c.insert(&g("c"), false, &[]);
        assert_eq!(c.change_id(), 3);
        // one insert that merges three clusters still advances by one
        c.insert(&g("hub"), false, &[(g("a"), 1), (g("b"), 1), (g("c"), 1)]);
        assert_eq!(c.change_id(), 4);
    }

    #[test]
    fn test_record_round_trip() {
        let mut c = Clusterer::new(config(MixturePolicy::ExcludeMixedFromGrowth, 2));
        c.insert(&g("a"), false, &[]);
        c.insert(&g("b"), false, &[(g("a"), 1)]);
        c.insert(&g("m"), true, &[(g("a"), 1)]);
        c.insert(&g("far"), false, &[]);

        let record = c.to_record();
        let reborn =
            Clusterer::from_record(config(MixturePolicy::ExcludeMixedFromGrowth, 2), &record)
                .unwrap();
        assert_eq!(reborn.change_id(), c.change_id());
        assert_eq!(reborn.clusters(), c.clusters());
        assert_eq!(reborn.cluster_of(&g("m")), c.cluster_of(&g("m")));

        // future allocation continues past retired ids
        assert_eq!(reborn.to_record().next_cluster_id, c.to_record().next_cluster_id);
    }

    #[test]
    fn test_members_of_unknown_cluster() {
        let c = Clusterer::new(config(MixturePolicy::IncludeMixed, 2));
        assert!(matches!(c.members_of(ClusterId(9)), Err(CoreError::NotFound(_))));
    }
}
