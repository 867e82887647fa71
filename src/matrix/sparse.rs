//! Sparse, symmetric, thresholded SNV distance matrix.
//!
//! Only pairs at or below the server ceiling are stored; everything else
//! is implicitly "far". Each stored pair is one durable record under a
//! canonical `edge/<lo>/<hi>` key, written in a single atomic batch per
//! insert so the edge set never ends up half-written. The in-RAM adjacency
//! index is derived state, rebuilt from a prefix scan after a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::errors::CoreError;
use crate::core::types::Guid;
use crate::persist::{keys, BatchOp, PersistenceError, PersistencePort, SCHEMA_VERSION};

/// Durable form of one stored pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub schema_version: u32,
    pub snv: u32,
    /// Mixture p-value of the sequence whose insert created the edge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
}

/// One neighbour of a queried guid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbour {
    pub guid: Guid,
    pub snv: u32,
}

pub struct SparseMatrix {
    snv_ceiling: u32,
    port: Arc<dyn PersistencePort>,
    adjacency: HashMap<Guid, BTreeMap<Guid, u32>>,
}

impl SparseMatrix {
    #[must_use]
    pub fn new(snv_ceiling: u32, port: Arc<dyn PersistencePort>) -> Self {
        Self { snv_ceiling, port, adjacency: HashMap::new() }
    }

    /// Rebuild the adjacency index from persisted edge records.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Persistence` if the scan fails; undecodable
    /// records are skipped with a warning rather than poisoning startup.
    pub fn rehydrate(&mut self) -> Result<(), CoreError> {
        for key in self.port.scan(keys::EDGE_PREFIX)? {
            let Some((g1, g2)) = parse_edge_key(&key) else {
                warn!(key, "skipping malformed edge key");
                continue;
            };
            let Some(bytes) = self.port.get(&key)? else { continue };
            match serde_json::from_slice::<EdgeRecord>(&bytes) {
                Ok(record) => self.index_edge(&g1, &g2, record.snv),
                Err(e) => warn!(key, error = %e, "skipping undecodable edge record"),
            }
        }
        Ok(())
    }

    /// Record every edge of a freshly inserted guid in one atomic batch,
    /// then index them.
    ///
    /// Distances above the ceiling are a caller bug: the comparer never
    /// reports them.
    ///
    /// # Errors
    ///
    /// `CoreError::Internal` on a ceiling violation; `CoreError::Persistence`
    /// if the batch fails (in which case nothing was indexed).
    pub fn add_edges(
        &mut self,
        guid: &Guid,
        neighbours: &[(Guid, u32)],
        p_value: Option<f64>,
    ) -> Result<(), CoreError> {
        let mut ops = Vec::with_capacity(neighbours.len());
        for (other, snv) in neighbours {
            if *snv > self.snv_ceiling {
                return Err(CoreError::Internal(format!(
                    "edge ({guid},{other}) at {snv} exceeds ceiling {}",
                    self.snv_ceiling
                )));
            }
            if other == guid {
                return Err(CoreError::Internal(format!("self-edge on {guid}")));
            }
            let record = EdgeRecord { schema_version: SCHEMA_VERSION, snv: *snv, p_value };
            let value = serde_json::to_vec(&record)
                .map_err(|e| CoreError::Internal(format!("cannot serialise edge record: {e}")))?;
            ops.push(BatchOp::Put { key: keys::edge(guid, other), value });
        }
        self.batch_with_retry(ops)?;
        for (other, snv) in neighbours {
            self.index_edge(guid, other, *snv);
        }
        Ok(())
    }

    /// Drop every edge incident on `guid`, durably and in RAM. Used to
    /// roll back a failed insert.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Persistence` if the deletions cannot be applied.
    pub fn remove(&mut self, guid: &Guid) -> Result<(), CoreError> {
        let Some(partners) = self.adjacency.remove(guid) else { return Ok(()) };
        let ops = partners
            .keys()
            .map(|other| BatchOp::Delete { key: keys::edge(guid, other) })
            .collect();
        for other in partners.keys() {
            if let Some(back) = self.adjacency.get_mut(other) {
                back.remove(guid);
            }
        }
        self.batch_with_retry(ops)?;
        Ok(())
    }

    /// Neighbours of `guid` with `snv <= threshold`, ascending by distance
    /// then guid.
    #[must_use]
    pub fn neighbours_of(&self, guid: &Guid, threshold: u32) -> Vec<Neighbour> {
        let mut result: Vec<Neighbour> = self
            .adjacency
            .get(guid)
            .map(|partners| {
                partners
                    .iter()
                    .filter(|(_, &snv)| snv <= threshold)
                    .map(|(g, &snv)| Neighbour { guid: g.clone(), snv })
                    .collect()
            })
            .unwrap_or_default();
        result.sort_by(|a, b| a.snv.cmp(&b.snv).then_with(|| a.guid.cmp(&b.guid)));
        result
    }

    /// The stored distance between two guids, if the pair is within the
    /// ceiling.
    #[must_use]
    pub fn distance_between(&self, g1: &Guid, g2: &Guid) -> Option<u32> {
        self.adjacency.get(g1).and_then(|partners| partners.get(g2).copied())
    }

    /// Number of stored pairs.
    #[must_use]
    pub fn n_edges(&self) -> usize {
        self.adjacency.values().map(BTreeMap::len).sum::<usize>() / 2
    }

    #[must_use]
    pub fn snv_ceiling(&self) -> u32 {
        self.snv_ceiling
    }

    /// Drop all edges, durably and in RAM.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Persistence` if the port cannot be cleared.
    pub fn reset(&mut self) -> Result<(), CoreError> {
        let ops = self
            .port
            .scan(keys::EDGE_PREFIX)?
            .into_iter()
            .map(|key| BatchOp::Delete { key })
            .collect();
        self.port.atomic_batch(ops)?;
        self.adjacency.clear();
        Ok(())
    }

    fn index_edge(&mut self, g1: &Guid, g2: &Guid, snv: u32) {
        self.adjacency.entry(g1.clone()).or_default().insert(g2.clone(), snv);
        self.adjacency.entry(g2.clone()).or_default().insert(g1.clone(), snv);
    }

    fn batch_with_retry(&self, ops: Vec<BatchOp>) -> Result<(), PersistenceError> {
        match self.port.atomic_batch(ops.clone()) {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "transient persistence failure, retrying edge batch");
                self.port.atomic_batch(ops)
            }
            other => other,
        }
    }
}

/// Split `edge/<lo>/<hi>` back into its guids. Guid validation forbids `/`,
/// so the split is unambiguous.
fn parse_edge_key(key: &str) -> Option<(Guid, Guid)> {
    let rest = key.strip_prefix(keys::EDGE_PREFIX)?;
    let (lo, hi) = rest.split_once('/')?;
    if lo.is_empty() || hi.is_empty() || hi.contains('/') {
        return None;
    }
    Some((Guid::new(lo), Guid::new(hi)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;

    fn matrix(ceiling: u32) -> SparseMatrix {
        SparseMatrix::new(ceiling, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_add_and_query_edges() {
        let mut m = matrix(3);
        m.add_edges(&Guid::new("g2"), &[(Guid::new("g1"), 1)], None).unwrap();
        m.add_edges(&Guid::new("g3"), &[(Guid::new("g1"), 2), (Guid::new("g2"), 1)], None)
            .unwrap();

        let n = m.neighbours_of(&Guid::new("g1"), 3);
        assert_eq!(n.len(), 2);
        assert_eq!(n[0].guid, Guid::new("g2")); // snv 1 before snv 2
        assert_eq!(n[1].guid, Guid::new("g3"));

        // symmetric
        assert_eq!(m.distance_between(&Guid::new("g1"), &Guid::new("g3")), Some(2));
        assert_eq!(m.distance_between(&Guid::new("g3"), &Guid::new("g1")), Some(2));
        assert_eq!(m.n_edges(), 3);
    }

    #[test]
    fn test_threshold_filters_neighbours() {
        let mut m = matrix(5);
        m.add_edges(&Guid::new("g2"), &[(Guid::new("g1"), 4)], None).unwrap();
        assert!(m.neighbours_of(&Guid::new("g1"), 3).is_empty());
        assert_eq!(m.neighbours_of(&Guid::new("g1"), 4).len(), 1);
    }

    #[test]
    fn test_tie_break_is_lexicographic() {
        let mut m = matrix(3);
        m.add_edges(&Guid::new("x"), &[(Guid::new("b"), 1), (Guid::new("a"), 1)], None).unwrap();
        let n = m.neighbours_of(&Guid::new("x"), 3);
        assert_eq!(n[0].guid, Guid::new("a"));
        assert_eq!(n[1].guid, Guid::new("b"));
    }

    #[test]
    fn test_edge_above_ceiling_rejected() {
        let mut m = matrix(3);
        let err = m.add_edges(&Guid::new("g2"), &[(Guid::new("g1"), 4)], None);
        assert!(matches!(err, Err(CoreError::Internal(_))));
        assert_eq!(m.n_edges(), 0);
    }

    #[test]
    fn test_remove_drops_both_directions() {
        let mut m = matrix(3);
        m.add_edges(&Guid::new("g2"), &[(Guid::new("g1"), 1)], None).unwrap();
        m.remove(&Guid::new("g2")).unwrap();
        assert!(m.neighbours_of(&Guid::new("g1"), 3).is_empty());
        assert!(m.neighbours_of(&Guid::new("g2"), 3).is_empty());
        assert_eq!(m.n_edges(), 0);
    }

    #[test]
    fn test_rehydrate_from_port() {
        let port: Arc<dyn PersistencePort> = Arc::new(MemoryStore::new());
        {
            let mut m = SparseMatrix::new(3, port.clone());
            m.add_edges(&Guid::new("g2"), &[(Guid::new("g1"), 2)], Some(0.5)).unwrap();
        }
        let mut reborn = SparseMatrix::new(3, port);
        reborn.rehydrate().unwrap();
        assert_eq!(reborn.distance_between(&Guid::new("g1"), &Guid::new("g2")), Some(2));
    }

    #[test]
    fn test_parse_edge_key() {
        assert_eq!(
            parse_edge_key("edge/a/b"),
            Some((Guid::new("a"), Guid::new("b")))
        );
        assert_eq!(parse_edge_key("edge/a"), None);
        assert_eq!(parse_edge_key("seq/a"), None);
    }
}
