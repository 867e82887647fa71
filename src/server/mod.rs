//! The assembled engine.
//!
//! `SnvServer` wires mask, codec, store, comparer, matrix and clusterers
//! into the method surface the REST adapter exposes. All components are
//! explicit values owned here; there is no global state.
//!
//! Concurrency follows a single-writer model: mutating operations
//! (`insert`, `reset`) take the write side of one `RwLock`, queries take
//! the read side and run concurrently. Within one insert the ordering is
//! fixed: persist the sequence, compare against every stored sequence,
//! record the surviving edges in one atomic batch, update every clusterer,
//! advance change-ids. A reader that observes the new guid therefore also
//! observes its edges and memberships.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::cluster::{ClusterStateRecord, ClusterSummary, Clusterer, GuidClusterEntry};
use crate::compare::mixture::{assess_mixture, MixtureVerdict};
use crate::compare::{Comparer, MsaBuilder, MsaResult, PairDetail};
use crate::core::config::ServerConfig;
use crate::core::errors::CoreError;
use crate::core::types::{ClusterId, Guid, NeighbourFormat, UncertainChar};
use crate::matrix::SparseMatrix;
use crate::persist::{keys, PersistencePort};
use crate::seq::store::StoreSummary;
use crate::seq::{CompressedStore, MaskSet, ReferenceCodec};
use crate::utils::validation::validate_guid;

/// Prefix queries return at most this many guids; larger match sets come
/// back empty so a client cannot accidentally page the whole store.
pub const PREFIX_MATCH_LIMIT: usize = 30;

/// Resource samples retained for the monitoring surface.
const MONITOR_CAPACITY: usize = 1_000;

/// Insert request as the REST layer delivers it.
#[derive(Debug, Clone, Deserialize)]
pub struct InsertPayload {
    pub guid: String,
    pub seq: String,
    #[serde(default)]
    pub meta: Option<Value>,
}

/// Result of a successful insert call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted(InsertReport),
    /// The guid was already stored; nothing changed
    AlreadyPresent,
}

#[derive(Debug, Clone, Serialize)]
pub struct InsertReport {
    pub guid: Guid,
    pub quality: f64,
    /// Stored but excluded from edges and clusters
    pub invalid: bool,
    pub n_neighbours: usize,
    /// Mixture verdict per clustering algorithm
    pub mixture: BTreeMap<String, MixtureVerdict>,
    /// Change-id per clustering algorithm after this insert
    pub change_ids: BTreeMap<String, u64>,
}

/// One store-level resource sample, recorded per insert.
///
/// Process-wide memory accounting belongs to the external sampler; these
/// are the engine's own counts, which is what capacity planning against
/// the working set actually needs.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSample {
    pub at: DateTime<Utc>,
    pub note: String,
    pub n_sequences: usize,
    pub n_invalid: usize,
    pub n_double_delta: usize,
    pub working_set: usize,
    pub n_edges: usize,
}

/// Members of one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterContents {
    pub cluster_id: ClusterId,
    pub members: Vec<Guid>,
}

struct Engine {
    config: ServerConfig,
    codec: Arc<ReferenceCodec>,
    comparer: Comparer,
    store: CompressedStore,
    matrix: SparseMatrix,
    clusterers: Vec<Clusterer>,
    port: Arc<dyn PersistencePort>,
    monitor: VecDeque<ResourceSample>,
    rng: StdRng,
    started_at: DateTime<Utc>,
}

pub struct SnvServer {
    engine: RwLock<Engine>,
}

impl SnvServer {
    /// Assemble the engine and rebuild all derived state from the port.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` for an invalid configuration, reference
    /// or mask, and `CoreError::Persistence` if stored state cannot be
    /// read back.
    pub fn open(
        config: ServerConfig,
        reference: &str,
        mask: MaskSet,
        port: Arc<dyn PersistencePort>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let codec = Arc::new(ReferenceCodec::new(reference, mask)?);
        let comparer = Comparer::new(config.snv_ceiling);

        let mut store =
            CompressedStore::new(codec.clone(), port.clone(), config.working_set_capacity);
        store.rehydrate()?;

        let mut matrix = SparseMatrix::new(config.snv_ceiling, port.clone());
        matrix.rehydrate()?;

        let mut clusterers = Vec::with_capacity(config.clustering.len());
        for clustering in &config.clustering {
            let clusterer = match port.get(&keys::cluster(&clustering.name))? {
                Some(bytes) => match serde_json::from_slice::<ClusterStateRecord>(&bytes) {
                    Ok(record) => Clusterer::from_record(clustering.clone(), &record)?,
                    Err(e) => {
                        warn!(
                            algorithm = %clustering.name,
                            error = %e,
                            "undecodable cluster record, rebuilding from edges"
                        );
                        Clusterer::new(clustering.clone())
                    }
                },
                None => Clusterer::new(clustering.clone()),
            };
            clusterers.push(clusterer);
        }

        let mut engine = Engine {
            config,
            codec,
            comparer,
            store,
            matrix,
            clusterers,
            port,
            monitor: VecDeque::new(),
            rng: StdRng::from_entropy(),
            started_at: Utc::now(),
        };
        engine.catch_up_clusterers()?;

        info!(
            n_sequences = engine.store.store_summary().n_sequences,
            n_edges = engine.matrix.n_edges(),
            "engine assembled"
        );
        Ok(Self { engine: RwLock::new(engine) })
    }

    // ------------------------------------------------------------------
    // mutating surface (single writer)
    // ------------------------------------------------------------------

    /// Insert one consensus sequence and update all derived state.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a malformed guid or sequence (nothing is
    /// mutated); `Persistence` when durable writes fail after retry, in
    /// which case any partial edges of this guid have been removed and the
    /// insert can be retried.
    pub fn insert(&self, payload: InsertPayload) -> Result<InsertOutcome, CoreError> {
        self.write()?.insert(payload)
    }

    /// Drop all sequences, edges and clusters. Debug mode only.
    ///
    /// # Errors
    ///
    /// `InvalidInput` outside debug mode; `Persistence` if the port cannot
    /// be cleared.
    pub fn reset(&self) -> Result<(), CoreError> {
        self.write()?.reset()
    }

    // ------------------------------------------------------------------
    // read surface (concurrent)
    // ------------------------------------------------------------------

    #[must_use]
    pub fn exists(&self, guid: &Guid) -> bool {
        self.read().map(|e| e.store.exists(guid)).unwrap_or(false)
    }

    /// Quality, validity, insert time, mixture verdicts and caller
    /// metadata for one guid.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown guid.
    pub fn annotation(&self, guid: &Guid) -> Result<Value, CoreError> {
        self.read()?.annotation(guid)
    }

    /// Annotations for every stored guid.
    ///
    /// # Errors
    ///
    /// Propagates engine access failures.
    pub fn annotations(&self) -> Result<Value, CoreError> {
        let engine = self.read()?;
        let mut all = serde_json::Map::new();
        for guid in engine.store.all_guids() {
            all.insert(guid.to_string(), engine.annotation(&guid)?);
        }
        Ok(Value::Object(all))
    }

    /// Neighbours of `guid` within `threshold`, partner quality at least
    /// `quality_cutoff`, shaped per `format`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown guid.
    pub fn neighbours_within(
        &self,
        guid: &Guid,
        threshold: u32,
        quality_cutoff: f64,
        format: NeighbourFormat,
    ) -> Result<Vec<Value>, CoreError> {
        self.read()?.neighbours_within(guid, threshold, quality_cutoff, format)
    }

    /// The reconstructed masked sequence.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown guid; `QualityTooLow` for an invalid one.
    pub fn sequence(&self, guid: &Guid) -> Result<String, CoreError> {
        self.read()?.store.sequence(guid)
    }

    /// All stored guids, ascending.
    ///
    /// # Errors
    ///
    /// Propagates engine access failures.
    pub fn guids(&self) -> Result<Vec<Guid>, CoreError> {
        Ok(self.read()?.store.all_guids())
    }

    /// Guids starting with `prefix`; empty when more than
    /// [`PREFIX_MATCH_LIMIT`] match.
    ///
    /// # Errors
    ///
    /// Propagates engine access failures.
    pub fn guids_beginning_with(&self, prefix: &str) -> Result<Vec<Guid>, CoreError> {
        Ok(self.read()?.store.guids_beginning_with(prefix, PREFIX_MATCH_LIMIT))
    }

    /// Guids whose quality is at least `cutoff`.
    ///
    /// # Errors
    ///
    /// Propagates engine access failures.
    pub fn guids_with_quality_over(&self, cutoff: f64) -> Result<Vec<Guid>, CoreError> {
        Ok(self.read()?.store.guids_with_quality_over(cutoff))
    }

    /// Insert timestamp per guid.
    ///
    /// # Errors
    ///
    /// Propagates engine access failures.
    pub fn guids_and_examination_times(
        &self,
    ) -> Result<BTreeMap<Guid, DateTime<Utc>>, CoreError> {
        Ok(self.read()?.store.examination_times())
    }

    /// Every cluster of one algorithm with its members.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown algorithm.
    pub fn clusters(&self, algorithm: &str) -> Result<Vec<ClusterContents>, CoreError> {
        let engine = self.read()?;
        let clusterer = engine.clusterer(algorithm)?;
        Ok(clusterer
            .clusters()
            .into_iter()
            .map(|(cluster_id, members)| ClusterContents {
                cluster_id,
                members: members.into_iter().collect(),
            })
            .collect())
    }

    /// Mixed/unmixed member counts per cluster.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown algorithm.
    pub fn cluster_summary(&self, algorithm: &str) -> Result<Vec<ClusterSummary>, CoreError> {
        Ok(self.read()?.clusterer(algorithm)?.summary())
    }

    /// Guid-to-cluster rows, optionally restricted to changes after
    /// `after_change_id`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown algorithm.
    pub fn guids2clusters(
        &self,
        algorithm: &str,
        after_change_id: Option<u64>,
    ) -> Result<Vec<GuidClusterEntry>, CoreError> {
        Ok(self.read()?.clusterer(algorithm)?.guids2clusters(after_change_id))
    }

    /// Live cluster ids of one algorithm.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown algorithm.
    pub fn cluster_ids(&self, algorithm: &str) -> Result<Vec<ClusterId>, CoreError> {
        Ok(self.read()?.clusterer(algorithm)?.cluster_ids())
    }

    /// Current change-id of one algorithm.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown algorithm.
    pub fn change_id(&self, algorithm: &str) -> Result<u64, CoreError> {
        Ok(self.read()?.clusterer(algorithm)?.change_id())
    }

    /// Nodes and edges of one cluster, for visualisation.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown algorithm or cluster id.
    pub fn network(&self, algorithm: &str, cluster_id: ClusterId) -> Result<Value, CoreError> {
        self.read()?.network(algorithm, cluster_id)
    }

    /// On-the-fly comparison of one pair: distance plus no-call overlap.
    ///
    /// Unlike `neighbours_within` this does not consult the matrix, so it
    /// also answers for pairs above the ceiling (as a `None` distance).
    ///
    /// # Errors
    ///
    /// `NotFound` if either guid is unknown.
    pub fn pair_detail(&self, g1: &Guid, g2: &Guid) -> Result<PairDetail, CoreError> {
        let engine = self.read()?;
        let x = engine.store.get(g1)?;
        let y = engine.store.get(g2)?;
        Ok(engine.comparer.pair_detail(&x, &y))
    }

    /// Multiple sequence alignment over `guids` at their informative
    /// positions. `uncertain_char` selects the class counted by the row
    /// statistics; the default counts no-calls only.
    ///
    /// # Errors
    ///
    /// `NotFound` if any guid is unknown.
    pub fn multiple_alignment(
        &self,
        guids: &[Guid],
        uncertain_char: Option<UncertainChar>,
    ) -> Result<MsaResult, CoreError> {
        let engine = self.read()?;
        let builder = MsaBuilder::new(
            engine.codec.clone(),
            uncertain_char.unwrap_or(UncertainChar::N),
        );
        let mut rng = StdRng::from_entropy();
        builder.build(&engine.store, guids, &mut rng)
    }

    /// Recent store-level resource samples, most recent first.
    ///
    /// # Errors
    ///
    /// Propagates engine access failures.
    pub fn server_memory_usage(&self, nrows: Option<usize>) -> Result<Vec<ResourceSample>, CoreError> {
        let engine = self.read()?;
        let nrows = nrows.unwrap_or(100);
        Ok(engine.monitor.iter().rev().take(nrows).cloned().collect())
    }

    /// Store composition counts.
    ///
    /// # Errors
    ///
    /// Propagates engine access failures.
    pub fn store_summary(&self) -> Result<StoreSummary, CoreError> {
        Ok(self.read()?.store.store_summary())
    }

    /// The configured SNV ceiling.
    ///
    /// # Errors
    ///
    /// Propagates engine access failures.
    pub fn snp_ceiling(&self) -> Result<u32, CoreError> {
        Ok(self.read()?.config.snv_ceiling)
    }

    /// The masked positions and their fingerprint.
    ///
    /// # Errors
    ///
    /// Propagates engine access failures.
    pub fn nucleotides_excluded(&self) -> Result<Value, CoreError> {
        let engine = self.read()?;
        let mask = engine.codec.mask();
        Ok(json!({
            "exclusion_id": mask.fingerprint(),
            "excluded_nt": mask.positions(),
        }))
    }

    /// Identity fields the REST layer echoes.
    ///
    /// # Errors
    ///
    /// Propagates engine access failures.
    pub fn server_info(&self) -> Result<Value, CoreError> {
        let engine = self.read()?;
        Ok(json!({
            "server_name": engine.config.server_name,
            "description": engine.config.description,
            "started_at": engine.started_at,
        }))
    }

    /// Names of the configured clustering algorithms.
    ///
    /// # Errors
    ///
    /// Propagates engine access failures.
    pub fn clustering_algorithms(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.read()?.clusterers.iter().map(|c| c.name().to_string()).collect())
    }

    /// The full configuration; only revealed in debug mode.
    ///
    /// # Errors
    ///
    /// Propagates engine access failures.
    pub fn server_config(&self) -> Result<Option<ServerConfig>, CoreError> {
        let engine = self.read()?;
        Ok(engine.config.debug_mode.then(|| engine.config.clone()))
    }

    /// Deliberately fail, exercising the error path end to end. Debug
    /// mode only.
    ///
    /// # Errors
    ///
    /// Always: `Internal` carrying `token` in debug mode, `InvalidInput`
    /// otherwise.
    pub fn raise_error(&self, token: &str) -> Result<(), CoreError> {
        if self.read()?.config.debug_mode {
            Err(CoreError::Internal(token.to_string()))
        } else {
            Err(CoreError::InvalidInput(
                "raise_error is only available in debug mode".to_string(),
            ))
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Engine>, CoreError> {
        self.engine
            .read()
            .map_err(|_| CoreError::Internal("engine lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Engine>, CoreError> {
        self.engine
            .write()
            .map_err(|_| CoreError::Internal("engine lock poisoned".to_string()))
    }
}

impl Engine {
    fn insert(&mut self, payload: InsertPayload) -> Result<InsertOutcome, CoreError> {
        validate_guid(&payload.guid)?;
        let guid = Guid::new(payload.guid);
        if self.store.exists(&guid) {
            info!(%guid, "insert ignored, already present");
            return Ok(InsertOutcome::AlreadyPresent);
        }

        let annotation = json!({
            "meta": payload.meta.clone().unwrap_or(Value::Null),
            "mixture": {},
        });
        let compressed =
            self.store.insert(&guid, &payload.seq, Some(annotation), self.config.max_n_percent)?;

        if compressed.invalid {
            info!(%guid, quality = compressed.quality, "sequence invalid, no edges computed");
            self.record_sample(format!("inserted {guid} (invalid)"));
            return Ok(InsertOutcome::Inserted(InsertReport {
                guid,
                quality: compressed.quality,
                invalid: true,
                n_neighbours: 0,
                mixture: BTreeMap::new(),
                change_ids: self.change_ids(),
            }));
        }

        // compare against every valid stored sequence
        let mut neighbours: Vec<(Guid, u32)> = Vec::new();
        for other in self.store.valid_guids() {
            if other == guid {
                continue;
            }
            let other_seq = match self.fetch_for_comparison(&other) {
                Ok(Some(seq)) => seq,
                Ok(None) => continue, // transient failure, pair skipped
                Err(e) => {
                    self.abort_insert(&guid);
                    return Err(e);
                }
            };
            if let Some(snv) = self.comparer.distance(&compressed, &other_seq) {
                neighbours.push((other, snv));
            }
        }

        // mixture verdicts, one per uncertain-character class in use
        let mut verdict_by_class: BTreeMap<String, MixtureVerdict> = BTreeMap::new();
        let mut mixture: BTreeMap<String, MixtureVerdict> = BTreeMap::new();
        let mut classes: Vec<UncertainChar> =
            self.clusterers.iter().map(|c| c.config().uncertain_char).collect();
        classes.push(UncertainChar::NOrM); // canonical class for the edge records
        for class in classes {
            let key = class.to_string();
            if verdict_by_class.contains_key(&key) {
                continue;
            }
            let builder = MsaBuilder::new(self.codec.clone(), class);
            let verdict = match assess_mixture(
                &self.store,
                &builder,
                &guid,
                &neighbours,
                self.config.mixture_alpha,
                &mut self.rng,
            ) {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(%guid, error = %e, "mixture assessment failed, treating as inconclusive");
                    MixtureVerdict::inconclusive()
                }
            };
            verdict_by_class.insert(key, verdict);
        }
        for clusterer in &self.clusterers {
            let class = clusterer.config().uncertain_char.to_string();
            mixture.insert(clusterer.name().to_string(), verdict_by_class[&class]);
        }
        let edge_p_value = verdict_by_class[&UncertainChar::NOrM.to_string()].p_value;

        // one atomic batch records every surviving edge
        if let Err(e) = self.matrix.add_edges(&guid, &neighbours, edge_p_value) {
            self.abort_insert(&guid);
            return Err(e);
        }

        // memberships and change-ids
        for clusterer in &mut self.clusterers {
            let mixed =
                mixture.get(clusterer.name()).map(|verdict| verdict.mixed).unwrap_or(false);
            clusterer.insert(&guid, mixed, &neighbours);
        }
        self.persist_clusterers();

        // enrich the annotation with the verdicts
        let annotation = json!({
            "meta": payload.meta.unwrap_or(Value::Null),
            "mixture": mixture,
        });
        if let Err(e) = self.store.set_annotation(&guid, annotation) {
            warn!(%guid, error = %e, "could not persist enriched annotation");
        }

        info!(%guid, n_neighbours = neighbours.len(), "inserted");
        self.record_sample(format!("inserted {guid}"));
        Ok(InsertOutcome::Inserted(InsertReport {
            guid,
            quality: compressed.quality,
            invalid: false,
            n_neighbours: neighbours.len(),
            mixture,
            change_ids: self.change_ids(),
        }))
    }

    /// Load a comparison partner, retrying one transient failure, skipping
    /// the pair on a second. Anything non-transient aborts the insert.
    fn fetch_for_comparison(
        &self,
        guid: &Guid,
    ) -> Result<Option<Arc<crate::seq::CompressedSequence>>, CoreError> {
        match self.store.get(guid) {
            Ok(seq) => Ok(Some(seq)),
            Err(CoreError::Persistence(e)) if e.is_transient() => match self.store.get(guid) {
                Ok(seq) => Ok(Some(seq)),
                Err(CoreError::Persistence(e2)) if e2.is_transient() => {
                    warn!(%guid, error = %e2, "skipping pair after transient failures");
                    Ok(None)
                }
                Err(other) => Err(other),
            },
            Err(other) => Err(other),
        }
    }

    /// Best-effort rollback of this guid's edges after a failed insert.
    /// The sequence record itself stays; a retried insert is a no-op.
    fn abort_insert(&mut self, guid: &Guid) {
        warn!(%guid, "insert aborted, removing partial edges");
        if let Err(e) = self.matrix.remove(guid) {
            warn!(%guid, error = %e, "could not remove partial edges");
        }
    }

    fn reset(&mut self) -> Result<(), CoreError> {
        if !self.config.debug_mode {
            return Err(CoreError::InvalidInput(
                "reset is only available in debug mode".to_string(),
            ));
        }
        self.store.reset()?;
        self.matrix.reset()?;
        for clustering in &self.config.clustering {
            self.port.delete(&keys::cluster(&clustering.name))?;
        }
        self.clusterers =
            self.config.clustering.iter().map(|c| Clusterer::new(c.clone())).collect();
        self.monitor.clear();
        info!("store reset");
        Ok(())
    }

    fn annotation(&self, guid: &Guid) -> Result<Value, CoreError> {
        let summary = self
            .store
            .summary_of(guid)
            .ok_or_else(|| CoreError::NotFound(format!("no sequence with guid {guid}")))?;
        let stored = self.store.annotation(guid).cloned().unwrap_or(Value::Null);
        Ok(json!({
            "guid": guid,
            "quality": summary.quality,
            "invalid": summary.invalid,
            "inserted_at": summary.inserted_at,
            "meta": stored.get("meta").cloned().unwrap_or(Value::Null),
            "mixture": stored.get("mixture").cloned().unwrap_or(json!({})),
        }))
    }

    fn neighbours_within(
        &self,
        guid: &Guid,
        threshold: u32,
        quality_cutoff: f64,
        format: NeighbourFormat,
    ) -> Result<Vec<Value>, CoreError> {
        let summary = self
            .store
            .summary_of(guid)
            .ok_or_else(|| CoreError::NotFound(format!("no sequence with guid {guid}")))?;
        // a low-quality query sequence reports no neighbours rather than
        // unreliable ones
        if summary.invalid || summary.quality < quality_cutoff {
            return Ok(Vec::new());
        }

        let mut rows = Vec::new();
        for neighbour in self.matrix.neighbours_of(guid, threshold) {
            let Some(partner_quality) = self.store.quality(&neighbour.guid) else { continue };
            if partner_quality < quality_cutoff {
                continue;
            }
            rows.push(match format {
                NeighbourFormat::IdOnly => json!(neighbour.guid),
                NeighbourFormat::IdDistance => json!([neighbour.guid, neighbour.snv]),
                NeighbourFormat::IdDistanceQuality => {
                    json!([neighbour.guid, neighbour.snv, partner_quality])
                }
                NeighbourFormat::IdDistanceQualityMeta => {
                    let meta = self
                        .store
                        .annotation(&neighbour.guid)
                        .and_then(|a| a.get("meta").cloned())
                        .unwrap_or(Value::Null);
                    json!([neighbour.guid, neighbour.snv, partner_quality, meta])
                }
            });
        }
        Ok(rows)
    }

    fn network(&self, algorithm: &str, cluster_id: ClusterId) -> Result<Value, CoreError> {
        let clusterer = self.clusterer(algorithm)?;
        let members = clusterer.members_of(cluster_id)?;
        let member_set: std::collections::HashSet<&Guid> = members.iter().collect();

        let nodes: Vec<Value> = members
            .iter()
            .map(|guid| {
                json!({
                    "guid": guid,
                    "mixed": clusterer.is_mixed(guid).unwrap_or(false),
                    "quality": self.store.quality(guid),
                })
            })
            .collect();

        let mut edges = Vec::new();
        for guid in &members {
            for neighbour in self.matrix.neighbours_of(guid, clusterer.config().threshold) {
                // each unordered pair once
                if *guid < neighbour.guid && member_set.contains(&neighbour.guid) {
                    edges.push(json!({
                        "source": guid,
                        "target": neighbour.guid,
                        "snv": neighbour.snv,
                    }));
                }
            }
        }
        Ok(json!({ "cluster_id": cluster_id, "nodes": nodes, "edges": edges }))
    }

    fn clusterer(&self, algorithm: &str) -> Result<&Clusterer, CoreError> {
        self.clusterers.iter().find(|c| c.name() == algorithm).ok_or_else(|| {
            CoreError::NotFound(format!("no clustering algorithm named '{algorithm}'"))
        })
    }

    fn change_ids(&self) -> BTreeMap<String, u64> {
        self.clusterers.iter().map(|c| (c.name().to_string(), c.change_id())).collect()
    }

    /// Write every clusterer snapshot through the port. A failure here is
    /// logged rather than fatal: the snapshots are derived state and the
    /// catch-up pass rebuilds them at the next startup.
    fn persist_clusterers(&self) {
        for clusterer in &self.clusterers {
            let record = clusterer.to_record();
            match serde_json::to_vec(&record) {
                Ok(bytes) => {
                    if let Err(e) = self.port.put(&keys::cluster(clusterer.name()), &bytes) {
                        warn!(algorithm = clusterer.name(), error = %e, "cluster snapshot not persisted");
                    }
                }
                Err(e) => {
                    warn!(algorithm = clusterer.name(), error = %e, "cluster snapshot not serialisable");
                }
            }
        }
    }

    /// Bring clusterers up to date with sequences whose memberships were
    /// never persisted (e.g. a crash between edge write and snapshot).
    fn catch_up_clusterers(&mut self) -> Result<(), CoreError> {
        // replay in insert order so merges resolve the same way they
        // originally would have
        let mut pending: Vec<(DateTime<Utc>, Guid)> = Vec::new();
        for guid in self.store.valid_guids() {
            if self.clusterers.iter().all(|c| c.contains(&guid)) {
                continue;
            }
            let Some(summary) = self.store.summary_of(&guid) else { continue };
            pending.push((summary.inserted_at, guid));
        }
        pending.sort();

        let mut replayed = 0usize;
        for (_, guid) in pending {
            let neighbours: Vec<(Guid, u32)> = self
                .matrix
                .neighbours_of(&guid, self.config.snv_ceiling)
                .into_iter()
                .map(|n| (n.guid, n.snv))
                .collect();
            for clusterer in &mut self.clusterers {
                if clusterer.contains(&guid) {
                    continue;
                }
                let mixed = self
                    .store
                    .annotation(&guid)
                    .and_then(|a| a.get("mixture"))
                    .and_then(|m| m.get(clusterer.name()))
                    .and_then(|v| v.get("mixed"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                clusterer.insert(&guid, mixed, &neighbours);
            }
            replayed += 1;
        }
        if replayed > 0 {
            info!(replayed, "clusterers caught up from persisted edges");
            self.persist_clusterers();
        }
        Ok(())
    }

    fn record_sample(&mut self, note: String) {
        let store = self.store.store_summary();
        self.monitor.push_back(ResourceSample {
            at: Utc::now(),
            note,
            n_sequences: store.n_sequences,
            n_invalid: store.n_invalid,
            n_double_delta: store.n_double_delta,
            working_set: store.working_set,
            n_edges: self.matrix.n_edges(),
        });
        while self.monitor.len() > MONITOR_CAPACITY {
            self.monitor.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ClusteringConfig;
    use crate::core::types::MixturePolicy;
    use crate::persist::MemoryStore;

    fn test_config(ceiling: u32) -> ServerConfig {
        ServerConfig {
            snv_ceiling: ceiling,
            max_n_percent: 0.85,
            clustering: vec![ClusteringConfig {
                name: "snv1".to_string(),
                threshold: 1,
                uncertain_char: UncertainChar::N,
                mixture_policy: MixturePolicy::IncludeMixed,
            }],
            mixture_alpha: 0.001,
            working_set_capacity: 100,
            debug_mode: true,
            server_name: "test".to_string(),
            description: String::new(),
        }
    }

    fn server() -> SnvServer {
        SnvServer::open(
            test_config(3),
            "AAAAAAAAAA",
            MaskSet::empty(10),
            Arc::new(MemoryStore::new()),
        )
        .unwrap()
    }

    fn insert(server: &SnvServer, guid: &str, seq: &str) -> InsertOutcome {
        server
            .insert(InsertPayload { guid: guid.to_string(), seq: seq.to_string(), meta: None })
            .unwrap()
    }

    #[test]
    fn test_insert_and_duplicate() {
        let server = server();
        let outcome = insert(&server, "g1", "AAAAAAAAAA");
        assert!(matches!(outcome, InsertOutcome::Inserted(_)));
        let outcome = insert(&server, "g1", "AAAAAAAAAA");
        assert!(matches!(outcome, InsertOutcome::AlreadyPresent));
    }

    #[test]
    fn test_bad_guid_rejected() {
        let server = server();
        let err = server.insert(InsertPayload {
            guid: "a/b".to_string(),
            seq: "AAAAAAAAAA".to_string(),
            meta: None,
        });
        assert!(matches!(err, Err(CoreError::InvalidInput(_))));
        assert!(server.guids().unwrap().is_empty());
    }

    #[test]
    fn test_neighbour_formats() {
        let server = server();
        insert(&server, "g1", "AAAAAAAAAA");
        server
            .insert(InsertPayload {
                guid: "g2".to_string(),
                seq: "AAAACAAAAA".to_string(),
                meta: Some(json!({"lab": "x"})),
            })
            .unwrap();

        let rows = server
            .neighbours_within(&Guid::new("g1"), 3, 0.0, NeighbourFormat::IdOnly)
            .unwrap();
        assert_eq!(rows, vec![json!("g2")]);

        let rows = server
            .neighbours_within(&Guid::new("g1"), 3, 0.0, NeighbourFormat::IdDistance)
            .unwrap();
        assert_eq!(rows, vec![json!(["g2", 1])]);

        let rows = server
            .neighbours_within(&Guid::new("g1"), 3, 0.0, NeighbourFormat::IdDistanceQualityMeta)
            .unwrap();
        assert_eq!(rows, vec![json!(["g2", 1, 1.0, {"lab": "x"}])]);
    }

    #[test]
    fn test_annotation_carries_meta() {
        let server = server();
        server
            .insert(InsertPayload {
                guid: "g1".to_string(),
                seq: "AAAAAAAAAA".to_string(),
                meta: Some(json!({"patient": 12})),
            })
            .unwrap();
        let annotation = server.annotation(&Guid::new("g1")).unwrap();
        assert_eq!(annotation["meta"]["patient"], 12);
        assert_eq!(annotation["quality"], 1.0);
        assert_eq!(annotation["invalid"], false);
    }

    #[test]
    fn test_reset_requires_debug_mode() {
        let mut config = test_config(3);
        config.debug_mode = false;
        let server = SnvServer::open(
            config,
            "AAAAAAAAAA",
            MaskSet::empty(10),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        assert!(matches!(server.reset(), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_reset_clears_everything() {
        let server = server();
        insert(&server, "g1", "AAAAAAAAAA");
        insert(&server, "g2", "AAAACAAAAA");
        server.reset().unwrap();
        assert!(server.guids().unwrap().is_empty());
        assert_eq!(server.cluster_ids("snv1").unwrap().len(), 0);
    }

    #[test]
    fn test_raise_error() {
        let server = server();
        let err = server.raise_error("token-123").unwrap_err();
        match err {
            CoreError::Internal(msg) => assert_eq!(msg, "token-123"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_restart_preserves_state() {
        let port: Arc<dyn PersistencePort> = Arc::new(MemoryStore::new());
        {
            let server = SnvServer::open(
                test_config(3),
                "AAAAAAAAAA",
                MaskSet::empty(10),
                port.clone(),
            )
            .unwrap();
            insert(&server, "g1", "AAAAAAAAAA");
            insert(&server, "g2", "AAAACAAAAA");
        }
        let reborn =
            SnvServer::open(test_config(3), "AAAAAAAAAA", MaskSet::empty(10), port).unwrap();
        assert!(reborn.exists(&Guid::new("g1")));
        let rows = reborn
            .neighbours_within(&Guid::new("g1"), 3, 0.0, NeighbourFormat::IdDistance)
            .unwrap();
        assert_eq!(rows, vec![json!(["g2", 1])]);
        // both members still share one cluster with its change history
        let clusters = reborn.clusters("snv1").unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members.len(), 2);
        assert_eq!(reborn.change_id("snv1").unwrap(), 2);
    }

    #[test]
    fn test_server_config_gated_by_debug() {
        let server = server();
        assert!(server.server_config().unwrap().is_some());

        let mut config = test_config(3);
        config.debug_mode = false;
        let locked = SnvServer::open(
            config,
            "AAAAAAAAAA",
            MaskSet::empty(10),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        assert!(locked.server_config().unwrap().is_none());
    }
}
