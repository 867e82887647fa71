//! Owner of all compressed sequences.
//!
//! The store keeps a lightweight summary (quality, validity, insert time)
//! for every guid permanently in RAM, and a bounded working set of expanded
//! sequences. Expanded entries are handed out as `Arc`s, so LRU eviction
//! only ever drops the store's own reference; a reader holding an evicted
//! sequence keeps it alive until it finishes.
//!
//! Durable records are written through the persistence port at insert time.
//! A cache miss rehydrates from the port, expanding double-delta records
//! through their local reference (one level of indirection at most).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::core::errors::CoreError;
use crate::core::types::Guid;
use crate::persist::{keys, BatchOp, PersistenceError, PersistencePort};
use crate::seq::codec::{ReferenceCodec, MIN_DELTA_SAVING};
use crate::seq::compressed::{CompressedSequence, SequenceForm, SequenceRecord};

/// How many recently persisted single-delta sequences are candidates for
/// the local-reference role.
const ANCHOR_POOL_SIZE: usize = 20;

/// Per-guid facts kept in RAM for the store's whole lifetime.
#[derive(Debug, Clone)]
pub struct SeqSummary {
    pub quality: f64,
    pub invalid: bool,
    pub inserted_at: DateTime<Utc>,
    /// Persisted double-delta rather than single-delta
    pub double_delta: bool,
}

/// Counts reported by the monitoring surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreSummary {
    pub n_sequences: usize,
    pub n_invalid: usize,
    pub n_double_delta: usize,
    pub working_set: usize,
}

struct WorkingSet {
    cached: HashMap<Guid, Arc<CompressedSequence>>,
    last_used: HashMap<Guid, u64>,
    by_tick: BTreeMap<u64, Guid>,
    tick: u64,
    capacity: usize,
}

impl WorkingSet {
    fn new(capacity: usize) -> Self {
        Self {
            cached: HashMap::new(),
            last_used: HashMap::new(),
            by_tick: BTreeMap::new(),
            tick: 0,
            capacity,
        }
    }

    fn get(&mut self, guid: &Guid) -> Option<Arc<CompressedSequence>> {
        let seq = self.cached.get(guid).cloned()?;
        self.touch(guid);
        Some(seq)
    }

    fn touch(&mut self, guid: &Guid) {
        if let Some(old) = self.last_used.get(guid) {
            self.by_tick.remove(old);
        }
        self.tick += 1;
        self.last_used.insert(guid.clone(), self.tick);
        self.by_tick.insert(self.tick, guid.clone());
    }

    fn insert(&mut self, guid: Guid, seq: Arc<CompressedSequence>) {
        self.cached.insert(guid.clone(), seq);
        self.touch(&guid);
        while self.cached.len() > self.capacity {
            let oldest = match self.by_tick.keys().next() {
                Some(&tick) => tick,
                None => break,
            };
            if let Some(victim) = self.by_tick.remove(&oldest) {
                self.cached.remove(&victim);
                self.last_used.remove(&victim);
                debug!(guid = %victim, "evicted from working set");
            }
        }
    }

    fn clear(&mut self) {
        self.cached.clear();
        self.last_used.clear();
        self.by_tick.clear();
    }
}

pub struct CompressedStore {
    codec: Arc<ReferenceCodec>,
    port: Arc<dyn PersistencePort>,
    summaries: HashMap<Guid, SeqSummary>,
    meta: HashMap<Guid, serde_json::Value>,
    working: Mutex<WorkingSet>,
    anchors: VecDeque<Guid>,
}

impl CompressedStore {
    pub fn new(
        codec: Arc<ReferenceCodec>,
        port: Arc<dyn PersistencePort>,
        working_set_capacity: usize,
    ) -> Self {
        Self {
            codec,
            port,
            summaries: HashMap::new(),
            meta: HashMap::new(),
            working: Mutex::new(WorkingSet::new(working_set_capacity)),
            anchors: VecDeque::new(),
        }
    }

    /// Rebuild the per-guid summaries from the port after a restart.
    ///
    /// Expanded sequences are not preloaded; the working set refills on
    /// demand.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Persistence` if the port cannot be scanned, or
    /// `CoreError::Internal` on an undecodable record.
    pub fn rehydrate(&mut self) -> Result<(), CoreError> {
        for key in self.port.scan(keys::SEQ_PREFIX)? {
            let guid = Guid::new(key.trim_start_matches(keys::SEQ_PREFIX));
            let record = self.load_record(&guid)?;
            self.summaries.insert(
                guid.clone(),
                SeqSummary {
                    quality: record.quality,
                    invalid: record.invalid,
                    inserted_at: record.inserted_at,
                    double_delta: matches!(record.form, SequenceForm::Delta { .. }),
                },
            );
            // only single-delta records can anchor future inserts
            if matches!(record.form, SequenceForm::Single) {
                self.remember_anchor(guid.clone());
            }
            if let Some(bytes) = self.port.get(&keys::meta(&guid))? {
                match serde_json::from_slice(&bytes) {
                    Ok(value) => {
                        self.meta.insert(guid, value);
                    }
                    Err(e) => warn!(%guid, error = %e, "skipping undecodable annotation"),
                }
            }
        }
        Ok(())
    }

    /// Compress and store a new sequence.
    ///
    /// The durable record (double-delta when a nearby anchor saves enough)
    /// and the annotation are written in one atomic batch before anything
    /// in RAM changes, so a port failure leaves the store untouched.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` from encoding and
    /// `CoreError::Persistence` if the write fails after one retry.
    pub fn insert(
        &mut self,
        guid: &Guid,
        sequence: &str,
        meta: Option<serde_json::Value>,
        max_uncertain_proportion: f64,
    ) -> Result<Arc<CompressedSequence>, CoreError> {
        let compressed = self.codec.encode(sequence, max_uncertain_proportion)?;
        let inserted_at = Utc::now();

        let record = match self.choose_anchor(&compressed)? {
            Some((anchor_guid, anchor)) => {
                debug!(%guid, anchor = %anchor_guid, "storing double-delta");
                self.codec.to_delta_record(&compressed, &anchor_guid, &anchor, inserted_at)
            }
            None => self.codec.to_single_record(&compressed, inserted_at),
        };
        let double_delta = matches!(record.form, SequenceForm::Delta { .. });

        let record_bytes = serde_json::to_vec(&record)
            .map_err(|e| CoreError::Internal(format!("cannot serialise sequence record: {e}")))?;
        let meta_value = meta.unwrap_or(serde_json::Value::Null);
        let meta_bytes = serde_json::to_vec(&meta_value)
            .map_err(|e| CoreError::Internal(format!("cannot serialise annotation: {e}")))?;

        self.batch_with_retry(vec![
            BatchOp::Put { key: keys::seq(guid), value: record_bytes },
            BatchOp::Put { key: keys::meta(guid), value: meta_bytes },
        ])?;

        self.summaries.insert(
            guid.clone(),
            SeqSummary {
                quality: compressed.quality,
                invalid: compressed.invalid,
                inserted_at,
                double_delta,
            },
        );
        self.meta.insert(guid.clone(), meta_value);
        if !double_delta {
            self.remember_anchor(guid.clone());
        }

        let arc = Arc::new(compressed);
        self.working.lock().expect("working set poisoned").insert(guid.clone(), arc.clone());
        Ok(arc)
    }

    /// Fetch the expanded form, rehydrating from the port on a miss.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for an unknown guid and
    /// `CoreError::Persistence`/`CoreError::Internal` on rehydration
    /// failure.
    pub fn get(&self, guid: &Guid) -> Result<Arc<CompressedSequence>, CoreError> {
        if !self.summaries.contains_key(guid) {
            return Err(CoreError::NotFound(format!("no sequence with guid {guid}")));
        }
        if let Some(seq) = self.working.lock().expect("working set poisoned").get(guid) {
            return Ok(seq);
        }

        let record = self.load_record(guid)?;
        let expanded = match &record.form {
            SequenceForm::Single => self.codec.expand_record(&record, None)?,
            SequenceForm::Delta { local_ref } => {
                let anchor = self.anchor_for_expansion(local_ref)?;
                self.codec.expand_record(&record, Some((local_ref, &anchor)))?
            }
        };

        let arc = Arc::new(expanded);
        self.working.lock().expect("working set poisoned").insert(guid.clone(), arc.clone());
        Ok(arc)
    }

    #[must_use]
    pub fn exists(&self, guid: &Guid) -> bool {
        self.summaries.contains_key(guid)
    }

    /// All stored guids in ascending order.
    #[must_use]
    pub fn all_guids(&self) -> Vec<Guid> {
        let mut guids: Vec<Guid> = self.summaries.keys().cloned().collect();
        guids.sort();
        guids
    }

    /// Guids eligible for comparison (not flagged invalid), ascending.
    #[must_use]
    pub fn valid_guids(&self) -> Vec<Guid> {
        let mut guids: Vec<Guid> =
            self.summaries.iter().filter(|(_, s)| !s.invalid).map(|(g, _)| g.clone()).collect();
        guids.sort();
        guids
    }

    #[must_use]
    pub fn quality(&self, guid: &Guid) -> Option<f64> {
        self.summaries.get(guid).map(|s| s.quality)
    }

    #[must_use]
    pub fn summary_of(&self, guid: &Guid) -> Option<&SeqSummary> {
        self.summaries.get(guid)
    }

    #[must_use]
    pub fn annotation(&self, guid: &Guid) -> Option<&serde_json::Value> {
        self.meta.get(guid)
    }

    /// Replace the stored annotation for `guid`, durably and in RAM.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown guid; `CoreError::Persistence` if the
    /// write fails after one retry.
    pub fn set_annotation(
        &mut self,
        guid: &Guid,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        if !self.summaries.contains_key(guid) {
            return Err(CoreError::NotFound(format!("no sequence with guid {guid}")));
        }
        let bytes = serde_json::to_vec(&value)
            .map_err(|e| CoreError::Internal(format!("cannot serialise annotation: {e}")))?;
        self.batch_with_retry(vec![BatchOp::Put { key: keys::meta(guid), value: bytes }])?;
        self.meta.insert(guid.clone(), value);
        Ok(())
    }

    /// Reconstruct the masked consensus string.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown guids; `QualityTooLow` for sequences flagged
    /// invalid, whose reconstruction would be mostly no-calls.
    pub fn sequence(&self, guid: &Guid) -> Result<String, CoreError> {
        let summary = self
            .summaries
            .get(guid)
            .ok_or_else(|| CoreError::NotFound(format!("no sequence with guid {guid}")))?;
        if summary.invalid {
            return Err(CoreError::QualityTooLow {
                guid: guid.clone(),
                quality: summary.quality,
            });
        }
        Ok(self.codec.decode(self.get(guid)?.as_ref()))
    }

    /// Guids starting with `prefix`, capped at `limit`; an over-full match
    /// set returns the empty list rather than an arbitrary truncation.
    #[must_use]
    pub fn guids_beginning_with(&self, prefix: &str, limit: usize) -> Vec<Guid> {
        let mut matches = Vec::new();
        for guid in self.all_guids() {
            if guid.as_str().starts_with(prefix) {
                if matches.len() == limit {
                    return Vec::new();
                }
                matches.push(guid);
            }
        }
        matches
    }

    #[must_use]
    pub fn guids_with_quality_over(&self, cutoff: f64) -> Vec<Guid> {
        let mut guids: Vec<Guid> = self
            .summaries
            .iter()
            .filter(|(_, s)| s.quality >= cutoff)
            .map(|(g, _)| g.clone())
            .collect();
        guids.sort();
        guids
    }

    #[must_use]
    pub fn examination_times(&self) -> BTreeMap<Guid, DateTime<Utc>> {
        self.summaries.iter().map(|(g, s)| (g.clone(), s.inserted_at)).collect()
    }

    #[must_use]
    pub fn store_summary(&self) -> StoreSummary {
        StoreSummary {
            n_sequences: self.summaries.len(),
            n_invalid: self.summaries.values().filter(|s| s.invalid).count(),
            n_double_delta: self.summaries.values().filter(|s| s.double_delta).count(),
            working_set: self.working.lock().expect("working set poisoned").cached.len(),
        }
    }

    /// Drop every sequence, in RAM and at the port.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Persistence` if the port cannot be cleared.
    pub fn reset(&mut self) -> Result<(), CoreError> {
        let mut ops = Vec::new();
        for prefix in [keys::SEQ_PREFIX, keys::META_PREFIX] {
            for key in self.port.scan(prefix)? {
                ops.push(BatchOp::Delete { key });
            }
        }
        self.port.atomic_batch(ops)?;
        self.summaries.clear();
        self.meta.clear();
        self.anchors.clear();
        self.working.lock().expect("working set poisoned").clear();
        Ok(())
    }

    fn remember_anchor(&mut self, guid: Guid) {
        self.anchors.push_back(guid);
        while self.anchors.len() > ANCHOR_POOL_SIZE {
            self.anchors.pop_front();
        }
    }

    /// Best local reference among the recent anchors, if re-encoding
    /// against it saves enough positions. Invalid sequences are stored
    /// single-delta: they never participate in comparisons, so shrinking
    /// them is not worth a pointer to chase.
    fn choose_anchor(
        &self,
        compressed: &CompressedSequence,
    ) -> Result<Option<(Guid, Arc<CompressedSequence>)>, CoreError> {
        if compressed.invalid {
            return Ok(None);
        }
        let mut best: Option<(i64, Guid, Arc<CompressedSequence>)> = None;
        for anchor_guid in &self.anchors {
            let anchor = self.get(anchor_guid)?;
            let saving = ReferenceCodec::delta_saving(compressed, &anchor);
            if saving >= MIN_DELTA_SAVING as i64
                && best.as_ref().map_or(true, |(s, _, _)| saving > *s)
            {
                best = Some((saving, anchor_guid.clone(), anchor));
            }
        }
        Ok(best.map(|(_, guid, anchor)| (guid, anchor)))
    }

    /// Expanded form of a local reference during rehydration. The anchor
    /// must itself be single-delta; a deeper chain is a stored-data bug.
    fn anchor_for_expansion(&self, guid: &Guid) -> Result<Arc<CompressedSequence>, CoreError> {
        if let Some(seq) = self.working.lock().expect("working set poisoned").get(guid) {
            return Ok(seq);
        }
        let record = self.load_record(guid)?;
        if !matches!(record.form, SequenceForm::Single) {
            return Err(CoreError::Internal(format!(
                "local reference {guid} is itself double-delta"
            )));
        }
        let expanded = self.codec.expand_record(&record, None)?;
        let arc = Arc::new(expanded);
        self.working.lock().expect("working set poisoned").insert(guid.clone(), arc.clone());
        Ok(arc)
    }

    fn load_record(&self, guid: &Guid) -> Result<SequenceRecord, CoreError> {
        let bytes = self
            .port
            .get(&keys::seq(guid))?
            .ok_or_else(|| CoreError::NotFound(format!("no persisted sequence for {guid}")))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            CoreError::Internal(format!("undecodable sequence record for {guid}: {e}"))
        })
    }

    /// One retry on a transient port failure, then give up.
    fn batch_with_retry(&self, ops: Vec<BatchOp>) -> Result<(), PersistenceError> {
        match self.port.atomic_batch(ops.clone()) {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "transient persistence failure, retrying batch");
                self.port.atomic_batch(ops)
            }
            other => other,
        }
    }
}
