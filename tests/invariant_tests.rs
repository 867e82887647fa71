//! Cross-component invariants: symmetry, completeness of the edge set,
//! failure rollback, restart fidelity and change-id behaviour.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use snv_server::persist::{BatchOp, PersistenceError};
use snv_server::{
    CoreError, Guid, InsertOutcome, InsertPayload, MaskSet, MemoryStore, NeighbourFormat,
    PersistencePort, ServerConfig, SnvServer,
};

const REFERENCE: &str = "AAAAAAAAAAAAAAAAAAAA";

fn config_json(ceiling: u32) -> String {
    format!(
        r#"{{
            "snv_ceiling": {ceiling},
            "max_n_percent": 0.5,
            "debug_mode": true,
            "clustering": [
                {{"name": "t2", "threshold": 2, "uncertain_char": "n",
                 "mixture_policy": "include_mixed"}}
            ]
        }}"#
    )
}

fn open(port: Arc<dyn PersistencePort>, ceiling: u32) -> SnvServer {
    let config = ServerConfig::from_json(&config_json(ceiling)).unwrap();
    SnvServer::open(config, REFERENCE, MaskSet::empty(20), port).unwrap()
}

fn insert(server: &SnvServer, guid: &str, seq: &str) {
    server
        .insert(InsertPayload { guid: guid.to_string(), seq: seq.to_string(), meta: None })
        .unwrap();
}

fn distances(server: &SnvServer, guid: &str) -> Vec<(String, u64)> {
    server
        .neighbours_within(&Guid::new(guid), 100, 0.0, NeighbourFormat::IdDistance)
        .unwrap()
        .into_iter()
        .map(|row| {
            (row[0].as_str().unwrap().to_string(), row[1].as_u64().unwrap())
        })
        .collect()
}

/// A port that can be told to reject edge batches, to drive the insert
/// pipeline's rollback path.
struct FlakyPort {
    inner: MemoryStore,
    fail_edge_batches: AtomicBool,
}

impl FlakyPort {
    fn new() -> Self {
        Self { inner: MemoryStore::new(), fail_edge_batches: AtomicBool::new(false) }
    }
}

impl PersistencePort for FlakyPort {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        self.inner.put(key, value)
    }
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.inner.get(key)
    }
    fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        self.inner.delete(key)
    }
    fn scan(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        self.inner.scan(prefix)
    }
    fn atomic_batch(&self, ops: Vec<BatchOp>) -> Result<(), PersistenceError> {
        let touches_edges = ops.iter().any(|op| match op {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key.starts_with("edge/"),
        });
        if touches_edges && self.fail_edge_batches.load(Ordering::SeqCst) {
            return Err(PersistenceError::Fatal("injected edge failure".to_string()));
        }
        self.inner.atomic_batch(ops)
    }
}

#[test]
fn test_distance_symmetry_across_the_surface() {
    let server = open(Arc::new(MemoryStore::new()), 10);
    insert(&server, "a", "CAAAAAAAAAAAAAAAAAAA");
    insert(&server, "b", "CGAAAAAAAAAAAAAAAAAA");
    insert(&server, "c", "CGTAAAAAAAAAAAAAAAAA");

    for (g1, g2) in [("a", "b"), ("a", "c"), ("b", "c")] {
        let forward = distances(&server, g1);
        let backward = distances(&server, g2);
        let d_forward = forward.iter().find(|(g, _)| g == g2).map(|(_, d)| *d);
        let d_backward = backward.iter().find(|(g, _)| g == g1).map(|(_, d)| *d);
        assert_eq!(d_forward, d_backward, "pair ({g1},{g2})");
        assert!(d_forward.is_some());
    }
}

#[test]
fn test_every_pair_within_ceiling_has_an_edge() {
    let server = open(Arc::new(MemoryStore::new()), 10);
    let sequences = [
        ("s0", "CAAAAAAAAAAAAAAAAAAA"),
        ("s1", "ACAAAAAAAAAAAAAAAAAA"),
        ("s2", "AACAAAAAAAAAAAAAAAAA"),
        ("s3", "AAACAAAAAAAAAAAAAAAA"),
    ];
    for (guid, seq) in sequences {
        insert(&server, guid, seq);
    }
    // every pair differs at exactly two positions, well under the ceiling
    for (guid, _) in sequences {
        assert_eq!(distances(&server, guid).len(), 3, "guid {guid}");
    }
}

#[test]
fn test_failed_edge_write_rolls_back_and_retry_is_noop() {
    let port = Arc::new(FlakyPort::new());
    let server = open(port.clone(), 10);
    insert(&server, "g1", "CAAAAAAAAAAAAAAAAAAA");

    port.fail_edge_batches.store(true, Ordering::SeqCst);
    let err = server.insert(InsertPayload {
        guid: "g2".to_string(),
        seq: "CCAAAAAAAAAAAAAAAAAA".to_string(),
        meta: None,
    });
    assert!(matches!(err, Err(CoreError::Persistence(_))));

    // the sequence record survived, the edges did not
    assert!(server.exists(&Guid::new("g2")));
    assert!(distances(&server, "g1").is_empty());
    assert!(port.scan("edge/").unwrap().is_empty());

    // a retried insert is a no-op
    port.fail_edge_batches.store(false, Ordering::SeqCst);
    let outcome = server
        .insert(InsertPayload {
            guid: "g2".to_string(),
            seq: "CCAAAAAAAAAAAAAAAAAA".to_string(),
            meta: None,
        })
        .unwrap();
    assert!(matches!(outcome, InsertOutcome::AlreadyPresent));
}

#[test]
fn test_restart_round_trips_sequences_and_clusters() {
    let port: Arc<dyn PersistencePort> = Arc::new(MemoryStore::new());
    let sequences = [
        ("anchor", "CCCCCCCCCCAAAAAAAAAA"),
        ("near1", "CCCCCCCCCTAAAAAAAAAA"),
        ("near2", "CCCCCCCCGCAAAAAAAAAA"),
        ("lonely", "AAAAAAAAAAGGGGGGGGGG"),
    ];
    let change_id;
    {
        let server = open(port.clone(), 10);
        for (guid, seq) in sequences {
            insert(&server, guid, seq);
        }
        change_id = server.change_id("t2").unwrap();
    }

    let reborn = open(port, 10);
    // bit-exact reconstruction through whatever storage form was chosen
    for (guid, seq) in sequences {
        assert_eq!(reborn.sequence(&Guid::new(guid)).unwrap(), seq, "guid {guid}");
    }
    assert_eq!(reborn.change_id("t2").unwrap(), change_id);
    let clusters = reborn.clusters("t2").unwrap();
    assert_eq!(clusters.len(), 2);
    let sizes: Vec<usize> = clusters.iter().map(|c| c.members.len()).collect();
    assert!(sizes.contains(&3) && sizes.contains(&1));
}

#[test]
fn test_change_ids_are_monotone_and_deltas_are_scoped() {
    let server = open(Arc::new(MemoryStore::new()), 10);
    insert(&server, "a", "CAAAAAAAAAAAAAAAAAAA");
    let after_a = server.change_id("t2").unwrap();
    insert(&server, "b", "GAAAAAAAAAAAAAAAAAAA");
    let after_b = server.change_id("t2").unwrap();
    assert!(after_b > after_a);

    // only b's membership changed since after_a
    let deltas = server.guids2clusters("t2", Some(after_a)).unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].guid, Guid::new("b"));

    // a full query reports both
    assert_eq!(server.guids2clusters("t2", None).unwrap().len(), 2);

    // a query from the current id reports nothing
    assert!(server.guids2clusters("t2", Some(after_b)).unwrap().is_empty());
}

#[test]
fn test_network_reports_nodes_and_edges() {
    let server = open(Arc::new(MemoryStore::new()), 10);
    insert(&server, "a", "CAAAAAAAAAAAAAAAAAAA");
    insert(&server, "b", "CCAAAAAAAAAAAAAAAAAA");

    let cluster_ids = server.cluster_ids("t2").unwrap();
    assert_eq!(cluster_ids.len(), 1);
    let network = server.network("t2", cluster_ids[0]).unwrap();
    assert_eq!(network["nodes"].as_array().unwrap().len(), 2);
    let edges = network["edges"].as_array().unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0]["snv"], json!(1));

    assert!(matches!(
        server.network("t2", snv_server::ClusterId(999)),
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(
        server.network("nope", cluster_ids[0]),
        Err(CoreError::NotFound(_))
    ));
}

#[test]
fn test_small_working_set_still_answers_queries() {
    let config = ServerConfig::from_json(
        r#"{"snv_ceiling": 10, "working_set_capacity": 2, "debug_mode": true}"#,
    )
    .unwrap();
    let server =
        SnvServer::open(config, REFERENCE, MaskSet::empty(20), Arc::new(MemoryStore::new()))
            .unwrap();
    let sequences = [
        ("s0", "CAAAAAAAAAAAAAAAAAAA"),
        ("s1", "ACAAAAAAAAAAAAAAAAAA"),
        ("s2", "AACAAAAAAAAAAAAAAAAA"),
        ("s3", "AAACAAAAAAAAAAAAAAAA"),
        ("s4", "AAAACAAAAAAAAAAAAAAA"),
    ];
    for (guid, seq) in sequences {
        insert(&server, guid, seq);
    }
    // every comparison beyond capacity went through rehydration; results
    // must be unaffected
    for (guid, seq) in sequences {
        assert_eq!(server.sequence(&Guid::new(guid)).unwrap(), seq);
        assert_eq!(distances(&server, guid).len(), 4);
    }
}
