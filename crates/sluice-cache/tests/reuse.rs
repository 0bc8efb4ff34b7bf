//! Reuse decisions against real files.

use std::path::PathBuf;

use sluice_cache::{DatasetRegistry, ExecLog, ResultCache, ReuseDecision, hash_file};
use sluice_pipeline::{ImageRef, Method, MethodId, Reusability};

fn method(reusable: Reusability) -> Method {
  Method {
    id: MethodId::new("sort", 1),
    driver: "sort.sh".to_string(),
    image: ImageRef {
      path: PathBuf::from("/images/sort.simg"),
      app: None,
      steps: Vec::new(),
    },
    inputs: vec!["in".to_string()],
    outputs: vec!["out".to_string()],
    threads: 1,
    memory_mb: 0,
    reusable,
  }
}

#[test]
fn test_reuse_then_recover_after_purge() {
  let dir = tempfile::tempdir().expect("failed to create temp dir");
  let input = dir.path().join("input.txt");
  let output = dir.path().join("output.txt");
  std::fs::write(&input, b"b\na\n").expect("write input");
  std::fs::write(&output, b"a\nb\n").expect("write output");

  let datasets = DatasetRegistry::new();
  let cache = ResultCache::new();
  let m = method(Reusability::Deterministic);
  let hashes = vec![hash_file(&input).expect("hash input")];

  assert_eq!(cache.decide(&m, &hashes, &datasets), ReuseDecision::Miss);

  let record = cache.insert(m.id.clone(), hashes.clone(), Vec::new());
  let out = datasets.register_file(&output).expect("register output");
  let mut log = ExecLog::start();
  log.finish(Some(0));
  cache
    .complete(record.id, vec![out.id], log.log_id)
    .expect("complete record");

  match cache.decide(&m, &hashes, &datasets) {
    ReuseDecision::Reuse(found) => assert_eq!(found.id, record.id),
    other => panic!("expected reuse, got {:?}", other),
  }

  datasets.purge(out.id).expect("purge output");
  match cache.decide(&m, &hashes, &datasets) {
    ReuseDecision::Recover(found) => assert_eq!(found.outputs, vec![out.id]),
    other => panic!("expected recover, got {:?}", other),
  }
}

#[test]
fn test_non_reusable_method_always_misses() {
  let datasets = DatasetRegistry::new();
  let cache = ResultCache::new();
  let m = method(Reusability::NonReusable);
  let hashes = vec![sluice_cache::hash_bytes(b"x")];

  let record = cache.insert(m.id.clone(), hashes.clone(), Vec::new());
  cache
    .complete(record.id, Vec::new(), uuid_for_test())
    .expect("complete record");

  assert!(cache.find_reusable(&m.id, &hashes).is_some());
  assert_eq!(cache.decide(&m, &hashes, &datasets), ReuseDecision::Miss);
}

fn uuid_for_test() -> uuid::Uuid {
  ExecLog::start().log_id
}
