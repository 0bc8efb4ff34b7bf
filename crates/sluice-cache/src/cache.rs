//! Result (ExecRecord) cache.
//!
//! Records are keyed by method identity and the ordered content hashes of
//! their inputs. Several records may share a key; the earliest eligible one
//! is authoritative.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_pipeline::{Method, MethodId};
use tracing::{debug, info};
use uuid::Uuid;

use crate::dataset::{DatasetId, DatasetRegistry};
use crate::error::CacheError;
use crate::hash::ContentHash;

/// Identity of an exec record. Ids are handed out in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "er{}", self.0)
  }
}

/// Outcome of the component that generates a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
  Running,
  Succeeded,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRecord {
  pub id: RecordId,
  pub method: MethodId,
  pub input_hashes: Vec<ContentHash>,
  pub outputs: Vec<DatasetId>,
  /// Records that produced this record's inputs.
  pub derived_from: Vec<RecordId>,
  /// Log of the generating execution.
  pub log_id: Option<Uuid>,
  pub status: RecordStatus,
  pub redacted: bool,
  pub created_at: DateTime<Utc>,
}

impl ExecRecord {
  fn is_eligible(&self) -> bool {
    self.status == RecordStatus::Succeeded && !self.redacted
  }
}

/// What to do with a component about to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum ReuseDecision {
  /// Point the component at the record; its outputs are on disk.
  Reuse(ExecRecord),
  /// The record stands, but some output bytes were purged and must be
  /// regenerated before a consumer can read them.
  Recover(ExecRecord),
  Miss,
}

type CacheKey = (MethodId, Vec<ContentHash>);

#[derive(Debug, Default)]
struct Records {
  next_id: u64,
  records: HashMap<RecordId, ExecRecord>,
  /// Record ids per key, ascending.
  index: HashMap<CacheKey, Vec<RecordId>>,
}

/// Shared result cache.
#[derive(Debug, Clone, Default)]
pub struct ResultCache {
  inner: Arc<RwLock<Records>>,
}

impl ResultCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Open a record for an execution that is about to start.
  pub fn insert(
    &self,
    method: MethodId,
    input_hashes: Vec<ContentHash>,
    derived_from: Vec<RecordId>,
  ) -> ExecRecord {
    let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
    let id = RecordId(inner.next_id);
    inner.next_id += 1;

    let record = ExecRecord {
      id,
      method: method.clone(),
      input_hashes: input_hashes.clone(),
      outputs: Vec::new(),
      derived_from,
      log_id: None,
      status: RecordStatus::Running,
      redacted: false,
      created_at: Utc::now(),
    };
    inner.records.insert(id, record.clone());
    inner.index.entry((method, input_hashes)).or_default().push(id);
    debug!(record = %id, method = %record.method, "exec_record_created");
    record
  }

  /// Mark the generating execution successful.
  pub fn complete(
    &self,
    id: RecordId,
    outputs: Vec<DatasetId>,
    log_id: Uuid,
  ) -> Result<(), CacheError> {
    self.finish(id, RecordStatus::Succeeded, outputs, Some(log_id))
  }

  /// Mark the generating execution failed. The record is never reused.
  pub fn fail(&self, id: RecordId, log_id: Option<Uuid>) -> Result<(), CacheError> {
    self.finish(id, RecordStatus::Failed, Vec::new(), log_id)
  }

  fn finish(
    &self,
    id: RecordId,
    status: RecordStatus,
    outputs: Vec<DatasetId>,
    log_id: Option<Uuid>,
  ) -> Result<(), CacheError> {
    let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
    let record = inner
      .records
      .get_mut(&id)
      .ok_or(CacheError::UnknownRecord { id })?;
    if record.status != RecordStatus::Running {
      return Err(CacheError::RecordFinished { id });
    }
    record.status = status;
    record.outputs = outputs;
    record.log_id = log_id;
    Ok(())
  }

  pub fn get(&self, id: RecordId) -> Result<ExecRecord, CacheError> {
    let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
    inner
      .records
      .get(&id)
      .cloned()
      .ok_or(CacheError::UnknownRecord { id })
  }

  /// The earliest successful, unredacted record for exactly these inputs.
  pub fn find_reusable(
    &self,
    method: &MethodId,
    input_hashes: &[ContentHash],
  ) -> Option<ExecRecord> {
    let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
    let key = (method.clone(), input_hashes.to_vec());
    inner
      .index
      .get(&key)?
      .iter()
      .filter_map(|id| inner.records.get(id))
      .find(|record| record.is_eligible())
      .cloned()
  }

  /// Decide whether a method execution can be skipped.
  pub fn decide(
    &self,
    method: &Method,
    input_hashes: &[ContentHash],
    datasets: &DatasetRegistry,
  ) -> ReuseDecision {
    if !method.is_reusable() {
      return ReuseDecision::Miss;
    }
    match self.find_reusable(&method.id, input_hashes) {
      Some(record) if datasets.all_retained(&record.outputs) => ReuseDecision::Reuse(record),
      Some(record) => ReuseDecision::Recover(record),
      None => ReuseDecision::Miss,
    }
  }

  /// Invalidate a record and every record derived from it. Returns the ids
  /// newly redacted.
  pub fn redact(&self, id: RecordId) -> Result<Vec<RecordId>, CacheError> {
    let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
    if !inner.records.contains_key(&id) {
      return Err(CacheError::UnknownRecord { id });
    }

    let mut redacted = Vec::new();
    let mut pending = vec![id];
    while let Some(next) = pending.pop() {
      let Some(record) = inner.records.get_mut(&next) else {
        continue;
      };
      if record.redacted {
        continue;
      }
      record.redacted = true;
      redacted.push(next);

      pending.extend(
        inner
          .records
          .values()
          .filter(|r| !r.redacted && r.derived_from.contains(&next))
          .map(|r| r.id),
      );
    }

    redacted.sort();
    info!(record = %id, count = redacted.len(), "exec_record_redacted");
    Ok(redacted)
  }

  pub fn len(&self) -> usize {
    let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
    inner.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
