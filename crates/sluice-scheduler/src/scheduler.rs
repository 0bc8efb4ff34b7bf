use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::SchedulerError;
use crate::types::{AccountingRecord, JobHandle, JobState, SubmitRequest};

/// Client for an external batch scheduler.
#[async_trait]
pub trait BatchScheduler: Send + Sync {
  /// Short name used in logs.
  fn name(&self) -> &'static str;

  /// Check that the scheduler answers at all.
  async fn is_alive(&self) -> Result<(), SchedulerError>;

  async fn submit(&self, request: SubmitRequest) -> Result<JobHandle, SchedulerError>;

  /// Current state. Unrecognised scheduler states map to [`JobState::Unknown`].
  async fn get_state(&self, job: &JobHandle) -> Result<JobState, SchedulerError>;

  /// Cancel a job and every job registered as depending on it. Returns the
  /// handles the cancel was issued for.
  async fn cancel(&self, job: &JobHandle) -> Result<Vec<JobHandle>, SchedulerError>;

  async fn set_priority(&self, jobs: &[JobHandle], priority: u32) -> Result<(), SchedulerError>;

  async fn accounting(
    &self,
    jobs: &[JobHandle],
  ) -> Result<HashMap<JobHandle, AccountingRecord>, SchedulerError>;
}
