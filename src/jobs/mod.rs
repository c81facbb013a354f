use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engines::{EngineKind, JobResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),
    #[error("job record dropped before completion")]
    Dropped,
    #[error("job {0} is already registered")]
    Duplicate(Uuid),
}

#[derive(Debug, Clone)]
enum JobState {
    Running,
    Finished(JobResult),
    Failed(String),
}

impl JobState {
    fn status(&self) -> JobStatus {
        match self {
            JobState::Running => JobStatus::Running,
            JobState::Finished(_) => JobStatus::Finished,
            JobState::Failed(_) => JobStatus::Failed,
        }
    }
}

/// One execution of an engine.
///
/// State moves `running -> finished` or `running -> failed` exactly once;
/// waiters are woken by the transition itself.
#[derive(Debug)]
pub struct Job {
    uuid: Uuid,
    kind: EngineKind,
    created_at: DateTime<Utc>,
    finished_at: RwLock<Option<DateTime<Utc>>>,
    state: watch::Sender<JobState>,
}

impl Job {
    pub fn new(kind: EngineKind) -> Self {
        Self::with_uuid(Uuid::new_v4(), kind)
    }

    pub fn with_uuid(uuid: Uuid, kind: EngineKind) -> Self {
        let (state, _) = watch::channel(JobState::Running);
        Self {
            uuid,
            kind,
            created_at: Utc::now(),
            finished_at: RwLock::new(None),
            state,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> JobStatus {
        self.state.borrow().status()
    }

    /// Stored result; `None` until the job has finished.
    pub fn result(&self) -> Option<JobResult> {
        match &*self.state.borrow() {
            JobState::Finished(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// Failure reason, if the job failed.
    pub fn error(&self) -> Option<String> {
        match &*self.state.borrow() {
            JobState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Store the result and mark the job finished. Returns `false` if already terminal.
    pub fn finish(&self, result: JobResult) -> bool {
        self.transition(JobState::Finished(result))
    }

    /// Mark the job failed. Returns `false` if already terminal.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.transition(JobState::Failed(reason.into()))
    }

    fn transition(&self, next: JobState) -> bool {
        let mut next = Some(next);
        let changed = self.state.send_if_modified(|state| {
            if state.status().is_terminal() {
                return false;
            }
            if let Some(next) = next.take() {
                *state = next;
            }
            true
        });
        if changed {
            *self.finished_at.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        }
        changed
    }

    /// Resolve once the job reaches a terminal state.
    pub async fn wait_for_results(&self) -> Result<JobResult, JobError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| state.status().is_terminal())
            .await
            .map_err(|_| JobError::Dropped)?
            .clone();
        match state {
            JobState::Finished(result) => Ok(result),
            JobState::Failed(reason) => Err(JobError::Failed(reason)),
            JobState::Running => Err(JobError::Dropped),
        }
    }
}

/// Eviction policy for terminal jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Retention {
    /// Evict terminal jobs this long after they finished.
    pub ttl: Option<Duration>,
    /// Keep at most this many records; oldest terminal jobs go first.
    pub max_jobs: Option<usize>,
}

/// Job records keyed by uuid.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Arc<Job>>>,
    retention: Retention,
}

impl JobStore {
    pub fn new(retention: Retention) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn register(&self, job: Arc<Job>) -> Result<(), JobError> {
        {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            if jobs.contains_key(&job.uuid()) {
                return Err(JobError::Duplicate(job.uuid()));
            }
            debug!(job = %job.uuid(), kind = job.kind().name(), "Job registered");
            jobs.insert(job.uuid(), job);
        }
        if let Some(max) = self.retention.max_jobs {
            if self.len() > max {
                self.prune(Utc::now());
            }
        }
        Ok(())
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Arc<Job>> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(uuid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running_count(&self) -> usize {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|j| j.status() == JobStatus::Running)
            .count()
    }

    /// Apply the retention policy as of `now`. Running jobs are never evicted.
    /// Returns the number of evicted records.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();

        if let Some(ttl) = self.retention.ttl {
            let cutoff = now - ttl;
            jobs.retain(|_, job| match job.finished_at() {
                Some(finished) => finished > cutoff,
                None => true,
            });
        }

        if let Some(max) = self.retention.max_jobs {
            if jobs.len() > max {
                let mut terminal: Vec<(DateTime<Utc>, Uuid)> = jobs
                    .values()
                    .filter_map(|job| job.finished_at().map(|t| (t, job.uuid())))
                    .collect();
                terminal.sort();
                let excess = jobs.len() - max;
                for (_, uuid) in terminal.into_iter().take(excess) {
                    jobs.remove(&uuid);
                }
            }
        }

        let evicted = before - jobs.len();
        if evicted > 0 {
            info!("Job store evicted {evicted} records ({} remaining)", jobs.len());
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::BalanceResult;

    fn balance(value: i64) -> JobResult {
        JobResult::Balance(BalanceResult { balance: value })
    }

    #[test]
    fn result_absent_until_finished() {
        let job = Job::new(EngineKind::Balance);
        assert_eq!(job.status(), JobStatus::Running);
        assert!(job.result().is_none());

        assert!(job.finish(balance(42)));
        assert_eq!(job.status(), JobStatus::Finished);
        assert!(matches!(job.result(), Some(JobResult::Balance(BalanceResult { balance: 42 }))));
        assert!(job.finished_at().is_some());
    }

    #[test]
    fn terminal_state_is_final() {
        let job = Job::new(EngineKind::Balance);
        assert!(job.fail("provider down"));
        assert!(!job.finish(balance(1)));
        assert!(!job.fail("again"));
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error().as_deref(), Some("provider down"));
        assert!(job.result().is_none());
    }

    #[test]
    fn duplicate_uuid_rejected() {
        let store = JobStore::default();
        let uuid = Uuid::new_v4();
        store.register(Arc::new(Job::with_uuid(uuid, EngineKind::Related))).unwrap();
        let err = store
            .register(Arc::new(Job::with_uuid(uuid, EngineKind::Volume)))
            .unwrap_err();
        assert!(matches!(err, JobError::Duplicate(u) if u == uuid));
        assert_eq!(store.get(&uuid).unwrap().kind(), EngineKind::Related);
    }

    #[tokio::test]
    async fn wait_for_results_wakes_on_finish() {
        let job = Arc::new(Job::new(EngineKind::Balance));
        let waiter = {
            let job = job.clone();
            tokio::spawn(async move { job.wait_for_results().await })
        };
        tokio::task::yield_now().await;
        job.finish(balance(7));
        let result = waiter.await.unwrap().unwrap();
        assert!(matches!(result, JobResult::Balance(BalanceResult { balance: 7 })));
    }

    #[tokio::test]
    async fn wait_for_results_rejects_on_failure() {
        let job = Job::new(EngineKind::Balance);
        job.fail("boom");
        let err = job.wait_for_results().await.unwrap_err();
        assert!(matches!(err, JobError::Failed(reason) if reason == "boom"));
    }

    #[test]
    fn prune_by_ttl_keeps_running_jobs() {
        let store = JobStore::new(Retention {
            ttl: Some(Duration::seconds(60)),
            max_jobs: None,
        });
        let done = Arc::new(Job::new(EngineKind::Balance));
        let running = Arc::new(Job::new(EngineKind::Balance));
        store.register(done.clone()).unwrap();
        store.register(running.clone()).unwrap();
        done.finish(balance(0));

        assert_eq!(store.prune(Utc::now()), 0);
        assert_eq!(store.prune(Utc::now() + Duration::seconds(120)), 1);
        assert!(store.get(&done.uuid()).is_none());
        assert!(store.get(&running.uuid()).is_some());
    }

    #[test]
    fn capacity_evicts_oldest_terminal_first() {
        let store = JobStore::new(Retention {
            ttl: None,
            max_jobs: Some(2),
        });
        let first = Arc::new(Job::new(EngineKind::Balance));
        let second = Arc::new(Job::new(EngineKind::Balance));
        store.register(first.clone()).unwrap();
        store.register(second.clone()).unwrap();
        first.finish(balance(1));
        std::thread::sleep(std::time::Duration::from_millis(5));
        second.finish(balance(2));

        let third = Arc::new(Job::new(EngineKind::Balance));
        store.register(third.clone()).unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get(&first.uuid()).is_none());
        assert!(store.get(&second.uuid()).is_some());
        assert!(store.get(&third.uuid()).is_some());
    }

    #[test]
    fn capacity_never_evicts_running() {
        let store = JobStore::new(Retention {
            ttl: None,
            max_jobs: Some(1),
        });
        let a = Arc::new(Job::new(EngineKind::Related));
        let b = Arc::new(Job::new(EngineKind::Related));
        store.register(a).unwrap();
        store.register(b).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.running_count(), 2);
    }
}
