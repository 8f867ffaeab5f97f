//! Job queue with a fingerprint-keyed job table.
//!
//! At most one job exists per fingerprint. Submitting a fingerprint whose job
//! is `Queued` or `Running` attaches to that job. A `Succeeded` job inside the
//! retention window is handed back as a cached result. `Failed` and
//! `Cancelled` jobs are replaced by a fresh one.
//!
//! Running extractions are bounded by a semaphore; tokio's semaphore is fair,
//! so excess jobs start in submission order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use imgserv_core::error::CoreError;
use imgserv_core::fingerprint::Fingerprint;
use imgserv_core::scheduling::{can_transition, JobStatus, JobStatusView};
use imgserv_core::types::{JobId, Timestamp};
use tokio::sync::{broadcast, watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, JobEvent};
use crate::executor::{CutoutExecutor, JobSpec};
use crate::store::{ResultRef, ResultStore};

/// Default bound on simultaneously running extractions.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Default retention window for terminal jobs: 1 hour.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    /// How long terminal jobs stay in the table. Within this window a
    /// `Succeeded` job is served from cache.
    pub retention: Duration,
    /// Extra attempts after a `StorageUnavailable` failure.
    pub max_retries: u32,
    /// Delay before the first retry, doubled on every further one.
    pub retry_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            retention: DEFAULT_RETENTION,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Point-in-time state of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub result: Option<ResultRef>,
    pub error: Option<CoreError>,
    pub completed_at: Option<Timestamp>,
}

impl JobSnapshot {
    fn queued() -> Self {
        Self {
            status: JobStatus::Queued,
            result: None,
            error: None,
            completed_at: None,
        }
    }
}

struct JobEntry {
    id: JobId,
    spec: JobSpec,
    created_at: Timestamp,
    state: watch::Sender<JobSnapshot>,
    /// Callers currently holding an attached handle.
    attached: AtomicUsize,
    cancel: CancellationToken,
}

impl JobEntry {
    fn new(spec: JobSpec) -> Self {
        let (state, _) = watch::channel(JobSnapshot::queued());
        Self {
            id: JobId::now_v7(),
            spec,
            created_at: Utc::now(),
            state,
            attached: AtomicUsize::new(1),
            cancel: CancellationToken::new(),
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        self.state.borrow().clone()
    }

    fn view(&self) -> JobStatusView {
        let snapshot = self.snapshot();
        JobStatusView {
            job_id: self.id,
            status: snapshot.status,
            result_location: snapshot.result.map(|r| r.location),
            error_kind: snapshot.error.map(|e| e.kind()),
        }
    }

    fn is_expired(&self, now: Timestamp, retention: Duration) -> bool {
        let state = self.state.borrow();
        match state.completed_at {
            Some(done) if state.status.is_terminal() => {
                (now - done).to_std().unwrap_or_default() >= retention
            }
            _ => false,
        }
    }
}

struct QueueInner {
    jobs: Mutex<HashMap<Fingerprint, Arc<JobEntry>>>,
    permits: Arc<Semaphore>,
    executor: Arc<dyn CutoutExecutor>,
    store: Arc<dyn ResultStore>,
    events: Arc<EventBus>,
    config: QueueConfig,
}

/// In-process job queue. Cloning is cheap and shares the same job table.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(
        executor: Arc<dyn CutoutExecutor>,
        store: Arc<dyn ResultStore>,
        events: Arc<EventBus>,
        config: QueueConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(QueueInner {
                jobs: Mutex::new(HashMap::new()),
                permits,
                executor,
                store,
                events,
                config,
            }),
        }
    }

    /// Submit a job and return immediately with a handle to it.
    ///
    /// Must be called from within a Tokio runtime: new jobs are spawned onto
    /// it.
    pub fn submit(&self, spec: JobSpec) -> JobHandle {
        let mut jobs = self.inner.lock_jobs();

        let mut stale_result = None;
        if let Some(entry) = jobs.get(&spec.fingerprint) {
            let snapshot = entry.snapshot();
            if snapshot.status.is_active() {
                entry.attached.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(
                    job_id = %entry.id,
                    fingerprint = %spec.fingerprint,
                    status = snapshot.status.as_str(),
                    "Attached to existing job"
                );
                return JobHandle::new(Arc::clone(&self.inner), Arc::clone(entry), true);
            }
            if snapshot.status == JobStatus::Succeeded {
                if !entry.is_expired(Utc::now(), self.inner.config.retention) {
                    tracing::debug!(
                        job_id = %entry.id,
                        fingerprint = %spec.fingerprint,
                        "Serving cached result"
                    );
                    return JobHandle::new(Arc::clone(&self.inner), Arc::clone(entry), false);
                }
                stale_result = snapshot.result;
            }
        }

        let entry = Arc::new(JobEntry::new(spec));
        jobs.insert(entry.spec.fingerprint.clone(), Arc::clone(&entry));
        drop(jobs);

        // The expired result is no longer reachable through the table.
        if let Some(result) = stale_result {
            if let Err(e) = self.inner.store.remove(&result) {
                tracing::warn!(location = %result.location, error = %e, "Failed to remove stale result");
            }
        }

        tracing::info!(
            job_id = %entry.id,
            fingerprint = %entry.spec.fingerprint,
            dataset_id = %entry.spec.dataset_id,
            filter = %entry.spec.filter,
            target = %entry.spec.target,
            "Job queued"
        );
        self.inner
            .events
            .publish(JobEvent::new(entry.id, entry.spec.fingerprint.clone(), JobStatus::Queued));

        tokio::spawn(run_job(Arc::clone(&self.inner), Arc::clone(&entry)));
        JobHandle::new(Arc::clone(&self.inner), entry, true)
    }

    pub fn status(&self, fingerprint: &Fingerprint) -> Option<JobStatusView> {
        self.inner.lock_jobs().get(fingerprint).map(|e| e.view())
    }

    pub fn len(&self) -> usize {
        self.inner.lock_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Drop a terminal job and its stored result. Active jobs are left alone.
    pub async fn evict(&self, fingerprint: &Fingerprint) -> bool {
        let evicted = {
            let mut jobs = self.inner.lock_jobs();
            match jobs.get(fingerprint) {
                Some(entry) if entry.snapshot().status.is_terminal() => jobs.remove(fingerprint),
                _ => None,
            }
        };
        match evicted {
            Some(entry) => {
                if let Some(result) = entry.snapshot().result {
                    self.inner.discard(result).await;
                }
                true
            }
            None => false,
        }
    }

    /// Evict every terminal job older than the retention window. Returns
    /// the number evicted.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let retention = self.inner.config.retention;
        let mut expired = Vec::new();
        self.inner.lock_jobs().retain(|_, entry| {
            if entry.is_expired(now, retention) {
                expired.push(Arc::clone(entry));
                false
            } else {
                true
            }
        });

        for entry in &expired {
            tracing::debug!(
                job_id = %entry.id,
                fingerprint = %entry.spec.fingerprint,
                age_secs = (now - entry.created_at).num_seconds(),
                "Evicting expired job"
            );
            if let Some(result) = entry.snapshot().result {
                self.inner.discard(result).await;
            }
        }
        expired.len()
    }
}

impl QueueInner {
    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<Fingerprint, Arc<JobEntry>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compare-and-set a job's status. Returns false if the transition is not
    /// allowed from the current state, in which case nothing changes.
    fn transition(
        &self,
        entry: &JobEntry,
        to: JobStatus,
        result: Option<ResultRef>,
        error: Option<CoreError>,
    ) -> bool {
        let mut applied = false;
        entry.state.send_if_modified(|state| {
            if !can_transition(state.status, to) {
                return false;
            }
            state.status = to;
            if to.is_terminal() {
                state.completed_at = Some(Utc::now());
            }
            state.result = result;
            state.error = error;
            applied = true;
            true
        });

        if applied {
            let snapshot = entry.snapshot();
            let mut event = JobEvent::new(entry.id, entry.spec.fingerprint.clone(), to);
            if let Some(result) = &snapshot.result {
                event = event.with_result(result.location.clone());
            }
            if let Some(error) = &snapshot.error {
                event = event.with_error(error.kind());
            }
            self.events.publish(event);
        }
        applied
    }

    async fn execute_with_retry(&self, entry: &JobEntry) -> Result<ResultRef, CoreError> {
        let mut attempt: u32 = 0;
        loop {
            match self
                .executor
                .execute(entry.id, &entry.spec, &entry.cancel)
                .await
            {
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self
                        .config
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(attempt));
                    attempt += 1;
                    tracing::warn!(
                        job_id = %entry.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying job after storage failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }

    async fn finish(&self, entry: &JobEntry, outcome: Result<ResultRef, CoreError>) {
        match outcome {
            Ok(result) => {
                if self.transition(entry, JobStatus::Succeeded, Some(result.clone()), None) {
                    tracing::info!(
                        job_id = %entry.id,
                        fingerprint = %entry.spec.fingerprint,
                        location = %result.location,
                        size_bytes = result.size_bytes,
                        "Job succeeded"
                    );
                } else {
                    // Cancelled while the result was being written.
                    self.discard(result).await;
                }
            }
            Err(CoreError::Cancelled) => {
                self.transition(entry, JobStatus::Cancelled, None, Some(CoreError::Cancelled));
            }
            Err(err) => {
                if self.transition(entry, JobStatus::Failed, None, Some(err.clone())) {
                    tracing::error!(
                        job_id = %entry.id,
                        fingerprint = %entry.spec.fingerprint,
                        error = %err,
                        "Job failed"
                    );
                }
            }
        }
    }

    async fn discard(&self, result: ResultRef) {
        let store = Arc::clone(&self.store);
        let location = result.location.clone();
        match tokio::task::spawn_blocking(move || store.remove(&result)).await {
            Ok(Ok(())) => tracing::debug!(location = %location, "Removed result"),
            Ok(Err(e)) => tracing::warn!(location = %location, error = %e, "Failed to remove result"),
            Err(e) => tracing::warn!(location = %location, error = %e, "Result removal task failed"),
        }
    }
}

async fn run_job(inner: Arc<QueueInner>, entry: Arc<JobEntry>) {
    let permit = tokio::select! {
        biased;
        _ = entry.cancel.cancelled() => return,
        permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                inner
                    .finish(&entry, Err(CoreError::Internal("worker pool closed".into())))
                    .await;
                return;
            }
        },
    };

    // Lost the race with a cancel issued while queued.
    if !inner.transition(&entry, JobStatus::Running, None, None) {
        return;
    }
    tracing::info!(
        job_id = %entry.id,
        fingerprint = %entry.spec.fingerprint,
        location = %entry.spec.location,
        "Job running"
    );

    let outcome = tokio::select! {
        _ = entry.cancel.cancelled() => Err(CoreError::Cancelled),
        outcome = inner.execute_with_retry(&entry) => outcome,
    };
    drop(permit);

    inner.finish(&entry, outcome).await;
}

/// A caller's view of a submitted job.
///
/// Dropping the handle detaches the caller without cancelling the job.
pub struct JobHandle {
    inner: Arc<QueueInner>,
    entry: Arc<JobEntry>,
    attached: bool,
}

impl JobHandle {
    fn new(inner: Arc<QueueInner>, entry: Arc<JobEntry>, attached: bool) -> Self {
        Self {
            inner,
            entry,
            attached,
        }
    }

    pub fn id(&self) -> JobId {
        self.entry.id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.entry.spec.fingerprint
    }

    /// True when the handle was served from a cached result.
    pub fn is_cached(&self) -> bool {
        !self.attached
    }

    pub fn status(&self) -> JobStatus {
        self.entry.state.borrow().status
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.entry.snapshot()
    }

    pub fn view(&self) -> JobStatusView {
        self.entry.view()
    }

    /// Wait until the job reaches a terminal state.
    pub async fn wait(&self) -> JobSnapshot {
        let mut rx = self.entry.state.subscribe();
        // Bound to a local so the watch guard is dropped before `rx`.
        let snapshot = match rx.wait_for(|state| state.status.is_terminal()).await {
            Ok(state) => state.clone(),
            Err(_) => self.entry.snapshot(),
        };
        snapshot
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. The job keeps
    /// running either way.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<JobSnapshot> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Cancel the job on behalf of this caller.
    ///
    /// Only takes effect when no other caller is attached; otherwise this
    /// caller just detaches and the job continues. Returns true if the job
    /// was cancelled.
    pub fn cancel(mut self) -> bool {
        if !std::mem::replace(&mut self.attached, false) {
            return false;
        }

        let _jobs = self.inner.lock_jobs();
        let remaining = self
            .entry
            .attached
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        if remaining > 0 {
            tracing::debug!(
                job_id = %self.entry.id,
                remaining,
                "Cancel ignored, other callers still attached"
            );
            return false;
        }

        let cancelled = self.inner.transition(
            &self.entry,
            JobStatus::Cancelled,
            None,
            Some(CoreError::Cancelled),
        );
        if cancelled {
            self.entry.cancel.cancel();
            tracing::info!(
                job_id = %self.entry.id,
                fingerprint = %self.entry.spec.fingerprint,
                "Job cancelled"
            );
        }
        cancelled
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if self.attached {
            self.entry.attached.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use imgserv_core::image::ImageLocation;
    use imgserv_core::region::Region;
    use imgserv_core::request::Target;

    use super::*;

    fn entry() -> JobEntry {
        let region = Region::circle(150.0, 2.2, 0.01).unwrap();
        JobEntry::new(JobSpec {
            fingerprint: imgserv_core::fingerprint::fingerprint("cosmos.calexp", "i", &region),
            dataset_id: "cosmos.calexp".into(),
            filter: "i".into(),
            location: ImageLocation::new("cosmos.fits"),
            target: Target::Cutout { region },
        })
    }

    fn complete(entry: &JobEntry, status: JobStatus, completed_at: Timestamp) {
        entry.state.send_modify(|state| {
            state.status = status;
            state.completed_at = Some(completed_at);
        });
    }

    // -- is_expired --

    #[test]
    fn active_jobs_never_expire() {
        let entry = entry();
        assert!(!entry.is_expired(Utc::now(), Duration::ZERO));
    }

    #[test]
    fn terminal_jobs_expire_after_retention() {
        let entry = entry();
        let done = Utc::now() - chrono::Duration::seconds(120);
        complete(&entry, JobStatus::Failed, done);

        assert!(entry.is_expired(Utc::now(), Duration::from_secs(60)));
        assert!(!entry.is_expired(Utc::now(), Duration::from_secs(600)));
    }

    // -- view --

    #[test]
    fn view_reports_error_kind() {
        let entry = entry();
        entry.state.send_modify(|state| {
            state.status = JobStatus::Failed;
            state.error = Some(CoreError::CorruptImage("bad block".into()));
        });

        let view = entry.view();
        assert_eq!(view.job_id, entry.id);
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(
            view.error_kind,
            Some(imgserv_core::error::ErrorKind::CorruptImage)
        );
        assert!(view.result_location.is_none());
    }
}
