//! Job queue scenarios: deduplication, caching, retries, cancellation and
//! backpressure, driven by a scripted executor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use imgserv_core::bounds::PixelBounds;
use imgserv_core::cutout::CutoutImage;
use imgserv_core::error::{CoreError, ErrorKind};
use imgserv_core::fingerprint::fingerprint;
use imgserv_core::fits::FitsHeader;
use imgserv_core::image::ImageLocation;
use imgserv_core::region::Region;
use imgserv_core::request::Target;
use imgserv_core::scheduling::JobStatus;
use imgserv_core::types::JobId;
use imgserv_worker::events::{JOB_COMPLETED, JOB_QUEUED, JOB_RUNNING};
use imgserv_worker::{
    CutoutExecutor, EventBus, FsResultStore, JobHandle, JobQueue, JobSpec, QueueConfig, ResultRef,
    ResultStore,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedExecutor {
    /// When set, every execution waits for one permit before finishing.
    gate: Option<Arc<Semaphore>>,
    /// Errors returned by successive calls before the first success.
    failures: Mutex<VecDeque<CoreError>>,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    started: Mutex<Vec<String>>,
    /// When set, successful calls write a real file here.
    store: Option<Arc<FsResultStore>>,
}

impl ScriptedExecutor {
    fn gated(gate: &Arc<Semaphore>) -> Self {
        Self {
            gate: Some(Arc::clone(gate)),
            ..Self::default()
        }
    }

    fn failing(errors: Vec<CoreError>) -> Self {
        Self {
            failures: Mutex::new(errors.into()),
            ..Self::default()
        }
    }

    fn storing(store: &Arc<FsResultStore>) -> Self {
        Self {
            store: Some(Arc::clone(store)),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl CutoutExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        job_id: JobId,
        spec: &JobSpec,
        _cancel: &CancellationToken,
    ) -> Result<ResultRef, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(spec.filter.clone());
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(store) = &self.store {
            return store.put(&spec.fingerprint, job_id, &one_pixel());
        }
        Ok(ResultRef {
            location: format!("img-{}-{job_id}.fits", spec.fingerprint),
            size_bytes: 5760,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    queue: JobQueue,
    executor: Arc<ScriptedExecutor>,
    _results: tempfile::TempDir,
}

fn harness(executor: ScriptedExecutor, config: QueueConfig) -> Harness {
    let results = tempfile::tempdir().unwrap();
    let store = Arc::new(FsResultStore::new(results.path()).unwrap());
    build(executor, store, results, config)
}

/// Harness whose executor writes real result files through the queue's store.
fn storing_harness(config: QueueConfig) -> Harness {
    let results = tempfile::tempdir().unwrap();
    let store = Arc::new(FsResultStore::new(results.path()).unwrap());
    build(ScriptedExecutor::storing(&store), store, results, config)
}

fn build(
    executor: ScriptedExecutor,
    store: Arc<FsResultStore>,
    results: tempfile::TempDir,
    config: QueueConfig,
) -> Harness {
    let executor = Arc::new(executor);
    let queue = JobQueue::new(
        executor.clone(),
        store,
        Arc::new(EventBus::default()),
        config,
    );
    Harness {
        queue,
        executor,
        _results: results,
    }
}

fn one_pixel() -> CutoutImage {
    CutoutImage {
        width: 1,
        height: 1,
        pixels: vec![7.0],
        header: FitsHeader::new(),
        bounds: PixelBounds::new(0, 1, 0, 1).unwrap(),
        source_hdu: 0,
    }
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        retry_backoff: Duration::from_millis(1),
        ..QueueConfig::default()
    }
}

fn spec(filter: &str) -> JobSpec {
    let region = Region::circle(320.94, -0.289128, 0.01).unwrap();
    JobSpec {
        fingerprint: fingerprint("ci_hsc.calexp", filter, &region),
        dataset_id: "ci_hsc.calexp".into(),
        filter: filter.into(),
        location: ImageLocation::new(format!("calexp-{filter}.fits")),
        target: Target::Cutout { region },
    }
}

async fn until_status(handle: &JobHandle, status: JobStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.status() != status {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job never reached {status:?}"));
}

// ---------------------------------------------------------------------------
// Deduplication and caching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_duplicates_share_one_execution() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(ScriptedExecutor::gated(&gate), fast_config());

    let first = h.queue.submit(spec("r"));
    let second = h.queue.submit(spec("r"));
    assert_eq!(first.id(), second.id());
    assert!(!second.is_cached());

    until_status(&first, JobStatus::Running).await;
    gate.add_permits(1);
    let (a, b) = futures::future::join(first.wait(), second.wait()).await;

    assert_eq!(a.status, JobStatus::Succeeded);
    assert_eq!(a, b);
    assert_eq!(h.executor.calls(), 1);
    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn succeeded_job_is_served_from_cache() {
    let h = harness(ScriptedExecutor::default(), fast_config());

    let first = h.queue.submit(spec("r"));
    let done = first.wait().await;

    let again = h.queue.submit(spec("r"));
    assert!(again.is_cached());
    assert_eq!(again.id(), first.id());
    assert_eq!(again.snapshot(), done);
    assert_eq!(h.executor.calls(), 1);
}

#[tokio::test]
async fn expired_success_runs_again() {
    let config = QueueConfig {
        retention: Duration::ZERO,
        ..fast_config()
    };
    let h = harness(ScriptedExecutor::default(), config);

    let first = h.queue.submit(spec("r"));
    first.wait().await;
    let again = h.queue.submit(spec("r"));
    assert!(!again.is_cached());
    assert_ne!(again.id(), first.id());

    assert_eq!(again.wait().await.status, JobStatus::Succeeded);
    assert_eq!(h.executor.calls(), 2);
}

#[tokio::test]
async fn rerun_writes_its_own_result_file() {
    let config = QueueConfig {
        retention: Duration::ZERO,
        ..fast_config()
    };
    let h = storing_harness(config);

    let first = h.queue.submit(spec("r")).wait().await.result.unwrap();
    let again = h.queue.submit(spec("r"));
    let second = again.wait().await.result.unwrap();

    assert_ne!(first.location, second.location);
    assert!(second.location.contains(&again.id().to_string()));
    assert!(std::path::Path::new(&second.location).exists());
    assert!(!std::path::Path::new(&first.location).exists());
}

#[tokio::test]
async fn different_fingerprints_run_separately() {
    let h = harness(ScriptedExecutor::default(), fast_config());

    let r = h.queue.submit(spec("r"));
    let g = h.queue.submit(spec("g"));
    assert_ne!(r.id(), g.id());
    assert_ne!(r.fingerprint(), g.fingerprint());

    r.wait().await;
    g.wait().await;
    assert_eq!(h.executor.calls(), 2);
}

// ---------------------------------------------------------------------------
// Failures and retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failure_is_reported_and_not_cached() {
    let h = harness(
        ScriptedExecutor::failing(vec![CoreError::CorruptImage("bad data unit".into())]),
        fast_config(),
    );

    let first = h.queue.submit(spec("r"));
    let failed = first.wait().await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_matches!(failed.error, Some(CoreError::CorruptImage(_)));
    assert_eq!(first.view().error_kind, Some(ErrorKind::CorruptImage));
    assert!(first.view().result_location.is_none());

    let retry = h.queue.submit(spec("r"));
    assert_ne!(retry.id(), first.id());
    assert_eq!(retry.wait().await.status, JobStatus::Succeeded);
    assert_eq!(h.executor.calls(), 2);
}

#[tokio::test]
async fn storage_errors_are_retried() {
    let h = harness(
        ScriptedExecutor::failing(vec![
            CoreError::StorageUnavailable("nfs timeout".into()),
            CoreError::StorageUnavailable("nfs timeout".into()),
        ]),
        fast_config(),
    );

    let handle = h.queue.submit(spec("r"));
    let done = handle.wait().await;
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(h.executor.calls(), 3);
}

#[tokio::test]
async fn retries_are_bounded() {
    let config = QueueConfig {
        max_retries: 1,
        ..fast_config()
    };
    let h = harness(
        ScriptedExecutor::failing(vec![
            CoreError::StorageUnavailable("down".into()),
            CoreError::StorageUnavailable("still down".into()),
            CoreError::StorageUnavailable("never reached".into()),
        ]),
        config,
    );

    let done = h.queue.submit(spec("r")).wait().await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_matches!(done.error, Some(CoreError::StorageUnavailable(msg)) if msg == "still down");
    assert_eq!(h.executor.calls(), 2);
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let h = harness(
        ScriptedExecutor::failing(vec![CoreError::RegionNotCovered("outside".into())]),
        fast_config(),
    );

    let done = h.queue.submit(spec("r")).wait().await;
    assert_matches!(done.error, Some(CoreError::RegionNotCovered(_)));
    assert_eq!(h.executor.calls(), 1);
}

// ---------------------------------------------------------------------------
// Cancellation and timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sole_caller_cancel_stops_running_job() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(ScriptedExecutor::gated(&gate), fast_config());

    let handle = h.queue.submit(spec("r"));
    let fp = handle.fingerprint().clone();
    until_status(&handle, JobStatus::Running).await;

    assert!(handle.cancel());
    let view = h.queue.status(&fp).unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);
    assert_eq!(view.error_kind, Some(ErrorKind::Cancelled));

    // The freed worker slot accepts new work.
    gate.add_permits(1);
    let next = h.queue.submit(spec("g"));
    assert_eq!(next.wait().await.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn cancel_with_other_callers_attached_is_a_no_op() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(ScriptedExecutor::gated(&gate), fast_config());

    let first = h.queue.submit(spec("r"));
    let second = h.queue.submit(spec("r"));
    until_status(&first, JobStatus::Running).await;

    assert!(!first.cancel());
    assert_eq!(second.status(), JobStatus::Running);

    gate.add_permits(1);
    assert_eq!(second.wait().await.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn dropped_handles_do_not_block_cancel() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(ScriptedExecutor::gated(&gate), fast_config());

    let first = h.queue.submit(spec("r"));
    let second = h.queue.submit(spec("r"));
    drop(first);

    assert!(second.cancel());
}

#[tokio::test]
async fn cancelled_job_is_replaced_on_resubmit() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(ScriptedExecutor::gated(&gate), fast_config());

    let handle = h.queue.submit(spec("r"));
    let cancelled_id = handle.id();
    assert!(handle.cancel());

    gate.add_permits(1);
    let again = h.queue.submit(spec("r"));
    assert_ne!(again.id(), cancelled_id);
    assert_eq!(again.wait().await.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn cancelled_queued_job_never_executes() {
    let gate = Arc::new(Semaphore::new(0));
    let config = QueueConfig {
        max_concurrent: 1,
        ..fast_config()
    };
    let h = harness(ScriptedExecutor::gated(&gate), config);

    let running = h.queue.submit(spec("g"));
    until_status(&running, JobStatus::Running).await;
    let queued = h.queue.submit(spec("r"));
    assert_eq!(queued.status(), JobStatus::Queued);
    let queued_fp = queued.fingerprint().clone();

    assert!(queued.cancel());
    gate.add_permits(2);
    running.wait().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.executor.started(), vec!["g".to_string()]);
    assert_eq!(
        h.queue.status(&queued_fp).map(|v| v.status),
        Some(JobStatus::Cancelled)
    );
}

#[tokio::test]
async fn wait_timeout_leaves_job_running() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(ScriptedExecutor::gated(&gate), fast_config());

    let handle = h.queue.submit(spec("r"));
    until_status(&handle, JobStatus::Running).await;
    assert!(handle
        .wait_timeout(Duration::from_millis(20))
        .await
        .is_none());
    assert_eq!(handle.status(), JobStatus::Running);

    gate.add_permits(1);
    let done = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn excess_jobs_queue_in_submission_order() {
    let gate = Arc::new(Semaphore::new(0));
    let config = QueueConfig {
        max_concurrent: 1,
        ..fast_config()
    };
    let h = harness(ScriptedExecutor::gated(&gate), config);

    let first = h.queue.submit(spec("g"));
    until_status(&first, JobStatus::Running).await;
    let rest: Vec<JobHandle> = ["r", "i", "z"]
        .into_iter()
        .map(|f| h.queue.submit(spec(f)))
        .collect();
    assert!(rest.iter().all(|r| r.status() == JobStatus::Queued));

    gate.add_permits(4);
    first.wait().await;
    for handle in &rest {
        assert_eq!(handle.wait().await.status, JobStatus::Succeeded);
    }

    assert_eq!(h.executor.started(), vec!["g", "r", "i", "z"]);
    assert_eq!(h.executor.max_running.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Retention and events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweep_evicts_only_expired_terminal_jobs() {
    let gate = Arc::new(Semaphore::new(1));
    let config = QueueConfig {
        retention: Duration::ZERO,
        ..fast_config()
    };
    let h = harness(ScriptedExecutor::gated(&gate), config);

    h.queue.submit(spec("r")).wait().await;
    let active = h.queue.submit(spec("g"));
    until_status(&active, JobStatus::Running).await;
    assert_eq!(h.queue.len(), 2);

    assert_eq!(h.queue.sweep_expired().await, 1);
    assert_eq!(h.queue.len(), 1);
    assert!(h.queue.status(active.fingerprint()).is_some());

    gate.add_permits(1);
    active.wait().await;
    assert!(h.queue.evict(active.fingerprint()).await);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn transitions_are_published_in_order() {
    let h = harness(ScriptedExecutor::default(), fast_config());
    let mut events = h.queue.subscribe();

    let handle = h.queue.submit(spec("r"));
    handle.wait().await;

    let mut seen = Vec::new();
    for _ in 0..3 {
        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id, handle.id());
        seen.push(event.event_type);
    }
    assert_eq!(seen, vec![JOB_QUEUED, JOB_RUNNING, JOB_COMPLETED]);
}
