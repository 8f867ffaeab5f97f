//! Job execution: turn a queued job into a stored cutout.

use std::sync::Arc;

use async_trait::async_trait;
use imgserv_core::cutout::{cutout, full_image};
use imgserv_core::error::CoreError;
use imgserv_core::fingerprint::Fingerprint;
use imgserv_core::image::{ImageLocation, ImageSource};
use imgserv_core::request::{CutoutRequest, Target};
use imgserv_core::types::JobId;
use tokio_util::sync::CancellationToken;

use crate::store::{ResultRef, ResultStore};

/// Everything a worker needs to run one cutout. Lookup has already happened.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub fingerprint: Fingerprint,
    pub dataset_id: String,
    pub filter: String,
    pub location: ImageLocation,
    pub target: Target,
}

impl JobSpec {
    pub fn from_request(request: &CutoutRequest, location: ImageLocation) -> Self {
        Self {
            fingerprint: request.fingerprint(),
            dataset_id: request.dataset_id(),
            filter: request.filter.clone(),
            location,
            target: request.target.clone(),
        }
    }
}

/// Runs a single attempt of a job. Retries are the queue's business.
///
/// `job_id` names the job instance; results must not be shared between two
/// jobs with the same fingerprint.
#[async_trait]
pub trait CutoutExecutor: Send + Sync {
    async fn execute(
        &self,
        job_id: JobId,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> Result<ResultRef, CoreError>;
}

/// Resolves bounds, extracts from image storage and writes the result.
pub struct ExtractingExecutor {
    source: Arc<dyn ImageSource>,
    store: Arc<dyn ResultStore>,
}

impl ExtractingExecutor {
    pub fn new(source: Arc<dyn ImageSource>, store: Arc<dyn ResultStore>) -> Self {
        Self { source, store }
    }
}

#[async_trait]
impl CutoutExecutor for ExtractingExecutor {
    async fn execute(
        &self,
        job_id: JobId,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> Result<ResultRef, CoreError> {
        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);
        let spec = spec.clone();
        let cancel = cancel.clone();

        // Reading and writing FITS is blocking file I/O.
        tokio::task::spawn_blocking(move || {
            let image = match &spec.target {
                Target::Cutout { region } => cutout(source.as_ref(), &spec.location, region)?,
                Target::FullImage => full_image(source.as_ref(), &spec.location)?,
            };
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            store.put(&spec.fingerprint, job_id, &image)
        })
        .await
        .map_err(|e| CoreError::Internal(format!("extraction task failed: {e}")))?
    }
}
