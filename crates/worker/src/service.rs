//! Request-facing entry point: parse, look up, enqueue.
//!
//! Parsing and lookup failures are returned directly and never create a job.
//! Extraction never runs on the caller's task.

use std::collections::HashMap;
use std::sync::Arc;

use imgserv_core::error::CoreError;
use imgserv_core::fingerprint::Fingerprint;
use imgserv_core::lookup::MetadataLookup;
use imgserv_core::request::CutoutRequest;
use imgserv_core::scheduling::JobStatusView;

use crate::executor::JobSpec;
use crate::queue::{JobHandle, JobQueue};

pub struct CutoutService {
    lookup: Arc<dyn MetadataLookup>,
    queue: JobQueue,
    default_filter: String,
}

impl CutoutService {
    pub fn new(
        lookup: Arc<dyn MetadataLookup>,
        queue: JobQueue,
        default_filter: impl Into<String>,
    ) -> Self {
        Self {
            lookup,
            queue,
            default_filter: default_filter.into(),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Submit a cutout described by query parameters (`ID` plus either `POS`
    /// or the legacy `ra`/`dec`/`width`/`height`/`unit`/`filter` set). `ID`
    /// alone fetches the whole image.
    pub async fn submit(&self, params: &HashMap<String, String>) -> Result<JobHandle, CoreError> {
        let request = CutoutRequest::from_params(params, &self.default_filter)?;
        self.submit_request(&request).await
    }

    pub async fn submit_request(&self, request: &CutoutRequest) -> Result<JobHandle, CoreError> {
        let dataset_id = request.dataset_id();
        // Pixel-centred rectangles and full-image requests have no sky
        // position; any image of the dataset will do.
        let near = request.target.region().and_then(|r| r.sky_center());
        let location = self
            .lookup
            .resolve(&dataset_id, &request.filter, near)
            .await?;
        tracing::debug!(
            dataset_id = %dataset_id,
            filter = %request.filter,
            near = ?near,
            location = %location,
            "Resolved dataset"
        );
        Ok(self.queue.submit(JobSpec::from_request(request, location)))
    }

    pub fn status(&self, fingerprint: &Fingerprint) -> Option<JobStatusView> {
        self.queue.status(fingerprint)
    }
}

/// Split an `&`-separated `key=value` query into a parameter map. Values are
/// taken verbatim (no percent-decoding), so `POS=CIRCLE 1 2 3` works as-is.
/// Later duplicates win.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_are_split() {
        let params = parse_query("ID=ci_hsc.calexp.r&POS=CIRCLE 320.94 -0.289128 0.01");
        assert_eq!(params.len(), 2);
        assert_eq!(params["ID"], "ci_hsc.calexp.r");
        assert_eq!(params["POS"], "CIRCLE 320.94 -0.289128 0.01");
    }

    #[test]
    fn query_skips_pairs_without_key_or_equals() {
        let params = parse_query("ra=10&&junk&=5&dec=-3");
        assert_eq!(params.len(), 2);
        assert_eq!(params["dec"], "-3");
    }
}
