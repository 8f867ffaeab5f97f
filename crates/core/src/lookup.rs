//! Metadata lookup boundary: dataset identifier, filter and an optional sky
//! position to image location.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::image::ImageLocation;
use crate::region::SkyPoint;

#[async_trait]
pub trait MetadataLookup: Send + Sync {
    /// Image of `dataset_id` in `filter`. With `near`, the image whose
    /// centre is closest to that position wins; without it, any matching
    /// image may be returned.
    ///
    /// Fails with [`CoreError::DatasetNotFound`] when nothing matches.
    async fn resolve(
        &self,
        dataset_id: &str,
        filter: &str,
        near: Option<SkyPoint>,
    ) -> Result<ImageLocation, CoreError>;
}

/// Fixed table of locations, keyed case-insensitively. Used by tests and
/// single-image deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    entries: HashMap<(String, String), Vec<(Option<SkyPoint>, ImageLocation)>>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, dataset_id: &str, filter: &str, location: ImageLocation) -> Self {
        self.insert(dataset_id, filter, None, location)
    }

    /// Add an image centred on `center`.
    pub fn with_at(
        self,
        dataset_id: &str,
        filter: &str,
        center: SkyPoint,
        location: ImageLocation,
    ) -> Self {
        self.insert(dataset_id, filter, Some(center), location)
    }

    fn insert(
        mut self,
        dataset_id: &str,
        filter: &str,
        center: Option<SkyPoint>,
        location: ImageLocation,
    ) -> Self {
        self.entries
            .entry(key(dataset_id, filter))
            .or_default()
            .push((center, location));
        self
    }
}

fn key(dataset_id: &str, filter: &str) -> (String, String) {
    (dataset_id.to_ascii_lowercase(), filter.to_ascii_lowercase())
}

#[async_trait]
impl MetadataLookup for StaticLookup {
    async fn resolve(
        &self,
        dataset_id: &str,
        filter: &str,
        near: Option<SkyPoint>,
    ) -> Result<ImageLocation, CoreError> {
        let not_found = || CoreError::DatasetNotFound {
            dataset_id: dataset_id.to_string(),
            filter: filter.to_string(),
        };
        let candidates = self.entries.get(&key(dataset_id, filter)).ok_or_else(not_found)?;

        let nearest = near.and_then(|target| {
            candidates
                .iter()
                .filter_map(|(center, location)| {
                    center.map(|c| (c.separation(&target), location))
                })
                .min_by(|a, b| a.0.total_cmp(&b.0))
                .map(|(_, location)| location)
        });
        nearest
            .or_else(|| candidates.first().map(|(_, location)| location))
            .cloned()
            .ok_or_else(not_found)
    }
}
