//! Metadata lookup over the FITS catalog tables.

use async_trait::async_trait;
use imgserv_core::error::CoreError;
use imgserv_core::image::ImageLocation;
use imgserv_core::lookup::MetadataLookup;
use imgserv_core::region::SkyPoint;

use crate::repositories::FitsFileRepo;
use crate::DbPool;

/// Resolves datasets to the file names recorded in `fits_files`. The file
/// name is used verbatim as the image location.
#[derive(Clone)]
pub struct PgMetadataLookup {
    pool: DbPool,
}

impl PgMetadataLookup {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetadataLookup for PgMetadataLookup {
    async fn resolve(
        &self,
        dataset_id: &str,
        filter: &str,
        near: Option<SkyPoint>,
    ) -> Result<ImageLocation, CoreError> {
        let file_name = match near {
            Some(p) => FitsFileRepo::find_nearest(&self.pool, dataset_id, filter, p.ra, p.dec)
                .await
                .map_err(storage_error)?
                .map(|n| {
                    tracing::debug!(
                        file = %n.file_name,
                        hdu = n.hdu,
                        distance = n.distance,
                        "Nearest catalogued image"
                    );
                    n.file_name
                }),
            None => FitsFileRepo::find_for_dataset(&self.pool, dataset_id, filter)
                .await
                .map_err(storage_error)?
                .map(|f| f.file_name),
        };
        file_name
            .map(ImageLocation::new)
            .ok_or_else(|| CoreError::DatasetNotFound {
                dataset_id: dataset_id.to_string(),
                filter: filter.to_string(),
            })
    }
}

fn storage_error(err: sqlx::Error) -> CoreError {
    tracing::warn!(error = %err, "Metadata query failed");
    CoreError::StorageUnavailable(format!("metadata store: {err}"))
}
