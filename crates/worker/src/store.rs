//! Where finished cutouts are written.

use std::path::{Path, PathBuf};

use imgserv_core::cutout::CutoutImage;
use imgserv_core::error::CoreError;
use imgserv_core::fingerprint::Fingerprint;
use imgserv_core::types::JobId;
use serde::Serialize;

/// Location and size of a stored cutout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRef {
    pub location: String,
    pub size_bytes: u64,
}

/// Blocking result storage. Called from `spawn_blocking` contexts.
pub trait ResultStore: Send + Sync {
    /// Store the output of job `job_id`. Two jobs never share a location,
    /// even for the same fingerprint.
    fn put(
        &self,
        fingerprint: &Fingerprint,
        job_id: JobId,
        image: &CutoutImage,
    ) -> Result<ResultRef, CoreError>;

    /// Delete a stored result. Removing one that is already gone succeeds.
    fn remove(&self, result: &ResultRef) -> Result<(), CoreError>;
}

/// Writes each cutout to `<dir>/img-<fingerprint>-<job id>.fits`.
///
/// The file is written under a `.part` name first and renamed into place, so
/// a reader never observes a half-written cutout.
#[derive(Debug, Clone)]
pub struct FsResultStore {
    dir: PathBuf,
}

impl FsResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, fingerprint: &Fingerprint, job_id: JobId) -> PathBuf {
        self.dir.join(format!("img-{fingerprint}-{job_id}.fits"))
    }
}

impl ResultStore for FsResultStore {
    fn put(
        &self,
        fingerprint: &Fingerprint,
        job_id: JobId,
        image: &CutoutImage,
    ) -> Result<ResultRef, CoreError> {
        let path = self.path_for(fingerprint, job_id);
        let partial = path.with_extension("fits.part");
        // cfitsio refuses to create over an existing file.
        match std::fs::remove_file(&partial) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        if let Err(e) = image.write_fits(&partial) {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        std::fs::rename(&partial, &path)?;
        let size_bytes = std::fs::metadata(&path)?.len();

        tracing::debug!(path = %path.display(), size_bytes, "Stored cutout");
        Ok(ResultRef {
            location: path.to_string_lossy().into_owned(),
            size_bytes,
        })
    }

    fn remove(&self, result: &ResultRef) -> Result<(), CoreError> {
        match std::fs::remove_file(&result.location) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use imgserv_core::bounds::PixelBounds;
    use imgserv_core::fingerprint::fingerprint;
    use imgserv_core::fits::FitsHeader;
    use imgserv_core::image::{FitsFileSource, ImageLocation, ImageSource};
    use imgserv_core::region::Region;

    use super::*;

    fn tiny_cutout() -> CutoutImage {
        CutoutImage {
            width: 2,
            height: 2,
            pixels: vec![1.0, 2.0, 3.0, 4.0],
            header: FitsHeader::new(),
            bounds: PixelBounds::new(0, 2, 0, 2).unwrap(),
            source_hdu: 0,
        }
    }

    fn fp() -> Fingerprint {
        fingerprint("sdss.raw", "g", &Region::bbox(10.0, 5.0, 0.1, 0.1).unwrap())
    }

    #[test]
    fn put_writes_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path().join("results")).unwrap();
        let job = JobId::now_v7();

        let result = store.put(&fp(), job, &tiny_cutout()).unwrap();

        let expected = store.path_for(&fp(), job);
        assert_eq!(result.location, expected.to_string_lossy());
        assert!(expected.exists());
        assert!(!expected.with_extension("fits.part").exists());
        assert_eq!(result.size_bytes, std::fs::metadata(&expected).unwrap().len());

        let mut handle = FitsFileSource::new(store.dir())
            .open(&ImageLocation::new(expected.file_name().unwrap().to_string_lossy()))
            .unwrap();
        assert_eq!(handle.read_full(0).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn jobs_with_one_fingerprint_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path()).unwrap();
        let old = store.put(&fp(), JobId::now_v7(), &tiny_cutout()).unwrap();
        let new = store.put(&fp(), JobId::now_v7(), &tiny_cutout()).unwrap();
        assert_ne!(old.location, new.location);

        store.remove(&old).unwrap();
        assert!(std::path::Path::new(&new.location).exists());
    }

    #[test]
    fn leftover_partial_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path()).unwrap();
        let job = JobId::now_v7();
        let partial = store.path_for(&fp(), job).with_extension("fits.part");
        std::fs::write(&partial, b"interrupted").unwrap();

        store.put(&fp(), job, &tiny_cutout()).unwrap();
        assert!(!partial.exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path()).unwrap();
        let job = JobId::now_v7();
        let result = store.put(&fp(), job, &tiny_cutout()).unwrap();

        store.remove(&result).unwrap();
        assert!(!store.path_for(&fp(), job).exists());
        store.remove(&result).unwrap();
    }
}
