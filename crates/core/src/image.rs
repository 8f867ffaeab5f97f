//! Image storage access.
//!
//! An [`ImageSource`] turns an opaque [`ImageLocation`] into an open
//! [`ImageHandle`]. Handles list the image extensions of the file and read
//! pixels, either as a rectangular window or, for storage without range
//! reads, as the whole plane.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fitsio::FitsFile;
use serde::{Deserialize, Serialize};

use crate::bounds::PixelBounds;
use crate::error::CoreError;
use crate::fits::{image_hdus, read_rows, FitsHeader, ImageHdu, ImagePlane};
use crate::wcs::TanWcs;

/// Where a dataset's pixels live. Produced by metadata lookup and only ever
/// interpreted by an [`ImageSource`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageLocation {
    uri: String,
}

impl ImageLocation {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.uri
    }
}

impl fmt::Display for ImageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// A two-dimensional image HDU.
#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    /// Position of the HDU in the file; 0 is the primary HDU.
    pub hdu: usize,
    pub width: u64,
    pub height: u64,
    pub header: FitsHeader,
}

impl Extension {
    /// WCS for this extension, read fresh from its header.
    pub fn wcs(&self) -> Result<TanWcs, CoreError> {
        TanWcs::from_header(&self.header)
    }
}

pub trait ImageSource: Send + Sync {
    fn open(&self, location: &ImageLocation) -> Result<Box<dyn ImageHandle>, CoreError>;
}

pub trait ImageHandle {
    fn extensions(&self) -> &[Extension];

    /// Whether [`ImageHandle::read_window`] reads only the requested rows.
    fn supports_partial_reads(&self) -> bool {
        false
    }

    /// Whole pixel plane of extension `ext`, row-major.
    fn read_full(&mut self, ext: usize) -> Result<Vec<f32>, CoreError>;

    /// Pixels inside `bounds`, row-major. The default reads the full plane
    /// and slices it.
    fn read_window(&mut self, ext: usize, bounds: &PixelBounds) -> Result<Vec<f32>, CoreError> {
        let width = extension(self.extensions(), ext)?.width;
        let height = extension(self.extensions(), ext)?.height;
        check_window(bounds, width, height)?;
        let full = self.read_full(ext)?;
        Ok(slice_window(&full, width, bounds))
    }
}

fn extension(extensions: &[Extension], ext: usize) -> Result<&Extension, CoreError> {
    extensions
        .get(ext)
        .ok_or_else(|| CoreError::Internal(format!("no image extension {ext}")))
}

fn check_window(bounds: &PixelBounds, width: u64, height: u64) -> Result<(), CoreError> {
    if bounds.clip(width, height) != Some(*bounds) {
        return Err(CoreError::Internal(format!(
            "window {bounds:?} exceeds {width}x{height} image"
        )));
    }
    Ok(())
}

/// Copy the rows of `bounds` out of a full `width`-wide plane.
pub fn slice_window(full: &[f32], width: u64, bounds: &PixelBounds) -> Vec<f32> {
    slice_columns(full, width, bounds, 0)
}

/// Copy the columns of `bounds` out of a band of whole rows starting at
/// row `first_row`.
fn slice_columns(band: &[f32], width: u64, bounds: &PixelBounds, first_row: u64) -> Vec<f32> {
    let mut out = Vec::with_capacity(bounds.area() as usize);
    let (x0, x1) = (bounds.x_min() as usize, bounds.x_max() as usize);
    for y in bounds.y_min() as u64..bounds.y_max() as u64 {
        let row = ((y - first_row) * width) as usize;
        out.extend_from_slice(&band[row + x0..row + x1]);
    }
    out
}

/* --------------------------------------------------------------------------
Filesystem source
-------------------------------------------------------------------------- */

/// FITS files on a local or mounted filesystem. Relative locations are
/// resolved against `root`. Windows read only the rows they span.
#[derive(Debug, Clone)]
pub struct FitsFileSource {
    root: PathBuf,
}

impl FitsFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ImageSource for FitsFileSource {
    fn open(&self, location: &ImageLocation) -> Result<Box<dyn ImageHandle>, CoreError> {
        let path = self.root.join(location.as_str());
        // cfitsio reports a missing file and an unreadable one alike.
        std::fs::metadata(&path).map_err(|e| {
            CoreError::StorageUnavailable(format!("{}: {e}", path.display()))
        })?;
        let mut fptr = FitsFile::open(&path)?;
        let images = image_hdus(&mut fptr)?;
        tracing::debug!(
            path = %path.display(),
            extensions = images.len(),
            "Opened FITS file"
        );
        let extensions = images
            .iter()
            .map(|image| Extension {
                hdu: image.index,
                width: image.width,
                height: image.height,
                header: image.header.clone(),
            })
            .collect();
        Ok(Box::new(FitsFileHandle {
            fptr,
            images,
            extensions,
        }))
    }
}

struct FitsFileHandle {
    fptr: FitsFile,
    images: Vec<ImageHdu>,
    extensions: Vec<Extension>,
}

impl ImageHandle for FitsFileHandle {
    fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    fn supports_partial_reads(&self) -> bool {
        true
    }

    fn read_full(&mut self, ext: usize) -> Result<Vec<f32>, CoreError> {
        let Self { fptr, images, .. } = self;
        let image = images
            .get(ext)
            .ok_or_else(|| CoreError::Internal(format!("no image extension {ext}")))?;
        read_rows(fptr, image, 0, image.height)
    }

    fn read_window(&mut self, ext: usize, bounds: &PixelBounds) -> Result<Vec<f32>, CoreError> {
        let Self { fptr, images, .. } = self;
        let image = images
            .get(ext)
            .ok_or_else(|| CoreError::Internal(format!("no image extension {ext}")))?;
        check_window(bounds, image.width, image.height)?;
        let (y0, y1) = (bounds.y_min() as u64, bounds.y_max() as u64);
        let band = read_rows(fptr, image, y0, y1)?;
        Ok(slice_columns(&band, image.width, bounds, y0))
    }
}

/* --------------------------------------------------------------------------
In-memory source
-------------------------------------------------------------------------- */

/// Decoded image planes held in memory, keyed by location. Stands in for
/// object stores without range reads: every window is served from the full
/// plane.
#[derive(Debug, Clone, Default)]
pub struct MemoryImageSource {
    images: HashMap<String, Vec<(usize, Arc<ImagePlane>)>>,
}

impl MemoryImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `plane` as the primary HDU of a single-image file.
    pub fn with_image(self, uri: impl Into<String>, plane: ImagePlane) -> Self {
        self.with_extension(uri, 0, plane)
    }

    /// Add `plane` as HDU `hdu` of the file at `uri`.
    pub fn with_extension(mut self, uri: impl Into<String>, hdu: usize, plane: ImagePlane) -> Self {
        let planes = self.images.entry(uri.into()).or_default();
        planes.push((hdu, Arc::new(plane)));
        planes.sort_by_key(|(hdu, _)| *hdu);
        self
    }
}

impl ImageSource for MemoryImageSource {
    fn open(&self, location: &ImageLocation) -> Result<Box<dyn ImageHandle>, CoreError> {
        let planes = self.images.get(location.as_str()).cloned().ok_or_else(|| {
            CoreError::StorageUnavailable(format!("no in-memory image at {location}"))
        })?;
        let mut extensions = Vec::with_capacity(planes.len());
        for (hdu, plane) in &planes {
            if plane.width.checked_mul(plane.height) != Some(plane.pixels.len()) {
                return Err(CoreError::CorruptImage(format!(
                    "HDU {hdu} of {location} holds {} pixels for {}x{}",
                    plane.pixels.len(),
                    plane.width,
                    plane.height
                )));
            }
            extensions.push(Extension {
                hdu: *hdu,
                width: plane.width as u64,
                height: plane.height as u64,
                header: plane.header.clone(),
            });
        }
        Ok(Box::new(MemoryImageHandle { planes, extensions }))
    }
}

struct MemoryImageHandle {
    planes: Vec<(usize, Arc<ImagePlane>)>,
    extensions: Vec<Extension>,
}

impl ImageHandle for MemoryImageHandle {
    fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    fn read_full(&mut self, ext: usize) -> Result<Vec<f32>, CoreError> {
        self.planes
            .get(ext)
            .map(|(_, plane)| plane.pixels.clone())
            .ok_or_else(|| CoreError::Internal(format!("no image extension {ext}")))
    }
}
