//! Cutout extraction.
//!
//! Reads the pixels inside a [`PixelBounds`] window from one image extension
//! and produces a [`CutoutImage`] whose header describes the window on its
//! own: the WCS reference pixel is shifted by the window origin and the
//! offset is recorded in `LTV1`/`LTV2`.

use std::path::Path;

use crate::bounds::{resolve, PixelBounds, ResolvedBounds};
use crate::error::CoreError;
use crate::fits::{write_image, FitsHeader, HeaderValue, STRUCTURAL_KEYWORDS};
use crate::image::{Extension, ImageHandle, ImageLocation, ImageSource};
use crate::region::Region;
use crate::wcs::TanWcs;

#[derive(Debug, Clone, PartialEq)]
pub struct CutoutImage {
    pub width: u64,
    pub height: u64,
    /// Row-major physical pixel values.
    pub pixels: Vec<f32>,
    /// Non-structural header cards with WCS and provenance adjusted.
    pub header: FitsHeader,
    /// Window in the source extension's pixel grid.
    pub bounds: PixelBounds,
    pub source_hdu: usize,
}

impl CutoutImage {
    pub fn wcs(&self) -> Result<TanWcs, CoreError> {
        TanWcs::from_header(&self.header)
    }

    /// Write the cutout as a new single-HDU FITS file at `path`.
    pub fn write_fits(&self, path: &Path) -> Result<(), CoreError> {
        write_image(
            path,
            &self.header,
            self.width as usize,
            self.height as usize,
            &self.pixels,
        )
    }
}

/// Extract `bounds` from extension `ext` of the image at `location`.
pub fn extract(
    source: &dyn ImageSource,
    location: &ImageLocation,
    ext: usize,
    bounds: &PixelBounds,
) -> Result<CutoutImage, CoreError> {
    let mut handle = source.open(location)?;
    extract_window(handle.as_mut(), ext, bounds)
}

/// Resolve `region` against every extension of the image at `location` and
/// cut it out of the best-covering one.
pub fn cutout(
    source: &dyn ImageSource,
    location: &ImageLocation,
    region: &Region,
) -> Result<CutoutImage, CoreError> {
    let mut handle = source.open(location)?;
    let (ext, bounds) = select_extension(handle.extensions(), region)?;
    tracing::debug!(
        location = %location,
        region = %region,
        ext,
        x_min = bounds.x_min(),
        x_max = bounds.x_max(),
        y_min = bounds.y_min(),
        y_max = bounds.y_max(),
        "Resolved cutout bounds"
    );
    extract_window(handle.as_mut(), ext, &bounds)
}

/// The whole first image extension at `location`, header included. The
/// window starts at the origin, so `CRPIX` is unchanged and `LTV1`/`LTV2`
/// keep their source values.
pub fn full_image(
    source: &dyn ImageSource,
    location: &ImageLocation,
) -> Result<CutoutImage, CoreError> {
    let mut handle = source.open(location)?;
    let first = handle
        .extensions()
        .first()
        .ok_or_else(|| CoreError::CorruptImage(format!("{location} has no image extension")))?;
    let whole = PixelBounds::new(
        0,
        i64::try_from(first.width).unwrap_or(i64::MAX),
        0,
        i64::try_from(first.height).unwrap_or(i64::MAX),
    )
    .ok_or_else(|| CoreError::CorruptImage(format!("{location} has an empty image")))?;
    tracing::debug!(location = %location, hdu = first.hdu, "Reading full image");
    extract_window(handle.as_mut(), 0, &whole)
}

/// Pick the extension whose footprint holds the largest part of `region`.
/// Ties go to the lowest index.
pub fn select_extension(
    extensions: &[Extension],
    region: &Region,
) -> Result<(usize, PixelBounds), CoreError> {
    let mut best: Option<(usize, PixelBounds)> = None;
    let mut wcs_error = None;
    let mut usable = 0;

    for (index, ext) in extensions.iter().enumerate() {
        let wcs = match ext.wcs() {
            Ok(wcs) => wcs,
            Err(err) => {
                tracing::debug!(hdu = ext.hdu, error = %err, "Skipping extension without usable WCS");
                wcs_error.get_or_insert(err);
                continue;
            }
        };
        usable += 1;
        if let ResolvedBounds::Within(bounds) = resolve(region, &wcs, ext.width, ext.height) {
            if best.map_or(true, |(_, b)| bounds.area() > b.area()) {
                best = Some((index, bounds));
            }
        }
    }

    if let Some(found) = best {
        return Ok(found);
    }
    match wcs_error {
        // No extension could be projected at all: a broken file, not a miss.
        Some(err) if usable == 0 => Err(err),
        _ => Err(CoreError::RegionNotCovered(format!(
            "{region} is outside all {} image extension(s)",
            extensions.len()
        ))),
    }
}

/// Read `bounds` from extension `ext` of an open image.
pub fn extract_window(
    handle: &mut dyn ImageHandle,
    ext: usize,
    bounds: &PixelBounds,
) -> Result<CutoutImage, CoreError> {
    let extension = handle
        .extensions()
        .get(ext)
        .cloned()
        .ok_or_else(|| CoreError::Internal(format!("no image extension {ext}")))?;

    if bounds.clip(extension.width, extension.height) != Some(*bounds) {
        return Err(CoreError::RegionNotCovered(format!(
            "window {}..{} x {}..{} is not inside the {}x{} image",
            bounds.x_min(),
            bounds.x_max(),
            bounds.y_min(),
            bounds.y_max(),
            extension.width,
            extension.height
        )));
    }

    if !handle.supports_partial_reads() {
        tracing::warn!(
            hdu = extension.hdu,
            width = extension.width,
            height = extension.height,
            "Storage has no range reads, decoding the full plane"
        );
    }
    let pixels = handle.read_window(ext, bounds)?;
    if pixels.len() as u64 != bounds.area() {
        return Err(CoreError::CorruptImage(format!(
            "read {} pixels for a {}-pixel window",
            pixels.len(),
            bounds.area()
        )));
    }

    Ok(CutoutImage {
        width: bounds.width(),
        height: bounds.height(),
        pixels,
        header: shifted_header(&extension.header, bounds),
        bounds: *bounds,
        source_hdu: extension.hdu,
    })
}

fn shifted_header(source: &FitsHeader, bounds: &PixelBounds) -> FitsHeader {
    let mut header = source.clone();
    for keyword in STRUCTURAL_KEYWORDS {
        header.remove(keyword);
    }

    let dx = bounds.x_min() as f64;
    let dy = bounds.y_min() as f64;
    if let Some(crpix1) = header.get_f64("CRPIX1") {
        header.set("CRPIX1", HeaderValue::Real(crpix1 - dx));
    }
    if let Some(crpix2) = header.get_f64("CRPIX2") {
        header.set("CRPIX2", HeaderValue::Real(crpix2 - dy));
    }
    let ltv1 = header.get_f64("LTV1").unwrap_or(0.0);
    let ltv2 = header.get_f64("LTV2").unwrap_or(0.0);
    header.set("LTV1", HeaderValue::Real(ltv1 - dx));
    header.set("LTV2", HeaderValue::Real(ltv2 - dy));
    header
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::fits::Card;
    use crate::image::tests::ramp_plane;
    use crate::image::{FitsFileSource, MemoryImageSource};

    fn source() -> MemoryImageSource {
        MemoryImageSource::new().with_extension("mem://mef", 1, ramp_plane(8, 4))
    }

    // -- extract --

    #[test]
    fn extract_reads_window_and_strips_structure() {
        let bounds = PixelBounds::new(2, 5, 1, 3).unwrap();
        let cut = extract(&source(), &ImageLocation::new("mem://mef"), 0, &bounds).unwrap();
        assert_eq!((cut.width, cut.height), (3, 2));
        assert_eq!(cut.pixels, vec![102.0, 103.0, 104.0, 202.0, 203.0, 204.0]);
        assert_eq!(cut.source_hdu, 1);
        assert!(!cut.header.contains("NAXIS1"));
        assert!(!cut.header.contains("XTENSION"));
        assert_eq!(cut.header.get_f64("LTV1"), Some(-2.0));
        assert_eq!(cut.header.get_f64("LTV2"), Some(-1.0));
    }

    #[test]
    fn extract_rejects_window_outside_image() {
        let bounds = PixelBounds::new(6, 10, 0, 2).unwrap();
        assert_matches!(
            extract(&source(), &ImageLocation::new("mem://mef"), 0, &bounds),
            Err(CoreError::RegionNotCovered(_))
        );
    }

    #[test]
    fn written_cutout_is_a_valid_fits_file() {
        let bounds = PixelBounds::new(0, 4, 0, 4).unwrap();
        let cut = extract(&source(), &ImageLocation::new("mem://mef"), 0, &bounds).unwrap();
        let dir = tempfile::tempdir().unwrap();
        cut.write_fits(&dir.path().join("cut.fits")).unwrap();

        let reread = FitsFileSource::new(dir.path());
        let mut handle = reread.open(&ImageLocation::new("cut.fits")).unwrap();
        assert_eq!(handle.extensions()[0].width, 4);
        assert_eq!(handle.extensions()[0].header.get_f64("LTV2"), Some(0.0));
        assert_eq!(handle.read_full(0).unwrap(), cut.pixels);
    }

    // -- full_image --

    #[test]
    fn full_image_returns_first_extension_whole() {
        let source = source().with_extension("mem://mef", 2, ramp_plane(3, 3));
        let full = full_image(&source, &ImageLocation::new("mem://mef")).unwrap();
        assert_eq!((full.width, full.height), (8, 4));
        assert_eq!(full.source_hdu, 1);
        assert_eq!(full.pixels.len(), 32);
        assert_eq!(full.pixels[8 + 3], 103.0);
        assert_eq!(full.header.get_f64("LTV1"), Some(0.0));
        assert!(!full.header.contains("NAXIS1"));
    }

    #[test]
    fn full_image_of_unknown_location_is_storage_unavailable() {
        assert_matches!(
            full_image(&source(), &ImageLocation::new("mem://missing")),
            Err(CoreError::StorageUnavailable(_))
        );
    }

    // -- shifted_header --

    #[test]
    fn crpix_and_ltv_accumulate() {
        let mut header = FitsHeader::new();
        header.push(Card::new("CRPIX1", HeaderValue::Real(100.0)));
        header.push(Card::new("CRPIX2", HeaderValue::Real(50.0)));
        header.push(Card::new("LTV1", HeaderValue::Real(-10.0)));
        let bounds = PixelBounds::new(30, 40, 5, 15).unwrap();
        let shifted = shifted_header(&header, &bounds);
        assert_eq!(shifted.get_f64("CRPIX1"), Some(70.0));
        assert_eq!(shifted.get_f64("CRPIX2"), Some(45.0));
        assert_eq!(shifted.get_f64("LTV1"), Some(-40.0));
        assert_eq!(shifted.get_f64("LTV2"), Some(-5.0));
    }

    // -- select_extension --

    #[test]
    fn extensions_without_wcs_are_corrupt() {
        let handle = source().open(&ImageLocation::new("mem://mef")).unwrap();
        let region = Region::circle(10.0, 0.0, 0.01).unwrap();
        assert_matches!(
            select_extension(handle.extensions(), &region),
            Err(CoreError::CorruptImage(_))
        );
    }
}
