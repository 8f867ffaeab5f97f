//! FITS access through cfitsio.
//!
//! Image HDUs are listed with their shape and a [`FitsHeader`] holding the
//! keywords the service cares about (WCS, provenance, catalog identity).
//! Pixels come back as physical `f32` values: cfitsio applies
//! `BSCALE`/`BZERO` on read.

use std::path::Path;

use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;

use crate::error::CoreError;

/// Keywords describing the data layout rather than the image content.
pub const STRUCTURAL_KEYWORDS: &[&str] = &[
    "SIMPLE", "XTENSION", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "NAXIS3", "EXTEND", "PCOUNT",
    "GCOUNT", "BSCALE", "BZERO", "CHECKSUM", "DATASUM", "END",
];

/// Keywords read from every image HDU and carried into cutouts.
pub const HEADER_KEYWORDS: &[&str] = &[
    "EXTNAME", "DATASET", "FILTER", "OBJECT", "TELESCOP", "INSTRUME", "DETECTOR", "CCDNUM",
    "VISIT", "EXPTIME", "DATE-OBS", "MJD-OBS", "EQUINOX", "RADESYS", "ROTANG", "BUNIT",
    "CTYPE1", "CTYPE2", "CUNIT1", "CUNIT2", "CRVAL1", "CRVAL2", "CRPIX1", "CRPIX2", "CD1_1",
    "CD1_2", "CD2_1", "CD2_2", "CDELT1", "CDELT2", "PC1_1", "PC1_2", "PC2_1", "PC2_2",
    "CROTA2", "LTV1", "LTV2", "LTM1_1", "LTM2_2",
];

// cfitsio status codes that mean the storage, not the file, failed.
const FILE_NOT_OPENED: i32 = 104;
const READ_ERROR: i32 = 108;

impl From<fitsio::errors::Error> for CoreError {
    fn from(err: fitsio::errors::Error) -> Self {
        match err {
            fitsio::errors::Error::Fits(e) if matches!(e.status, FILE_NOT_OPENED | READ_ERROR) => {
                CoreError::StorageUnavailable(e.message)
            }
            fitsio::errors::Error::Io(e) => e.into(),
            other => CoreError::CorruptImage(other.to_string()),
        }
    }
}

/* --------------------------------------------------------------------------
Header model
-------------------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl HeaderValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Integer(i) => Some(*i as f64),
            HeaderValue::Real(r) => Some(*r),
            HeaderValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Integer(i) => Some(*i),
            HeaderValue::Real(r) if r.fract() == 0.0 => Some(*r as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Classify a value as cfitsio returns it: unquoted, with numbers left in
    /// their card spelling.
    fn from_card_text(raw: String) -> Self {
        let trimmed = raw.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return HeaderValue::Integer(i);
        }
        let numeric = trimmed.starts_with(|c: char| c.is_ascii_digit() || "+-.".contains(c));
        // Fortran-style exponents are legal in FITS reals.
        match trimmed.replace(['D', 'd'], "E").parse::<f64>() {
            Ok(r) if numeric => HeaderValue::Real(r),
            _ => HeaderValue::Text(raw.trim_end().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub keyword: String,
    pub value: HeaderValue,
}

impl Card {
    pub fn new(keyword: impl Into<String>, value: HeaderValue) -> Self {
        Self {
            keyword: keyword.into(),
            value,
        }
    }
}

/// Keyword cards of one HDU, in the order they were read or set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitsHeader {
    cards: Vec<Card>,
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn get(&self, keyword: &str) -> Option<&HeaderValue> {
        self.cards
            .iter()
            .find(|c| c.keyword == keyword)
            .map(|c| &c.value)
    }

    pub fn get_f64(&self, keyword: &str) -> Option<f64> {
        self.get(keyword).and_then(HeaderValue::as_f64)
    }

    pub fn get_i64(&self, keyword: &str) -> Option<i64> {
        self.get(keyword).and_then(HeaderValue::as_i64)
    }

    pub fn get_str(&self, keyword: &str) -> Option<&str> {
        self.get(keyword).and_then(HeaderValue::as_str)
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.cards.iter().any(|c| c.keyword == keyword)
    }

    /// Replace the value of an existing card, or append a new one.
    pub fn set(&mut self, keyword: &str, value: HeaderValue) {
        match self.cards.iter_mut().find(|c| c.keyword == keyword) {
            Some(card) => card.value = value,
            None => self.cards.push(Card::new(keyword, value)),
        }
    }

    pub fn push(&mut self, card: Card) {
        self.cards.push(card);
    }

    pub fn remove(&mut self, keyword: &str) {
        self.cards.retain(|c| c.keyword != keyword);
    }
}

/* --------------------------------------------------------------------------
Reading
-------------------------------------------------------------------------- */

/// One two-dimensional image HDU of an open file.
pub struct ImageHdu {
    /// Position of the HDU in the file; 0 is the primary HDU.
    pub index: usize,
    pub width: u64,
    pub height: u64,
    pub header: FitsHeader,
    pub(crate) hdu: FitsHdu,
}

/// Every image HDU of `fptr`. HDUs without a 2-D data unit (an empty
/// primary, tables) are skipped; trailing axes of length one are tolerated.
pub fn image_hdus(fptr: &mut FitsFile) -> Result<Vec<ImageHdu>, CoreError> {
    let mut out = Vec::new();
    let mut index = 0;
    while let Ok(hdu) = fptr.hdu(index) {
        if let Some((width, height)) = plane_shape(&hdu)? {
            out.push(ImageHdu {
                index,
                width,
                height,
                header: read_header(fptr, &hdu),
                hdu,
            });
        }
        index += 1;
    }
    if index == 0 {
        return Err(CoreError::CorruptImage("no HDU found".into()));
    }
    Ok(out)
}

fn plane_shape(hdu: &FitsHdu) -> Result<Option<(u64, u64)>, CoreError> {
    let HduInfo::ImageInfo { shape, .. } = &hdu.info else {
        return Ok(None);
    };
    // Shape is reported slowest axis first: [.., NAXIS2, NAXIS1].
    let [leading @ .., height, width] = shape.as_slice() else {
        return Ok(None);
    };
    if leading.iter().any(|&n| n != 1) || *width == 0 || *height == 0 {
        return Ok(None);
    }
    let (width, height) = (*width as u64, *height as u64);
    if width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(std::mem::size_of::<f32>() as u64))
        .is_none()
    {
        return Err(CoreError::CorruptImage(format!(
            "image of {width}x{height} pixels is too large"
        )));
    }
    Ok(Some((width, height)))
}

fn read_header(fptr: &mut FitsFile, hdu: &FitsHdu) -> FitsHeader {
    let mut header = FitsHeader::new();
    for &keyword in HEADER_KEYWORDS {
        let value = match hdu.read_key::<String>(fptr, keyword) {
            Ok(raw) => HeaderValue::from_card_text(raw),
            Err(_) => match hdu.read_key::<f64>(fptr, keyword) {
                Ok(r) => HeaderValue::Real(r),
                Err(_) => continue,
            },
        };
        header.push(Card::new(keyword, value));
    }
    header
}

/// Rows `y0..y1` of an image HDU as one contiguous band.
pub fn read_rows(
    fptr: &mut FitsFile,
    image: &ImageHdu,
    y0: u64,
    y1: u64,
) -> Result<Vec<f32>, CoreError> {
    let start = (y0 * image.width) as usize;
    let end = (y1 * image.width) as usize;
    Ok(image.hdu.read_section(fptr, start, end)?)
}

/* --------------------------------------------------------------------------
Writing
-------------------------------------------------------------------------- */

/// A pixel plane with its header, outside any file.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlane {
    pub header: FitsHeader,
    pub width: usize,
    pub height: usize,
    /// Row-major physical values.
    pub pixels: Vec<f32>,
}

impl ImagePlane {
    /// Write this plane as the primary HDU of a new file at `path`.
    pub fn write(&self, path: &Path) -> Result<(), CoreError> {
        write_image(path, &self.header, self.width, self.height, &self.pixels)
    }
}

fn check_buffer(width: usize, height: usize, pixels: &[f32]) -> Result<(), CoreError> {
    if width.checked_mul(height) != Some(pixels.len()) {
        return Err(CoreError::Internal(format!(
            "pixel buffer holds {} values, expected {width}x{height}",
            pixels.len()
        )));
    }
    Ok(())
}

/// Write a float image as the primary HDU of a new file at `path`.
///
/// Structural keywords in `header` are ignored: cfitsio generates them from
/// the dimensions.
pub fn write_image(
    path: &Path,
    header: &FitsHeader,
    width: usize,
    height: usize,
    pixels: &[f32],
) -> Result<(), CoreError> {
    check_buffer(width, height, pixels)?;
    // Slowest axis first: [NAXIS2, NAXIS1].
    let dimensions = [height, width];
    let description = ImageDescription {
        data_type: ImageType::Float,
        dimensions: &dimensions,
    };
    let mut fptr = FitsFile::create(path)
        .with_custom_primary(&description)
        .open()?;
    let hdu = fptr.primary_hdu()?;
    write_plane(&mut fptr, &hdu, header, pixels)
}

/// Write `planes` as image extensions after an empty primary HDU.
pub fn write_extensions(path: &Path, planes: &[ImagePlane]) -> Result<(), CoreError> {
    let mut fptr = FitsFile::create(path).open()?;
    for (i, plane) in planes.iter().enumerate() {
        check_buffer(plane.width, plane.height, &plane.pixels)?;
        let dimensions = [plane.height, plane.width];
        let description = ImageDescription {
            data_type: ImageType::Float,
            dimensions: &dimensions,
        };
        let hdu = fptr.create_image(format!("IMAGE{}", i + 1), &description)?;
        write_plane(&mut fptr, &hdu, &plane.header, &plane.pixels)?;
    }
    Ok(())
}

fn write_plane(
    fptr: &mut FitsFile,
    hdu: &FitsHdu,
    header: &FitsHeader,
    pixels: &[f32],
) -> Result<(), CoreError> {
    hdu.write_image(fptr, pixels)?;
    for card in header.cards() {
        let keyword = card.keyword.as_str();
        if STRUCTURAL_KEYWORDS.contains(&keyword) {
            continue;
        }
        match &card.value {
            HeaderValue::Integer(i) => hdu.write_key(fptr, keyword, *i)?,
            HeaderValue::Real(r) => hdu.write_key(fptr, keyword, *r)?,
            HeaderValue::Text(s) => hdu.write_key(fptr, keyword, s.as_str())?,
        }
    }
    Ok(())
}
