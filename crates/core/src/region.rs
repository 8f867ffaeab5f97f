//! Region model for cutout requests.
//!
//! A [`Region`] is the declarative description of what the client wants cut
//! out: one of the SODA shapes (`CIRCLE`, `RANGE`, `POLYGON`, `BBOX`) or the
//! `BRECT` extension, whose extent may be given in pixels or in an angular
//! unit. Regions never carry resolved pixel values, so the same region can be
//! resolved against any image.
//!
//! All sky coordinates are ICRS degrees.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Arcseconds per degree.
pub const ARCSEC_PER_DEG: f64 = 3600.0;

/// Arcseconds per arcminute.
pub const ARCSEC_PER_ARCMIN: f64 = 60.0;

/* --------------------------------------------------------------------------
Coordinates
-------------------------------------------------------------------------- */

/// A position on the sky.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyPoint {
    pub ra: f64,
    pub dec: f64,
}

impl SkyPoint {
    /// Create a point with RA wrapped into `[0, 360)`.
    pub fn new(ra: f64, dec: f64) -> Self {
        Self {
            ra: normalize_ra(ra),
            dec,
        }
    }

    /// Great-circle distance to `other`, in degrees (haversine form).
    pub fn separation(&self, other: &SkyPoint) -> f64 {
        let (ra1, dec1) = (self.ra.to_radians(), self.dec.to_radians());
        let (ra2, dec2) = (other.ra.to_radians(), other.dec.to_radians());
        let sin_ddec = ((dec2 - dec1) / 2.0).sin();
        let sin_dra = ((ra2 - ra1) / 2.0).sin();
        let h = sin_ddec * sin_ddec + dec1.cos() * dec2.cos() * sin_dra * sin_dra;
        (2.0 * h.sqrt().min(1.0).asin()).to_degrees()
    }
}

/// A fractional position in image pixel coordinates.
///
/// Pixel `i` is centred on `i` and covers `[i - 0.5, i + 0.5)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: f64,
    pub y: f64,
}

impl PixelPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Wrap an RA value into `[0, 360)`.
pub fn normalize_ra(ra: f64) -> f64 {
    let wrapped = ra.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs.
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Return the value equivalent to `ra` on the circle that lies within 180°
/// of `reference`, so spans can be computed in a continuous local frame.
pub fn unwrap_ra_near(reference: f64, ra: f64) -> f64 {
    let mut value = ra;
    while value > reference + 180.0 {
        value -= 360.0;
    }
    while value < reference - 180.0 {
        value += 360.0;
    }
    value
}

/// RA offset spanning `angle` degrees on the sky at declination `dec`,
/// capped at half the circle.
pub(crate) fn ra_offset(angle: f64, dec: f64) -> f64 {
    let cos_dec = dec.to_radians().cos().max(1e-6);
    (angle / cos_dec).min(180.0)
}

/* --------------------------------------------------------------------------
Size units
-------------------------------------------------------------------------- */

/// Unit in which a rectangle extent is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnit {
    Pixel,
    #[default]
    Arcsec,
    Arcmin,
    Deg,
}

impl SizeUnit {
    /// Parse a unit name, accepting the aliases clients have historically sent.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "px" | "pix" | "pixel" | "pixels" => Some(SizeUnit::Pixel),
            "arcsec" | "arcsecond" | "arcseconds" => Some(SizeUnit::Arcsec),
            "arcmin" | "arcminute" | "arcminutes" => Some(SizeUnit::Arcmin),
            "deg" | "degree" | "degrees" => Some(SizeUnit::Deg),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SizeUnit::Pixel => "pixel",
            SizeUnit::Arcsec => "arcsec",
            SizeUnit::Arcmin => "arcmin",
            SizeUnit::Deg => "deg",
        }
    }

    /// Convert an extent in this unit to arcseconds. `None` for pixels.
    pub fn to_arcsec(self, value: f64) -> Option<f64> {
        match self {
            SizeUnit::Pixel => None,
            SizeUnit::Arcsec => Some(value),
            SizeUnit::Arcmin => Some(value * ARCSEC_PER_ARCMIN),
            SizeUnit::Deg => Some(value * ARCSEC_PER_DEG),
        }
    }
}

impl fmt::Display for SizeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Centre of a `BRECT`, given either on the sky or directly in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum BrectCenter {
    Sky(SkyPoint),
    Pixel(PixelPoint),
}

/* --------------------------------------------------------------------------
Region
-------------------------------------------------------------------------- */

/// A requested cutout region.
///
/// Construct through the validating constructors ([`Region::circle`] and
/// friends) or [`crate::region_parser`]; both reject values that violate the
/// shape invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "UPPERCASE")]
pub enum Region {
    Circle {
        center: SkyPoint,
        radius_deg: f64,
    },
    /// A coordinate-aligned sky box. `ra_min > ra_max` means the box wraps
    /// through RA = 0.
    Range {
        ra_min: f64,
        ra_max: f64,
        dec_min: f64,
        dec_max: f64,
    },
    /// Implicitly closed; at least three vertices.
    Polygon { vertices: Vec<SkyPoint> },
    /// Axis-aligned sky box with on-sky angular width and height.
    Bbox {
        center: SkyPoint,
        width_deg: f64,
        height_deg: f64,
    },
    Brect {
        center: BrectCenter,
        width: f64,
        height: f64,
        unit: SizeUnit,
    },
}

impl Region {
    pub fn circle(ra: f64, dec: f64, radius_deg: f64) -> Result<Self, CoreError> {
        let region = Region::Circle {
            center: SkyPoint::new(ra, dec),
            radius_deg,
        };
        region.validate()?;
        Ok(region)
    }

    pub fn range(ra_min: f64, ra_max: f64, dec_min: f64, dec_max: f64) -> Result<Self, CoreError> {
        let region = Region::Range {
            ra_min: normalize_ra(ra_min),
            ra_max: if ra_max == 360.0 { 360.0 } else { normalize_ra(ra_max) },
            dec_min,
            dec_max,
        };
        region.validate()?;
        Ok(region)
    }

    pub fn polygon(vertices: Vec<SkyPoint>) -> Result<Self, CoreError> {
        let region = Region::Polygon { vertices };
        region.validate()?;
        Ok(region)
    }

    pub fn bbox(ra: f64, dec: f64, width_deg: f64, height_deg: f64) -> Result<Self, CoreError> {
        let region = Region::Bbox {
            center: SkyPoint::new(ra, dec),
            width_deg,
            height_deg,
        };
        region.validate()?;
        Ok(region)
    }

    pub fn brect(
        center: BrectCenter,
        width: f64,
        height: f64,
        unit: SizeUnit,
    ) -> Result<Self, CoreError> {
        let center = match center {
            BrectCenter::Sky(p) => BrectCenter::Sky(SkyPoint::new(p.ra, p.dec)),
            pixel => pixel,
        };
        let region = Region::Brect {
            center,
            width,
            height,
            unit,
        };
        region.validate()?;
        Ok(region)
    }

    /// SODA keyword for this shape.
    pub fn keyword(&self) -> &'static str {
        match self {
            Region::Circle { .. } => "CIRCLE",
            Region::Range { .. } => "RANGE",
            Region::Polygon { .. } => "POLYGON",
            Region::Bbox { .. } => "BBOX",
            Region::Brect { .. } => "BRECT",
        }
    }

    /// Unit the cutout extent was requested in.
    pub fn size_unit(&self) -> SizeUnit {
        match self {
            Region::Brect { unit, .. } => *unit,
            _ => SizeUnit::Deg,
        }
    }

    /// A representative sky position, used for logging and extension choice.
    /// `None` for pixel-centred rectangles.
    pub fn sky_center(&self) -> Option<SkyPoint> {
        match self {
            Region::Circle { center, .. } | Region::Bbox { center, .. } => Some(*center),
            Region::Range {
                ra_min,
                ra_max,
                dec_min,
                dec_max,
            } => {
                let hi = if ra_min > ra_max { ra_max + 360.0 } else { *ra_max };
                Some(SkyPoint::new((ra_min + hi) / 2.0, (dec_min + dec_max) / 2.0))
            }
            Region::Polygon { vertices } => {
                let first = vertices.first()?;
                let n = vertices.len() as f64;
                let ra = vertices
                    .iter()
                    .map(|v| unwrap_ra_near(first.ra, v.ra))
                    .sum::<f64>()
                    / n;
                let dec = vertices.iter().map(|v| v.dec).sum::<f64>() / n;
                Some(SkyPoint::new(ra, dec))
            }
            Region::Brect {
                center: BrectCenter::Sky(center),
                ..
            } => Some(*center),
            Region::Brect { .. } => None,
        }
    }

    /// Whether `p` lies inside the region. Polygons are tested in a local
    /// RA/Dec plane unwrapped around their first vertex. Pixel-centred
    /// rectangles have no sky extent and contain nothing.
    pub fn contains(&self, p: SkyPoint) -> bool {
        match self {
            Region::Circle { center, radius_deg } => center.separation(&p) <= *radius_deg,
            Region::Range {
                ra_min,
                ra_max,
                dec_min,
                dec_max,
            } => {
                if p.dec < *dec_min || p.dec > *dec_max {
                    return false;
                }
                let ra = normalize_ra(p.ra);
                if ra_min <= ra_max {
                    (*ra_min..=*ra_max).contains(&ra)
                } else {
                    ra >= *ra_min || ra <= *ra_max
                }
            }
            Region::Bbox {
                center,
                width_deg,
                height_deg,
            } => {
                let d_ra = unwrap_ra_near(center.ra, p.ra) - center.ra;
                (p.dec - center.dec).abs() <= height_deg / 2.0
                    && d_ra.abs() <= ra_offset(width_deg / 2.0, center.dec)
            }
            Region::Polygon { vertices } => {
                let Some(first) = vertices.first() else {
                    return false;
                };
                let x = unwrap_ra_near(first.ra, p.ra);
                let pts: Vec<(f64, f64)> = vertices
                    .iter()
                    .map(|v| (unwrap_ra_near(first.ra, v.ra), v.dec))
                    .collect();
                let mut inside = false;
                let mut j = pts.len() - 1;
                for i in 0..pts.len() {
                    let (xi, yi) = pts[i];
                    let (xj, yj) = pts[j];
                    if (yi > p.dec) != (yj > p.dec)
                        && x < (xj - xi) * (p.dec - yi) / (yj - yi) + xi
                    {
                        inside = !inside;
                    }
                    j = i;
                }
                inside
            }
            Region::Brect { .. } => false,
        }
    }

    /// Check the shape invariants.
    ///
    /// Errors carry the index the offending value has in the shape's `POS`
    /// parameter list (the keyword itself excluded).
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Region::Circle { center, radius_deg } => {
                check_sky(center, 0)?;
                check_positive(*radius_deg, 2, "radius")
            }
            Region::Range {
                ra_min,
                ra_max,
                dec_min,
                dec_max,
            } => {
                check_finite(*ra_min, 0)?;
                check_finite(*ra_max, 1)?;
                check_dec(*dec_min, 2)?;
                check_dec(*dec_max, 3)?;
                if dec_min > dec_max {
                    return Err(CoreError::malformed(
                        3,
                        format!("dec range is inverted: {dec_min} > {dec_max}"),
                    ));
                }
                Ok(())
            }
            Region::Polygon { vertices } => {
                if vertices.len() < 3 {
                    return Err(CoreError::malformed(
                        vertices.len() * 2,
                        format!("polygon needs at least 3 vertices, got {}", vertices.len()),
                    ));
                }
                for (i, v) in vertices.iter().enumerate() {
                    check_sky(v, i * 2)?;
                }
                if let Some(edge) = first_self_intersection(vertices) {
                    return Err(CoreError::malformed(
                        edge * 2,
                        format!("polygon is self-intersecting at edge {edge}"),
                    ));
                }
                Ok(())
            }
            Region::Bbox {
                center,
                width_deg,
                height_deg,
            } => {
                check_sky(center, 0)?;
                check_positive(*width_deg, 2, "width")?;
                check_positive(*height_deg, 3, "height")
            }
            Region::Brect {
                center,
                width,
                height,
                ..
            } => {
                match center {
                    BrectCenter::Sky(p) => check_sky(p, 0)?,
                    BrectCenter::Pixel(p) => {
                        check_finite(p.x, 0)?;
                        check_finite(p.y, 1)?;
                    }
                }
                check_positive(*width, 2, "width")?;
                check_positive(*height, 3, "height")
            }
        }
    }

    /// Canonical text form. Equal regions always produce the same string, so
    /// it is safe to hash for request fingerprints.
    pub fn canonical(&self) -> String {
        match self {
            Region::Circle { center, radius_deg } => format!(
                "CIRCLE {} {} {}",
                num(center.ra),
                num(center.dec),
                num(*radius_deg)
            ),
            Region::Range {
                ra_min,
                ra_max,
                dec_min,
                dec_max,
            } => format!(
                "RANGE {} {} {} {}",
                num(*ra_min),
                num(*ra_max),
                num(*dec_min),
                num(*dec_max)
            ),
            Region::Polygon { vertices } => {
                let mut out = String::from("POLYGON");
                for v in vertices {
                    out.push_str(&format!(" {} {}", num(v.ra), num(v.dec)));
                }
                out
            }
            Region::Bbox {
                center,
                width_deg,
                height_deg,
            } => format!(
                "BBOX {} {} {} {}",
                num(center.ra),
                num(center.dec),
                num(*width_deg),
                num(*height_deg)
            ),
            Region::Brect {
                center,
                width,
                height,
                unit,
            } => {
                let (prefix, a, b) = match center {
                    BrectCenter::Sky(p) => ("BRECT", p.ra, p.dec),
                    BrectCenter::Pixel(p) => ("BRECT PIXEL", p.x, p.y),
                };
                format!(
                    "{prefix} {} {} {} {} {unit}",
                    num(a),
                    num(b),
                    num(*width),
                    num(*height)
                )
            }
        }
    }
}

/// Adding positive zero folds `-0.0` into `0.0` so both print as `0`.
fn num(v: f64) -> f64 {
    v + 0.0
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/* --------------------------------------------------------------------------
Validation helpers
-------------------------------------------------------------------------- */

fn check_finite(value: f64, index: usize) -> Result<(), CoreError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(CoreError::malformed(index, format!("value {value} is not finite")))
    }
}

fn check_dec(dec: f64, index: usize) -> Result<(), CoreError> {
    check_finite(dec, index)?;
    if !(-90.0..=90.0).contains(&dec) {
        return Err(CoreError::malformed(
            index,
            format!("dec {dec} outside [-90, 90]"),
        ));
    }
    Ok(())
}

fn check_sky(point: &SkyPoint, index: usize) -> Result<(), CoreError> {
    check_finite(point.ra, index)?;
    check_dec(point.dec, index + 1)
}

fn check_positive(value: f64, index: usize, what: &str) -> Result<(), CoreError> {
    check_finite(value, index)?;
    if value <= 0.0 {
        return Err(CoreError::malformed(
            index,
            format!("{what} must be greater than 0, got {value}"),
        ));
    }
    Ok(())
}

/// Index of the first edge that crosses a non-adjacent edge, if any.
///
/// Edges are tested in a local plane (RA unwrapped around the first vertex and
/// compressed by `cos(dec)`), which is adequate for cutout-sized polygons.
fn first_self_intersection(vertices: &[SkyPoint]) -> Option<usize> {
    let n = vertices.len();
    if n < 4 {
        return None;
    }
    let ref_ra = vertices[0].ra;
    let mean_dec = vertices.iter().map(|v| v.dec).sum::<f64>() / n as f64;
    let cos_dec = mean_dec.to_radians().cos().max(1e-6);
    let pts: Vec<(f64, f64)> = vertices
        .iter()
        .map(|v| (unwrap_ra_near(ref_ra, v.ra) * cos_dec, v.dec))
        .collect();

    for i in 0..n {
        let a1 = pts[i];
        let a2 = pts[(i + 1) % n];
        for j in (i + 2)..n {
            // The last edge shares vertex 0 with the first edge.
            if i == 0 && j == n - 1 {
                continue;
            }
            let b1 = pts[j];
            let b2 = pts[(j + 1) % n];
            if segments_cross(a1, a2, b1, b2) {
                return Some(i);
            }
        }
    }
    None
}

fn orientation(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn segments_cross(a1: (f64, f64), a2: (f64, f64), b1: (f64, f64), b2: (f64, f64)) -> bool {
    let d1 = orientation(b1, b2, a1);
    let d2 = orientation(b1, b2, a2);
    let d3 = orientation(a1, a2, b1);
    let d4 = orientation(a1, a2, b2);
    (d1 > 0.0) != (d2 > 0.0) && (d3 > 0.0) != (d4 > 0.0) && d1 != 0.0 && d2 != 0.0
}

/* --------------------------------------------------------------------------
Tests
-------------------------------------------------------------------------- */
