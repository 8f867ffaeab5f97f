//! Resolution of sky regions into integer pixel rectangles.
//!
//! Bounds are half-open: `[x_min, x_max) x [y_min, y_max)`. A sampled
//! position `p` belongs to pixel `floor(p + 0.5)`.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::region::{
    ra_offset, unwrap_ra_near, BrectCenter, PixelPoint, Region, SizeUnit, SkyPoint,
    ARCSEC_PER_DEG,
};
use crate::wcs::WcsAdapter;

/// Non-empty half-open pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelBounds {
    x_min: i64,
    x_max: i64,
    y_min: i64,
    y_max: i64,
}

impl PixelBounds {
    /// `None` if the rectangle would be empty.
    pub fn new(x_min: i64, x_max: i64, y_min: i64, y_max: i64) -> Option<Self> {
        (x_min < x_max && y_min < y_max).then_some(Self {
            x_min,
            x_max,
            y_min,
            y_max,
        })
    }

    pub fn x_min(&self) -> i64 {
        self.x_min
    }

    pub fn x_max(&self) -> i64 {
        self.x_max
    }

    pub fn y_min(&self) -> i64 {
        self.y_min
    }

    pub fn y_max(&self) -> i64 {
        self.y_max
    }

    pub fn width(&self) -> u64 {
        (self.x_max - self.x_min) as u64
    }

    pub fn height(&self) -> u64 {
        (self.y_max - self.y_min) as u64
    }

    pub fn area(&self) -> u64 {
        self.width() * self.height()
    }

    /// Whether the pixel containing `p` lies inside the rectangle.
    pub fn contains_point(&self, p: PixelPoint) -> bool {
        let x = pixel_index(p.x);
        let y = pixel_index(p.y);
        (self.x_min..self.x_max).contains(&x) && (self.y_min..self.y_max).contains(&y)
    }

    /// Intersection with the image `[0, width) x [0, height)`.
    pub fn clip(&self, width: u64, height: u64) -> Option<Self> {
        let w = i64::try_from(width).unwrap_or(i64::MAX);
        let h = i64::try_from(height).unwrap_or(i64::MAX);
        Self::new(
            self.x_min.max(0),
            self.x_max.min(w),
            self.y_min.max(0),
            self.y_max.min(h),
        )
    }
}

/// Result of resolving a region against one image extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBounds {
    Within(PixelBounds),
    OutsideImage,
}

impl ResolvedBounds {
    pub fn bounds(&self) -> Option<PixelBounds> {
        match self {
            ResolvedBounds::Within(b) => Some(*b),
            ResolvedBounds::OutsideImage => None,
        }
    }

    pub fn into_result(self) -> Result<PixelBounds, CoreError> {
        match self {
            ResolvedBounds::Within(b) => Ok(b),
            ResolvedBounds::OutsideImage => Err(CoreError::RegionNotCovered(
                "region does not intersect the image".into(),
            )),
        }
    }
}

/// Resolve `region` to the pixel rectangle enclosing it on an image of
/// `width x height` pixels, clipped to the image.
pub fn resolve(region: &Region, wcs: &dyn WcsAdapter, width: u64, height: u64) -> ResolvedBounds {
    let raw = match region {
        Region::Brect {
            center,
            width: w,
            height: h,
            unit,
        } => brect_bounds(center, *w, *h, *unit, wcs),
        _ => sampled_bounds(region, wcs, width, height),
    };

    match raw.and_then(|b| b.clip(width, height)) {
        Some(b) => ResolvedBounds::Within(b),
        None => ResolvedBounds::OutsideImage,
    }
}

/// Widest RA gap between neighbouring box samples, in degrees.
const MAX_RA_STEP: f64 = 90.0;

fn pixel_index(p: f64) -> i64 {
    (p + 0.5).floor() as i64
}

/// Enclosing rectangle of the pixels holding each projected sample, plus any
/// image anchor pixel whose sky position falls inside the region. Samples
/// without a projection are skipped. The anchors cover regions much larger
/// than the image, whose samples all land far outside it or behind the
/// tangent plane.
fn sampled_bounds(
    region: &Region,
    wcs: &dyn WcsAdapter,
    width: u64,
    height: u64,
) -> Option<PixelBounds> {
    let projected = sample_points(region)
        .into_iter()
        .filter_map(|s| wcs.sky_to_pixel(s));
    let anchored = image_anchors(width, height)
        .into_iter()
        .filter(|p| region.contains(wcs.pixel_to_sky(*p)));

    let mut xs = (f64::INFINITY, f64::NEG_INFINITY);
    let mut ys = (f64::INFINITY, f64::NEG_INFINITY);
    let mut any = false;
    for p in projected.chain(anchored) {
        if !p.x.is_finite() || !p.y.is_finite() {
            continue;
        }
        any = true;
        xs = (xs.0.min(p.x), xs.1.max(p.x));
        ys = (ys.0.min(p.y), ys.1.max(p.y));
    }
    if !any {
        return None;
    }
    PixelBounds::new(
        pixel_index(xs.0),
        pixel_index(xs.1) + 1,
        pixel_index(ys.0),
        pixel_index(ys.1) + 1,
    )
}

/// Centres of the four corner pixels, the edge midpoints and the middle of
/// the image.
fn image_anchors(width: u64, height: u64) -> Vec<PixelPoint> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let (x1, y1) = ((width - 1) as f64, (height - 1) as f64);
    let mut out = Vec::with_capacity(9);
    for x in [0.0, x1 / 2.0, x1] {
        for y in [0.0, y1 / 2.0, y1] {
            out.push(PixelPoint::new(x, y));
        }
    }
    out
}

/// Rectangle of `w x h` centred on the region centre. Angular extents are
/// converted with the pixel scale at the centre.
fn brect_bounds(
    center: &BrectCenter,
    w: f64,
    h: f64,
    unit: SizeUnit,
    wcs: &dyn WcsAdapter,
) -> Option<PixelBounds> {
    let c = match center {
        BrectCenter::Sky(sky) => wcs.sky_to_pixel(*sky)?,
        BrectCenter::Pixel(p) => *p,
    };
    let (w_px, h_px) = match (unit.to_arcsec(w), unit.to_arcsec(h)) {
        (Some(w_as), Some(h_as)) => {
            let scale_as = wcs.pixel_scale_at(c) * ARCSEC_PER_DEG;
            if !(scale_as.is_finite() && scale_as > 0.0) {
                return None;
            }
            (w_as / scale_as, h_as / scale_as)
        }
        _ => (w, h),
    };
    PixelBounds::new(
        (c.x - w_px / 2.0).floor() as i64,
        (c.x + w_px / 2.0).ceil() as i64,
        (c.y - h_px / 2.0).floor() as i64,
        (c.y + h_px / 2.0).ceil() as i64,
    )
}

/// Sky positions whose projected extremes enclose the region.
fn sample_points(region: &Region) -> Vec<SkyPoint> {
    match region {
        Region::Circle { center, radius_deg } => {
            let r = *radius_deg;
            let dra = ra_offset(r, center.dec);
            let (ra, dec) = (center.ra, center.dec);
            let up = clamp_dec(dec + r);
            let down = clamp_dec(dec - r);
            vec![
                SkyPoint::new(ra, dec),
                SkyPoint::new(ra + dra, dec),
                SkyPoint::new(ra - dra, dec),
                SkyPoint::new(ra, up),
                SkyPoint::new(ra, down),
                SkyPoint::new(ra + dra, up),
                SkyPoint::new(ra - dra, up),
                SkyPoint::new(ra + dra, down),
                SkyPoint::new(ra - dra, down),
            ]
        }
        Region::Range {
            ra_min,
            ra_max,
            dec_min,
            dec_max,
        } => {
            let hi = if ra_min > ra_max { ra_max + 360.0 } else { *ra_max };
            grid(*ra_min, hi, *dec_min, *dec_max)
        }
        Region::Bbox {
            center,
            width_deg,
            height_deg,
        } => {
            let half_ra = ra_offset(width_deg / 2.0, center.dec);
            let half_dec = height_deg / 2.0;
            grid(
                center.ra - half_ra,
                center.ra + half_ra,
                clamp_dec(center.dec - half_dec),
                clamp_dec(center.dec + half_dec),
            )
        }
        Region::Polygon { vertices } => {
            let Some(first) = vertices.first() else {
                return Vec::new();
            };
            vertices
                .iter()
                .map(|v| SkyPoint {
                    ra: unwrap_ra_near(first.ra, v.ra),
                    dec: v.dec,
                })
                .collect()
        }
        // Handled by brect_bounds.
        Region::Brect { .. } => Vec::new(),
    }
}

/// Samples along the edges and middle of an RA/Dec box in a continuous
/// frame. RA is stepped at most 90 degrees apart so wide boxes keep samples
/// on the image's side of the sky.
fn grid(ra_lo: f64, ra_hi: f64, dec_lo: f64, dec_hi: f64) -> Vec<SkyPoint> {
    let steps = ((ra_hi - ra_lo) / MAX_RA_STEP).ceil().max(2.0) as usize;
    let dec_mid = (dec_lo + dec_hi) / 2.0;
    let mut out = Vec::with_capacity((steps + 1) * 3);
    for i in 0..=steps {
        let ra = ra_lo + (ra_hi - ra_lo) * i as f64 / steps as f64;
        for dec in [dec_lo, dec_mid, dec_hi] {
            out.push(SkyPoint::new(ra, dec));
        }
    }
    out
}

fn clamp_dec(dec: f64) -> f64 {
    dec.clamp(-90.0, 90.0)
}
