//! World coordinate system boundary.
//!
//! Bounds resolution only talks to [`WcsAdapter`]. The one implementation
//! shipped here is a gnomonic (TAN) projection with a linear CD matrix, read
//! from the standard FITS keywords; distortion terms are ignored.

use crate::error::CoreError;
use crate::fits::{FitsHeader, HeaderValue};
use crate::region::{normalize_ra, PixelPoint, SkyPoint};

/// Pixel/sky transform for one image extension.
///
/// Pixel coordinates are 0-based with pixel centres on integers.
pub trait WcsAdapter: Send + Sync {
    /// `None` when the point has no projection onto the image plane (for a
    /// TAN projection, the far hemisphere).
    fn sky_to_pixel(&self, sky: SkyPoint) -> Option<PixelPoint>;

    fn pixel_to_sky(&self, pixel: PixelPoint) -> SkyPoint;

    /// Local pixel scale in degrees per pixel, as the geometric mean of the
    /// two axis scales at `pixel`.
    fn pixel_scale_at(&self, pixel: PixelPoint) -> f64 {
        let here = self.pixel_to_sky(pixel);
        let right = self.pixel_to_sky(PixelPoint::new(pixel.x + 1.0, pixel.y));
        let up = self.pixel_to_sky(PixelPoint::new(pixel.x, pixel.y + 1.0));
        (here.separation(&right) * here.separation(&up)).sqrt()
    }
}

/// Gnomonic projection around `crval`.
#[derive(Debug, Clone, PartialEq)]
pub struct TanWcs {
    crval: SkyPoint,
    crpix: PixelPoint,
    cd: [[f64; 2]; 2],
    cd_inv: [[f64; 2]; 2],
}

impl TanWcs {
    /// `crpix` is 0-based (FITS `CRPIX` minus one). `cd` maps pixel offsets to
    /// tangent-plane degrees.
    pub fn new(crval: SkyPoint, crpix: PixelPoint, cd: [[f64; 2]; 2]) -> Result<Self, CoreError> {
        let cd_inv = cd_inverse(&cd)
            .ok_or_else(|| CoreError::CorruptImage("singular CD matrix".into()))?;
        Ok(Self {
            crval,
            crpix,
            cd,
            cd_inv,
        })
    }

    /// North up, east left, square pixels of `scale_deg`.
    pub fn north_up(crval: SkyPoint, crpix: PixelPoint, scale_deg: f64) -> Result<Self, CoreError> {
        Self::new(crval, crpix, [[-scale_deg, 0.0], [0.0, scale_deg]])
    }

    pub fn crval(&self) -> SkyPoint {
        self.crval
    }

    pub fn crpix(&self) -> PixelPoint {
        self.crpix
    }

    pub fn cd(&self) -> [[f64; 2]; 2] {
        self.cd
    }

    /// Build from `CTYPEn`/`CRVALn`/`CRPIXn` plus either a `CDi_j` matrix or
    /// `CDELTn` with an optional `PCi_j` matrix or `CROTA2`.
    pub fn from_header(header: &FitsHeader) -> Result<Self, CoreError> {
        for key in ["CTYPE1", "CTYPE2"] {
            let ctype = header
                .get_str(key)
                .ok_or_else(|| CoreError::CorruptImage(format!("missing {key}")))?;
            if !ctype.ends_with("-TAN") {
                return Err(CoreError::CorruptImage(format!(
                    "unsupported projection {key} = '{ctype}'"
                )));
            }
        }

        let crval = SkyPoint::new(required(header, "CRVAL1")?, required(header, "CRVAL2")?);
        let crpix = PixelPoint::new(
            required(header, "CRPIX1")? - 1.0,
            required(header, "CRPIX2")? - 1.0,
        );

        let has_cd = ["CD1_1", "CD1_2", "CD2_1", "CD2_2"]
            .iter()
            .any(|k| header.contains(k));
        let cd = if has_cd {
            let get = |k: &str| header.get_f64(k).unwrap_or(0.0);
            [[get("CD1_1"), get("CD1_2")], [get("CD2_1"), get("CD2_2")]]
        } else {
            let cdelt1 = required(header, "CDELT1")?;
            let cdelt2 = required(header, "CDELT2")?;
            let has_pc = ["PC1_1", "PC1_2", "PC2_1", "PC2_2"]
                .iter()
                .any(|k| header.contains(k));
            if has_pc {
                let pc = |k: &str, default: f64| header.get_f64(k).unwrap_or(default);
                [
                    [cdelt1 * pc("PC1_1", 1.0), cdelt1 * pc("PC1_2", 0.0)],
                    [cdelt2 * pc("PC2_1", 0.0), cdelt2 * pc("PC2_2", 1.0)],
                ]
            } else {
                let rho = header.get_f64("CROTA2").unwrap_or(0.0).to_radians();
                let (sin, cos) = rho.sin_cos();
                [[cdelt1 * cos, -cdelt2 * sin], [cdelt1 * sin, cdelt2 * cos]]
            }
        };

        Self::new(crval, crpix, cd)
    }

    /// Write this solution into `header` as `CDi_j` keywords.
    pub fn write_header(&self, header: &mut FitsHeader) {
        header.set("CTYPE1", HeaderValue::Text("RA---TAN".into()));
        header.set("CTYPE2", HeaderValue::Text("DEC--TAN".into()));
        header.set("CRVAL1", HeaderValue::Real(self.crval.ra));
        header.set("CRVAL2", HeaderValue::Real(self.crval.dec));
        header.set("CRPIX1", HeaderValue::Real(self.crpix.x + 1.0));
        header.set("CRPIX2", HeaderValue::Real(self.crpix.y + 1.0));
        header.set("CD1_1", HeaderValue::Real(self.cd[0][0]));
        header.set("CD1_2", HeaderValue::Real(self.cd[0][1]));
        header.set("CD2_1", HeaderValue::Real(self.cd[1][0]));
        header.set("CD2_2", HeaderValue::Real(self.cd[1][1]));
    }
}

impl WcsAdapter for TanWcs {
    fn sky_to_pixel(&self, sky: SkyPoint) -> Option<PixelPoint> {
        let (xi, eta) = tan_project(
            sky.ra.to_radians(),
            sky.dec.to_radians(),
            self.crval.ra.to_radians(),
            self.crval.dec.to_radians(),
        )?;
        let (xi, eta) = (xi.to_degrees(), eta.to_degrees());
        let inv = &self.cd_inv;
        Some(PixelPoint::new(
            self.crpix.x + inv[0][0] * xi + inv[0][1] * eta,
            self.crpix.y + inv[1][0] * xi + inv[1][1] * eta,
        ))
    }

    fn pixel_to_sky(&self, pixel: PixelPoint) -> SkyPoint {
        let dx = pixel.x - self.crpix.x;
        let dy = pixel.y - self.crpix.y;
        let xi = (self.cd[0][0] * dx + self.cd[0][1] * dy).to_radians();
        let eta = (self.cd[1][0] * dx + self.cd[1][1] * dy).to_radians();
        let (ra, dec) = inverse_tan_project(
            xi,
            eta,
            self.crval.ra.to_radians(),
            self.crval.dec.to_radians(),
        );
        SkyPoint::new(normalize_ra(ra.to_degrees()), dec.to_degrees())
    }
}

fn required(header: &FitsHeader, key: &str) -> Result<f64, CoreError> {
    header
        .get_f64(key)
        .ok_or_else(|| CoreError::CorruptImage(format!("missing {key}")))
}

/// Forward gnomonic projection; all angles in radians. `None` on or behind
/// the tangent plane.
fn tan_project(ra: f64, dec: f64, ra0: f64, dec0: f64) -> Option<(f64, f64)> {
    let da = ra - ra0;
    let (sin_dec, cos_dec) = dec.sin_cos();
    let (sin_dec0, cos_dec0) = dec0.sin_cos();
    let cos_da = da.cos();

    let denom = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_da;
    if denom <= 1e-12 {
        return None;
    }
    let xi = cos_dec * da.sin() / denom;
    let eta = (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_da) / denom;
    Some((xi, eta))
}

fn inverse_tan_project(xi: f64, eta: f64, ra0: f64, dec0: f64) -> (f64, f64) {
    let rho_sq = xi * xi + eta * eta;
    if rho_sq < 1e-30 {
        return (ra0, dec0);
    }
    let (sin_dec0, cos_dec0) = dec0.sin_cos();
    let rho = rho_sq.sqrt();
    let (sin_c, cos_c) = rho.atan().sin_cos();

    let dec = (cos_c * sin_dec0 + eta * sin_c * cos_dec0 / rho).asin();
    let ra = ra0 + (xi * sin_c).atan2(rho * cos_dec0 * cos_c - eta * sin_dec0 * sin_c);
    (ra, dec)
}

fn cd_inverse(cd: &[[f64; 2]; 2]) -> Option<[[f64; 2]; 2]> {
    let det = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];
    if !det.is_finite() || det.abs() < 1e-30 {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        [cd[1][1] * inv_det, -cd[0][1] * inv_det],
        [-cd[1][0] * inv_det, cd[0][0] * inv_det],
    ])
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const SCALE: f64 = 0.2 / 3600.0;

    fn wcs() -> TanWcs {
        TanWcs::north_up(
            SkyPoint::new(320.94, -0.289128),
            PixelPoint::new(1023.5, 1023.5),
            SCALE,
        )
        .unwrap()
    }

    #[test]
    fn reference_point_maps_to_crpix() {
        let w = wcs();
        let p = w.sky_to_pixel(w.crval()).unwrap();
        assert!((p.x - 1023.5).abs() < 1e-9);
        assert!((p.y - 1023.5).abs() < 1e-9);
    }

    #[test]
    fn pixel_sky_roundtrip() {
        let w = wcs();
        let pixel = PixelPoint::new(100.0, 1900.0);
        let back = w.sky_to_pixel(w.pixel_to_sky(pixel)).unwrap();
        assert!((back.x - pixel.x).abs() < 1e-6);
        assert!((back.y - pixel.y).abs() < 1e-6);
    }

    #[test]
    fn east_is_left() {
        let w = wcs();
        let east = SkyPoint::new(320.95, -0.289128);
        let p = w.sky_to_pixel(east).unwrap();
        assert!(p.x < 1023.5);
    }

    #[test]
    fn far_hemisphere_has_no_projection() {
        let w = wcs();
        assert_eq!(w.sky_to_pixel(SkyPoint::new(140.94, 0.289128)), None);
    }

    #[test]
    fn pixel_scale_matches_cd() {
        let w = wcs();
        let scale = w.pixel_scale_at(PixelPoint::new(1023.5, 1023.5));
        assert!((scale - SCALE).abs() / SCALE < 1e-6);
    }

    #[test]
    fn header_roundtrip() {
        let w = wcs();
        let mut header = FitsHeader::new();
        w.write_header(&mut header);
        let parsed = TanWcs::from_header(&header).unwrap();
        assert_eq!(parsed.crpix(), w.crpix());
        assert_eq!(parsed.cd(), w.cd());
    }

    #[test]
    fn cdelt_with_crota() {
        let mut header = FitsHeader::new();
        header.set("CTYPE1", HeaderValue::Text("RA---TAN".into()));
        header.set("CTYPE2", HeaderValue::Text("DEC--TAN".into()));
        header.set("CRVAL1", HeaderValue::Real(10.0));
        header.set("CRVAL2", HeaderValue::Real(0.0));
        header.set("CRPIX1", HeaderValue::Real(1.0));
        header.set("CRPIX2", HeaderValue::Real(1.0));
        header.set("CDELT1", HeaderValue::Real(-SCALE));
        header.set("CDELT2", HeaderValue::Real(SCALE));
        header.set("CROTA2", HeaderValue::Real(0.0));
        let w = TanWcs::from_header(&header).unwrap();
        assert_eq!(w.crpix(), PixelPoint::new(0.0, 0.0));
        assert_eq!(w.cd(), [[-SCALE, 0.0], [0.0, SCALE]]);
    }

    #[test]
    fn non_tan_projection_is_rejected() {
        let mut header = FitsHeader::new();
        header.set("CTYPE1", HeaderValue::Text("RA---SIN".into()));
        header.set("CTYPE2", HeaderValue::Text("DEC--SIN".into()));
        assert_matches!(TanWcs::from_header(&header), Err(CoreError::CorruptImage(_)));
    }

    #[test]
    fn singular_cd_is_rejected() {
        assert_matches!(
            TanWcs::new(SkyPoint::new(0.0, 0.0), PixelPoint::new(0.0, 0.0), [[0.0; 2]; 2]),
            Err(CoreError::CorruptImage(_))
        );
    }
}
