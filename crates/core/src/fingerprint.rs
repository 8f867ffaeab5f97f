//! Request fingerprints for job deduplication and result caching.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::region::Region;

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Stable identity of a cutout request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint over dataset, filter, canonical region and output unit.
///
/// Dataset and filter are compared case-insensitively, matching how lookup
/// treats them.
pub fn fingerprint(dataset_id: &str, filter: &str, region: &Region) -> Fingerprint {
    digest(
        dataset_id,
        filter,
        &format!("{}\n{}", region.canonical(), region.size_unit()),
    )
}

/// Fingerprint of a whole-image request for dataset and filter.
pub fn full_image_fingerprint(dataset_id: &str, filter: &str) -> Fingerprint {
    digest(dataset_id, filter, "FULL")
}

fn digest(dataset_id: &str, filter: &str, target: &str) -> Fingerprint {
    let input = format!(
        "{}\n{}\n{target}",
        dataset_id.to_ascii_lowercase(),
        filter.to_ascii_lowercase()
    );
    Fingerprint(sha256_hex(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{BrectCenter, SizeUnit, SkyPoint};

    #[test]
    fn empty_input_produces_known_hash() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn same_request_same_fingerprint() {
        let a = Region::circle(320.0, -0.289128, 0.01).unwrap();
        let b = Region::circle(-40.0, -0.289128, 0.01).unwrap();
        assert_eq!(
            fingerprint("sdss.calexp", "r", &a),
            fingerprint("SDSS.calexp", "R", &b)
        );
        assert_eq!(fingerprint("sdss.calexp", "r", &a).as_str().len(), 64);
    }

    #[test]
    fn filter_and_unit_change_fingerprint() {
        let center = BrectCenter::Sky(SkyPoint::new(10.0, 0.0));
        let arcsec = Region::brect(center, 30.0, 30.0, SizeUnit::Arcsec).unwrap();
        let pixel = Region::brect(center, 30.0, 30.0, SizeUnit::Pixel).unwrap();
        assert_ne!(
            fingerprint("sdss.calexp", "r", &arcsec),
            fingerprint("sdss.calexp", "r", &pixel)
        );
        assert_ne!(
            fingerprint("sdss.calexp", "r", &arcsec),
            fingerprint("sdss.calexp", "g", &arcsec)
        );
    }

    #[test]
    fn full_image_differs_from_any_cutout() {
        let full = full_image_fingerprint("sdss.calexp", "r");
        assert_eq!(full, full_image_fingerprint("SDSS.calexp", "R"));
        assert_ne!(full, full_image_fingerprint("sdss.calexp", "g"));
        let circle = Region::circle(10.0, 0.0, 0.01).unwrap();
        assert_ne!(full, fingerprint("sdss.calexp", "r", &circle));
    }
}
