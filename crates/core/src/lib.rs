pub mod bounds;
pub mod cutout;
pub mod error;
pub mod fingerprint;
pub mod fits;
pub mod image;
pub mod lookup;
pub mod region;
pub mod region_parser;
pub mod request;
pub mod scheduling;
pub mod types;
pub mod wcs;
