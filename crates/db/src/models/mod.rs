//! Row structs and insert DTOs for the FITS metadata tables.

pub mod fits_file;
