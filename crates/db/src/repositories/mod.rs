//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument.

pub mod fits_file_repo;

pub use fits_file_repo::FitsFileRepo;
