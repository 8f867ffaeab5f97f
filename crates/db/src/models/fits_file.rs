//! FITS file catalog models.

use imgserv_core::fits::{FitsHeader, HeaderValue};
use imgserv_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `fits_files` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FitsFile {
    pub fits_file_id: i64,
    pub file_name: String,
    pub hdu_count: i16,
    pub created_at: Timestamp,
}

/// A row from the `fits_key_values` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FitsKeyValue {
    pub fits_file_id: i64,
    pub fits_key: String,
    pub hdu: i16,
    pub string_value: Option<String>,
    pub int_value: Option<i64>,
    pub double_value: Option<f64>,
    pub line_num: Option<i32>,
    pub comment: Option<String>,
}

/// A row from the `fits_positions` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FitsPosition {
    pub fits_file_id: i64,
    pub hdu: i16,
    pub equinox: Option<f64>,
    pub p_ra: f64,
    pub p_dec: f64,
    pub rot_ang: Option<f64>,
    pub p_date: Option<Timestamp>,
}

/// Result of a nearest-position search: the file, the HDU whose position
/// matched, and the squared RA/Dec distance in square degrees.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NearestFitsFile {
    pub fits_file_id: i64,
    pub file_name: String,
    pub hdu: i16,
    pub distance: f64,
}

/// DTO for registering a file with its header cards and positions.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateFitsFile {
    pub file_name: String,
    pub hdu_count: i16,
    pub key_values: Vec<CreateFitsKeyValue>,
    pub positions: Vec<CreateFitsPosition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateFitsKeyValue {
    pub fits_key: String,
    pub hdu: i16,
    pub string_value: Option<String>,
    pub int_value: Option<i64>,
    pub double_value: Option<f64>,
    pub line_num: Option<i32>,
    pub comment: Option<String>,
}

impl CreateFitsKeyValue {
    /// One row per card of `header`, numbered in header order.
    pub fn from_header(hdu: i16, header: &FitsHeader) -> Vec<Self> {
        header
            .cards()
            .iter()
            .enumerate()
            .map(|(line, card)| {
                let mut row = Self {
                    fits_key: card.keyword.clone(),
                    hdu,
                    string_value: None,
                    int_value: None,
                    double_value: None,
                    line_num: i32::try_from(line).ok(),
                    comment: None,
                };
                match &card.value {
                    HeaderValue::Text(s) => row.string_value = Some(s.clone()),
                    HeaderValue::Integer(i) => row.int_value = Some(*i),
                    HeaderValue::Real(r) => row.double_value = Some(*r),
                }
                row
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateFitsPosition {
    pub hdu: i16,
    pub equinox: Option<f64>,
    pub p_ra: f64,
    pub p_dec: f64,
    pub rot_ang: Option<f64>,
    pub p_date: Option<Timestamp>,
}
