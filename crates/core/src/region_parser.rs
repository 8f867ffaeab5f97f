//! Parsing of wire-level region parameters into [`Region`] values.
//!
//! Two conventions are accepted:
//!
//! - SODA `POS` strings: `<SHAPE> <numbers...>` with `SHAPE` one of
//!   `CIRCLE`, `RANGE`, `POLYGON`, `BBOX`, `BRECT` (case-insensitive).
//! - The legacy point convention: `ra`, `dec` and optional `width`,
//!   `height`, `unit` parameters, read as an implicit `BRECT`.
//!
//! Parsing is pure. Every failure is a [`CoreError::MalformedRegion`] whose
//! index points at the offending token.

use crate::error::CoreError;
use crate::region::{BrectCenter, Region, SizeUnit, SkyPoint};

/// Width and height used by the legacy convention when none are given.
pub const DEFAULT_LEGACY_SIZE: f64 = 30.0;

/// Unit used by the legacy convention and `BRECT` when none is given.
pub const DEFAULT_UNIT: SizeUnit = SizeUnit::Arcsec;

/// All recognized SODA shape keywords.
pub const SHAPE_KEYWORDS: &[&str] = &["CIRCLE", "RANGE", "POLYGON", "BBOX", "BRECT"];

/// Parse a region from a shape keyword and its parameter tokens.
///
/// `kind = None` selects the legacy convention, where `tokens` are
/// `[ra, dec, width?, height?, unit?]`. Error indices are positions in
/// `tokens`; an unknown keyword is reported at index 0.
pub fn parse(kind: Option<&str>, tokens: &[&str]) -> Result<Region, CoreError> {
    let Some(kind) = kind else {
        return parse_legacy(tokens);
    };

    match kind.to_ascii_uppercase().as_str() {
        "CIRCLE" => {
            let v = numbers(tokens, 3)?;
            Region::circle(v[0], v[1], v[2])
        }
        "RANGE" => {
            let v = numbers(tokens, 4)?;
            Region::range(v[0], v[1], v[2], v[3])
        }
        "POLYGON" => parse_polygon(tokens),
        "BBOX" => {
            let v = numbers(tokens, 4)?;
            Region::bbox(v[0], v[1], v[2], v[3])
        }
        "BRECT" => parse_brect(tokens),
        other => Err(CoreError::malformed(
            0,
            format!(
                "unknown shape '{other}'; expected one of {}",
                SHAPE_KEYWORDS.join(", ")
            ),
        )),
    }
}

/// Parse a full SODA `POS` value such as `CIRCLE 320.94 -0.289128 0.01`.
///
/// Error indices count the shape keyword as token 0.
pub fn parse_pos(pos: &str) -> Result<Region, CoreError> {
    let tokens: Vec<&str> = pos.split_whitespace().collect();
    let Some((keyword, rest)) = tokens.split_first() else {
        return Err(CoreError::malformed(0, "empty POS value"));
    };
    if !SHAPE_KEYWORDS.contains(&keyword.to_ascii_uppercase().as_str()) {
        return Err(CoreError::malformed(
            0,
            format!("unknown shape '{keyword}'"),
        ));
    }
    parse(Some(keyword), rest).map_err(|err| match err {
        CoreError::MalformedRegion { index, message } => CoreError::MalformedRegion {
            index: index + 1,
            message,
        },
        other => other,
    })
}

/// Legacy discrete parameters. Missing values are `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyParams<'a> {
    pub ra: Option<&'a str>,
    pub dec: Option<&'a str>,
    pub width: Option<&'a str>,
    pub height: Option<&'a str>,
    pub unit: Option<&'a str>,
}

impl<'a> LegacyParams<'a> {
    /// True when no positional or size parameter was given. `unit` alone
    /// does not count.
    pub fn is_empty(&self) -> bool {
        self.ra.is_none() && self.dec.is_none() && self.width.is_none() && self.height.is_none()
    }

    /// Parse into a region. Indices: ra 0, dec 1, width 2, height 3, unit 4.
    pub fn parse(&self) -> Result<Region, CoreError> {
        let ra = required_number(self.ra, 0, "ra")?;
        let dec = required_number(self.dec, 1, "dec")?;
        let width = optional_number(self.width, 2)?.unwrap_or(DEFAULT_LEGACY_SIZE);
        let height = optional_number(self.height, 3)?.unwrap_or(DEFAULT_LEGACY_SIZE);
        let unit = match self.unit {
            Some(u) => parse_unit(u, 4)?,
            None => DEFAULT_UNIT,
        };
        Region::brect(
            BrectCenter::Sky(SkyPoint::new(ra, dec)),
            width,
            height,
            unit,
        )
    }
}

fn parse_legacy(tokens: &[&str]) -> Result<Region, CoreError> {
    if tokens.len() > 5 {
        return Err(CoreError::malformed(
            5,
            format!("legacy region takes at most 5 values, got {}", tokens.len()),
        ));
    }
    LegacyParams {
        ra: tokens.first().copied(),
        dec: tokens.get(1).copied(),
        width: tokens.get(2).copied(),
        height: tokens.get(3).copied(),
        unit: tokens.get(4).copied(),
    }
    .parse()
}

fn parse_polygon(tokens: &[&str]) -> Result<Region, CoreError> {
    if tokens.len() < 6 || tokens.len() % 2 != 0 {
        return Err(CoreError::malformed(
            tokens.len(),
            format!(
                "POLYGON needs an even number of at least 6 values, got {}",
                tokens.len()
            ),
        ));
    }
    let values = numbers(tokens, tokens.len())?;
    let vertices = values
        .chunks_exact(2)
        .map(|pair| SkyPoint::new(pair[0], pair[1]))
        .collect();
    Region::polygon(vertices)
}

fn parse_brect(tokens: &[&str]) -> Result<Region, CoreError> {
    if tokens.len() != 4 && tokens.len() != 5 {
        return Err(CoreError::malformed(
            tokens.len().min(5),
            format!("BRECT takes 4 or 5 values, got {}", tokens.len()),
        ));
    }
    let v = numbers(&tokens[..4], 4)?;
    let unit = match tokens.get(4) {
        Some(u) => parse_unit(u, 4)?,
        None => DEFAULT_UNIT,
    };
    Region::brect(BrectCenter::Sky(SkyPoint::new(v[0], v[1])), v[2], v[3], unit)
}

/// Parse exactly `expected` numeric tokens.
fn numbers(tokens: &[&str], expected: usize) -> Result<Vec<f64>, CoreError> {
    if tokens.len() != expected {
        return Err(CoreError::malformed(
            tokens.len().min(expected),
            format!("expected {expected} values, got {}", tokens.len()),
        ));
    }
    tokens
        .iter()
        .enumerate()
        .map(|(i, t)| number(t, i))
        .collect()
}

fn number(token: &str, index: usize) -> Result<f64, CoreError> {
    token
        .trim()
        .parse::<f64>()
        .map_err(|_| CoreError::malformed(index, format!("'{token}' is not a number")))
}

fn required_number(token: Option<&str>, index: usize, name: &str) -> Result<f64, CoreError> {
    match token {
        Some(t) => number(t, index),
        None => Err(CoreError::malformed(index, format!("missing {name}"))),
    }
}

fn optional_number(token: Option<&str>, index: usize) -> Result<Option<f64>, CoreError> {
    token.map(|t| number(t, index)).transpose()
}

fn parse_unit(token: &str, index: usize) -> Result<SizeUnit, CoreError> {
    SizeUnit::parse(token)
        .ok_or_else(|| CoreError::malformed(index, format!("unknown unit '{token}'")))
}
