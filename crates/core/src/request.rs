//! Mapping of wire-level request parameters into a typed cutout request.
//!
//! Datasets are named `<db>.<kind>[.<filter>]`, e.g. `ci_hsc.calexp.r`.
//! The region comes from a SODA `POS` parameter when present, otherwise from
//! the legacy `ra`/`dec`/`width`/`height`/`unit` parameters. A request with
//! none of those asks for the whole image.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::fingerprint::{fingerprint, full_image_fingerprint, Fingerprint};
use crate::region::Region;
use crate::region_parser::{parse_pos, LegacyParams};

/// Image product kind within a dataset repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DatasetKind {
    Raw,
    Calexp,
    DeepCoadd,
}

impl DatasetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DatasetKind::Raw => "raw",
            DatasetKind::Calexp => "calexp",
            DatasetKind::DeepCoadd => "deepCoadd",
        }
    }
}

impl FromStr for DatasetKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(DatasetKind::Raw),
            "calexp" => Ok(DatasetKind::Calexp),
            "deepcoadd" | "coadd" => Ok(DatasetKind::DeepCoadd),
            other => Err(CoreError::Validation(format!(
                "unknown dataset kind '{other}'; expected raw, calexp or deepCoadd"
            ))),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `ID` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub db: String,
    pub kind: DatasetKind,
    pub filter: Option<String>,
}

impl DatasetRef {
    /// `<db>.<kind>`, the identifier handed to metadata lookup.
    pub fn dataset_id(&self) -> String {
        format!("{}.{}", self.db, self.kind)
    }
}

impl FromStr for DatasetRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        let (db, kind, filter) = match parts.as_slice() {
            [db, kind] => (*db, *kind, None),
            [db, kind, filter] => (*db, *kind, Some(*filter)),
            _ => {
                return Err(CoreError::Validation(format!(
                    "ID '{s}' must look like <db>.<kind>[.<filter>]"
                )))
            }
        };
        if db.is_empty() {
            return Err(CoreError::Validation(format!("ID '{s}' has an empty db name")));
        }
        if filter.is_some_and(str::is_empty) {
            return Err(CoreError::Validation(format!("ID '{s}' has an empty filter")));
        }
        Ok(Self {
            db: db.to_string(),
            kind: kind.parse()?,
            filter: filter.map(str::to_string),
        })
    }
}

/// What to cut out of the resolved image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Target {
    Cutout { region: Region },
    /// The first image extension, whole, with its header.
    FullImage,
}

impl Target {
    pub fn region(&self) -> Option<&Region> {
        match self {
            Target::Cutout { region } => Some(region),
            Target::FullImage => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Cutout { region } => fmt::Display::fmt(region, f),
            Target::FullImage => f.write_str("FULL"),
        }
    }
}

/// A fully parsed cutout request, ready for lookup and queueing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoutRequest {
    pub dataset: DatasetRef,
    pub filter: String,
    pub target: Target,
}

impl CutoutRequest {
    /// Build from query parameters. Parameter names are matched
    /// case-insensitively. Filter precedence: the `ID` suffix, then `filter`,
    /// then `default_filter`.
    pub fn from_params(
        params: &HashMap<String, String>,
        default_filter: &str,
    ) -> Result<Self, CoreError> {
        let id = param(params, "ID")
            .ok_or_else(|| CoreError::Validation("missing ID parameter".into()))?;
        let dataset: DatasetRef = id.parse()?;

        let legacy = LegacyParams {
            ra: param(params, "ra"),
            dec: param(params, "dec"),
            width: param(params, "width"),
            height: param(params, "height"),
            unit: param(params, "unit"),
        };
        let target = match param(params, "POS") {
            Some(pos) => Target::Cutout {
                region: parse_pos(pos)?,
            },
            None if legacy.is_empty() => Target::FullImage,
            None => Target::Cutout {
                region: legacy.parse()?,
            },
        };

        let filter = dataset
            .filter
            .clone()
            .or_else(|| param(params, "filter").map(str::to_string))
            .unwrap_or_else(|| default_filter.to_string());

        Ok(Self {
            dataset,
            filter,
            target,
        })
    }

    pub fn dataset_id(&self) -> String {
        self.dataset.dataset_id()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        match &self.target {
            Target::Cutout { region } => fingerprint(&self.dataset_id(), &self.filter, region),
            Target::FullImage => full_image_fingerprint(&self.dataset_id(), &self.filter),
        }
    }
}

fn param<'a>(params: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .or_else(|| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}
