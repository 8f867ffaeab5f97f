//! Building metadata catalog rows from FITS files on disk.

use chrono::NaiveDateTime;
use imgserv_core::error::CoreError;
use imgserv_core::fits::FitsHeader;
use imgserv_core::image::{ImageLocation, ImageSource};
use imgserv_core::region::PixelPoint;
use imgserv_core::types::Timestamp;
use imgserv_core::wcs::WcsAdapter;
use imgserv_db::models::fits_file::{CreateFitsFile, CreateFitsKeyValue, CreateFitsPosition};
use imgserv_db::repositories::fits_file_repo::{DATASET_KEY, FILTER_KEY};

/// Describe every image HDU of the file at `location` for the catalog.
///
/// Header cards are recorded per HDU. HDUs with a usable TAN WCS also get a
/// position row at their central pixel. `dataset_id` and `filter` are always
/// recorded as `DATASET` and `FILTER` rows on HDU 0, so lookup by those names
/// works; a header card with a different value is kept alongside.
pub fn describe_file(
    source: &dyn ImageSource,
    location: &ImageLocation,
    dataset_id: &str,
    filter: &str,
) -> Result<CreateFitsFile, CoreError> {
    let handle = source.open(location)?;
    let extensions = handle.extensions();
    if extensions.is_empty() {
        return Err(CoreError::CorruptImage(format!(
            "{location} has no image extensions"
        )));
    }

    let mut key_values = Vec::new();
    let mut positions = Vec::new();
    for ext in extensions {
        let hdu = hdu_number(ext.hdu)?;
        key_values.extend(CreateFitsKeyValue::from_header(hdu, &ext.header));

        match ext.wcs() {
            Ok(wcs) => {
                let center = PixelPoint::new(
                    (ext.width as f64 - 1.0) / 2.0,
                    (ext.height as f64 - 1.0) / 2.0,
                );
                let sky = wcs.pixel_to_sky(center);
                positions.push(CreateFitsPosition {
                    hdu,
                    equinox: ext.header.get_f64("EQUINOX"),
                    p_ra: sky.ra,
                    p_dec: sky.dec,
                    rot_ang: ext.header.get_f64("ROTANG"),
                    p_date: observation_date(&ext.header),
                });
            }
            Err(e) => {
                tracing::debug!(location = %location, hdu, error = %e, "No position for HDU");
            }
        }
    }

    for (key, value) in [(DATASET_KEY, dataset_id), (FILTER_KEY, filter)] {
        let existing: Vec<&str> = key_values
            .iter()
            .filter(|kv| kv.fits_key == key)
            .filter_map(|kv| kv.string_value.as_deref())
            .collect();
        if existing.iter().any(|v| v.trim().eq_ignore_ascii_case(value)) {
            continue;
        }
        if !existing.is_empty() {
            tracing::warn!(
                location = %location,
                key,
                header = ?existing,
                catalogued = value,
                "Header disagrees with the ingest argument, recording both"
            );
        }
        key_values.push(CreateFitsKeyValue {
            fits_key: key.to_string(),
            hdu: 0,
            string_value: Some(value.to_string()),
            int_value: None,
            double_value: None,
            line_num: None,
            comment: None,
        });
    }

    let last_hdu = extensions.iter().map(|e| e.hdu).max().unwrap_or(0);
    Ok(CreateFitsFile {
        file_name: location.as_str().to_string(),
        hdu_count: hdu_number(last_hdu + 1)?,
        key_values,
        positions,
    })
}

fn hdu_number(hdu: usize) -> Result<i16, CoreError> {
    i16::try_from(hdu).map_err(|_| CoreError::Validation(format!("HDU index {hdu} out of range")))
}

/// `DATE-OBS` as a UTC timestamp, when present and ISO formatted.
fn observation_date(header: &FitsHeader) -> Option<Timestamp> {
    let raw = header.get_str("DATE-OBS")?.trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use imgserv_core::fits::{Card, HeaderValue, ImagePlane};
    use imgserv_core::image::MemoryImageSource;
    use imgserv_core::region::SkyPoint;
    use imgserv_core::wcs::TanWcs;

    use super::*;

    fn image_with_wcs(extra: Vec<Card>) -> ImagePlane {
        let wcs = TanWcs::north_up(SkyPoint::new(150.0, 2.2), PixelPoint::new(49.5, 49.5), 0.2 / 3600.0)
            .unwrap();
        let mut header = FitsHeader::new();
        wcs.write_header(&mut header);
        for card in extra {
            header.push(card);
        }
        ImagePlane {
            header,
            width: 100,
            height: 100,
            pixels: vec![0.0; 100 * 100],
        }
    }

    #[test]
    fn records_cards_position_and_identity() {
        let plane = image_with_wcs(vec![Card::new(
            "DATE-OBS",
            HeaderValue::Text("2014-03-20T12:30:00.5".into()),
        )]);
        let source = MemoryImageSource::new().with_image("cosmos-i.fits", plane);

        let file = describe_file(
            &source,
            &ImageLocation::new("cosmos-i.fits"),
            "cosmos.calexp",
            "i",
        )
        .unwrap();

        assert_eq!(file.file_name, "cosmos-i.fits");
        assert_eq!(file.hdu_count, 1);
        assert_eq!(file.positions.len(), 1);
        let pos = &file.positions[0];
        assert!((pos.p_ra - 150.0).abs() < 1e-9);
        assert!((pos.p_dec - 2.2).abs() < 1e-9);
        assert!(pos.p_date.is_some());

        let dataset = file
            .key_values
            .iter()
            .find(|kv| kv.fits_key == DATASET_KEY)
            .unwrap();
        assert_eq!(dataset.string_value.as_deref(), Some("cosmos.calexp"));
        assert!(file.key_values.iter().any(|kv| kv.fits_key == "CRVAL1"));
    }

    fn filter_values(file: &CreateFitsFile) -> Vec<&str> {
        file.key_values
            .iter()
            .filter(|kv| kv.fits_key == FILTER_KEY)
            .filter_map(|kv| kv.string_value.as_deref())
            .collect()
    }

    #[test]
    fn matching_filter_card_is_not_duplicated() {
        let plane = image_with_wcs(vec![Card::new("FILTER", HeaderValue::Text("I".into()))]);
        let source = MemoryImageSource::new().with_image("a.fits", plane);

        let file = describe_file(&source, &ImageLocation::new("a.fits"), "hsc.raw", "i").unwrap();

        assert_eq!(filter_values(&file), vec!["I"]);
    }

    #[test]
    fn differing_filter_card_keeps_the_ingest_value_too() {
        let plane = image_with_wcs(vec![
            Card::new("FILTER", HeaderValue::Text("HSC-I".into())),
            Card::new("DATASET", HeaderValue::Text("hsc.raw".into())),
        ]);
        let source = MemoryImageSource::new().with_image("a.fits", plane);

        let file = describe_file(&source, &ImageLocation::new("a.fits"), "hsc.calexp", "i").unwrap();

        assert_eq!(filter_values(&file), vec!["HSC-I", "i"]);
        let datasets: Vec<_> = file
            .key_values
            .iter()
            .filter(|kv| kv.fits_key == DATASET_KEY)
            .filter_map(|kv| kv.string_value.as_deref())
            .collect();
        assert_eq!(datasets, vec!["hsc.raw", "hsc.calexp"]);
    }

    #[test]
    fn date_formats() {
        let mut header = FitsHeader::new();
        header.push(Card::new("DATE-OBS", HeaderValue::Text("2001-02-03".into())));
        assert_eq!(
            observation_date(&header).map(|t| t.to_rfc3339()),
            Some("2001-02-03T00:00:00+00:00".into())
        );

        let mut header = FitsHeader::new();
        header.push(Card::new("DATE-OBS", HeaderValue::Text("yesterday".into())));
        assert!(observation_date(&header).is_none());
    }
}
