//! Repository for the `fits_files`, `fits_key_values` and `fits_positions`
//! tables.

use sqlx::PgPool;

use crate::models::fits_file::{
    CreateFitsFile, FitsFile, FitsKeyValue, FitsPosition, NearestFitsFile,
};

/// Column list for `fits_files` queries.
const COLUMNS: &str = "f.fits_file_id, f.file_name, f.hdu_count, f.created_at";

/// Header keyword naming the dataset (`<db>.<kind>`) a file belongs to.
pub const DATASET_KEY: &str = "DATASET";

/// Header keyword naming the filter band.
pub const FILTER_KEY: &str = "FILTER";

pub struct FitsFileRepo;

impl FitsFileRepo {
    /// Register a file together with its header cards and positions.
    pub async fn create(pool: &PgPool, input: &CreateFitsFile) -> Result<FitsFile, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let file = sqlx::query_as::<_, FitsFile>(
            "INSERT INTO fits_files (file_name, hdu_count) VALUES ($1, $2) \
             RETURNING fits_file_id, file_name, hdu_count, created_at",
        )
        .bind(&input.file_name)
        .bind(input.hdu_count)
        .fetch_one(&mut *tx)
        .await?;

        for kv in &input.key_values {
            sqlx::query(
                "INSERT INTO fits_key_values \
                 (fits_file_id, fits_key, hdu, string_value, int_value, double_value, line_num, comment) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(file.fits_file_id)
            .bind(&kv.fits_key)
            .bind(kv.hdu)
            .bind(&kv.string_value)
            .bind(kv.int_value)
            .bind(kv.double_value)
            .bind(kv.line_num)
            .bind(&kv.comment)
            .execute(&mut *tx)
            .await?;
        }

        for pos in &input.positions {
            sqlx::query(
                "INSERT INTO fits_positions \
                 (fits_file_id, hdu, equinox, p_ra, p_dec, rot_ang, p_date) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(file.fits_file_id)
            .bind(pos.hdu)
            .bind(pos.equinox)
            .bind(pos.p_ra)
            .bind(pos.p_dec)
            .bind(pos.rot_ang)
            .bind(pos.p_date)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(file)
    }

    pub async fn find_by_name(
        pool: &PgPool,
        file_name: &str,
    ) -> Result<Option<FitsFile>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM fits_files f WHERE f.file_name = $1");
        sqlx::query_as::<_, FitsFile>(&query)
            .bind(file_name)
            .fetch_optional(pool)
            .await
    }

    /// First file whose headers carry `DATASET = dataset_id` and
    /// `FILTER = filter`, compared case-insensitively.
    pub async fn find_for_dataset(
        pool: &PgPool,
        dataset_id: &str,
        filter: &str,
    ) -> Result<Option<FitsFile>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM fits_files f \
             WHERE EXISTS ( \
                 SELECT 1 FROM fits_key_values kv \
                 WHERE kv.fits_file_id = f.fits_file_id \
                   AND kv.fits_key = $1 AND lower(kv.string_value) = lower($2)) \
               AND EXISTS ( \
                 SELECT 1 FROM fits_key_values kv \
                 WHERE kv.fits_file_id = f.fits_file_id \
                   AND kv.fits_key = $3 AND lower(kv.string_value) = lower($4)) \
             ORDER BY f.fits_file_id \
             LIMIT 1"
        );
        sqlx::query_as::<_, FitsFile>(&query)
            .bind(DATASET_KEY)
            .bind(dataset_id)
            .bind(FILTER_KEY)
            .bind(filter)
            .fetch_optional(pool)
            .await
    }

    /// File of `dataset_id` and `filter` whose recorded HDU centre is nearest
    /// to `(ra, dec)`. Distance is the flat-sky approximation with the RA
    /// difference wrapped and scaled by `cos(dec)`; it is returned in square
    /// degrees.
    pub async fn find_nearest(
        pool: &PgPool,
        dataset_id: &str,
        filter: &str,
        ra: f64,
        dec: f64,
    ) -> Result<Option<NearestFitsFile>, sqlx::Error> {
        sqlx::query_as::<_, NearestFitsFile>(
            "SELECT f.fits_file_id, f.file_name, p.hdu, \
                    (power(least(abs(p.p_ra - $1), 360 - abs(p.p_ra - $1)) * cos(radians($2)), 2) \
                     + power(p.p_dec - $2, 2)) AS distance \
             FROM fits_positions p \
             JOIN fits_files f ON f.fits_file_id = p.fits_file_id \
             WHERE EXISTS ( \
                 SELECT 1 FROM fits_key_values kv \
                 WHERE kv.fits_file_id = f.fits_file_id \
                   AND kv.fits_key = $3 AND lower(kv.string_value) = lower($4)) \
               AND EXISTS ( \
                 SELECT 1 FROM fits_key_values kv \
                 WHERE kv.fits_file_id = f.fits_file_id \
                   AND kv.fits_key = $5 AND lower(kv.string_value) = lower($6)) \
             ORDER BY distance ASC, f.fits_file_id ASC \
             LIMIT 1",
        )
        .bind(ra)
        .bind(dec)
        .bind(DATASET_KEY)
        .bind(dataset_id)
        .bind(FILTER_KEY)
        .bind(filter)
        .fetch_optional(pool)
        .await
    }

    pub async fn key_values(
        pool: &PgPool,
        fits_file_id: i64,
    ) -> Result<Vec<FitsKeyValue>, sqlx::Error> {
        sqlx::query_as::<_, FitsKeyValue>(
            "SELECT fits_file_id, fits_key, hdu, string_value, int_value, double_value, \
                    line_num, comment \
             FROM fits_key_values WHERE fits_file_id = $1 \
             ORDER BY hdu, line_num",
        )
        .bind(fits_file_id)
        .fetch_all(pool)
        .await
    }

    pub async fn positions(
        pool: &PgPool,
        fits_file_id: i64,
    ) -> Result<Vec<FitsPosition>, sqlx::Error> {
        sqlx::query_as::<_, FitsPosition>(
            "SELECT fits_file_id, hdu, equinox, p_ra, p_dec, rot_ang, p_date \
             FROM fits_positions WHERE fits_file_id = $1 ORDER BY hdu",
        )
        .bind(fits_file_id)
        .fetch_all(pool)
        .await
    }

    /// Remove a file and, by cascade, its cards and positions.
    pub async fn delete(pool: &PgPool, fits_file_id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM fits_files WHERE fits_file_id = $1")
            .bind(fits_file_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
