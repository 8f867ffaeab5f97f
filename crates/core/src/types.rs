/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier assigned to a cutout job when it is enqueued.
pub type JobId = uuid::Uuid;
