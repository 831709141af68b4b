/// Job identifiers are UUIDv7 (time-ordered, assigned at creation).
pub type JobId = uuid::Uuid;

/// Identifier of the principal that submitted a job.
pub type OwnerId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
