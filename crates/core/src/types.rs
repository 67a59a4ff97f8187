/// Worker ids are free-form strings chosen by the model configuration.
pub type WorkerId = String;

/// Job ids are issued by the external job store.
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
