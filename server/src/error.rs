use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("token rejected")]
    Rejected,

    #[error("token verification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("token verifier responded with status {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("session directory request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("session directory responded with status {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("request to executor failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("executor responded with status {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed update: {0}")]
    Decode(String),

    #[error("update rejected by document: {0}")]
    Apply(String),

    #[error("document room is closed")]
    RoomClosed,
}
