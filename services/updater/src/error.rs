/// Failures inside one pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Db(#[from] sb_db::DbError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Bus(#[from] sb_bus::BusError),
    /// A downstream stage hung up; its own failure carries the root cause.
    #[error("pipeline stage output closed early")]
    PipeClosed,
    #[error("row without a usable primary key in `{0}`")]
    BadRow(String),
    #[error("stage task failed: {0}")]
    Join(String),
}
