/// Data-access failures.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("column `{column}` has unsupported type {ty}")]
    UnsupportedColumn { column: String, ty: String },
    #[error("unknown transcoding schema `{0}`")]
    UnknownSchema(String),
}
