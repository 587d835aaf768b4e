use tempo_core::store::StoreError;
use thiserror::Error;

pub mod approval_record;

pub use approval_record::SqlApprovalRecordStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Decode(message) => StoreError::Decode(message),
            RepositoryError::Database(sqlx::Error::PoolTimedOut) => StoreError::Timeout,
            RepositoryError::Database(
                source @ (sqlx::Error::ColumnDecode { .. }
                | sqlx::Error::Decode(_)
                | sqlx::Error::ColumnNotFound(_)),
            ) => StoreError::Decode(source.to_string()),
            // Busy or locked databases, I/O and pool shutdown are transient.
            RepositoryError::Database(source) => StoreError::Unavailable(source.to_string()),
        }
    }
}
