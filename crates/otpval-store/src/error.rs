use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("corrupt record for {identity}: {detail}")]
    Corrupt { identity: String, detail: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
