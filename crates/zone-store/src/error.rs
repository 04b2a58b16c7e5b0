use thiserror::Error;
use zone_core::RegionError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("malformed coordinates: {0}")]
    Coordinates(#[from] serde_json::Error),

    #[error("region {0} not found")]
    NotFound(i64),

    #[error("invalid region: {0}")]
    InvalidRegion(#[from] RegionError),

    #[error("no fields to update")]
    EmptyUpdate,

    #[error("store connection lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;
