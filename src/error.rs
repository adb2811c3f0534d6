//! Error types of the pipeline.
//!
//! Each layer has its own error enum. Cache errors never leave the [`CacheGateway`](crate::gateway::CacheGateway);
//! they are logged there and turned into neutral values. Store errors do propagate out of the direct-write path.
use std::time::Duration;

use sea_orm::DbErr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend cannot be reached or the connection broke. Only this kind flips gateway availability.
    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache command failed: {0}")]
    Command(String),

    #[error("cache payload could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub fn is_connection(&self) -> bool {
        matches!(self, CacheError::Connection(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            CacheError::Connection(err.to_string())
        }
        else {
            CacheError::Command(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbErr),

    #[error("film #{0} does not exist")]
    UnknownFilm(i32),

    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum ViewCountError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("migration failed: {0}")]
    Migration(DbErr),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<DbErr> for ViewCountError {
    fn from(err: DbErr) -> Self {
        ViewCountError::Store(StoreError::Db(err))
    }
}

pub type Result<T, E = ViewCountError> = std::result::Result<T, E>;
