use strand_index::IndexError;
use strand_persist::PersistError;
use strand_store::StoreError;

/// Errors from cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
