use thiserror::Error;

/// Errors surfaced by the linking and clustering engine and its collaborators.
///
/// "Nothing qualified" is never an error: operations return an empty list for
/// that case. Anything here means an upstream call actually failed.
#[derive(Debug, Error)]
pub enum Error {
    /// The relational store rejected a read or write.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The vector index failed a query, lookup or insert.
    #[error("index error: {0}")]
    Index(String),

    /// The embedding provider could not embed the given text.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Edge metadata could not be encoded or decoded.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Index("collection missing".into());
        assert_eq!(err.to_string(), "index error: collection missing");
    }

    #[test]
    fn test_store_error_converts() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(err.to_string().starts_with("store error"));
    }
}
