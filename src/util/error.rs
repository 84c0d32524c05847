//! Error types for the BVH scene pipeline.

use thiserror::Error;

use crate::gpu::BufferId;

/// Main error type for pipeline, device and engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Asynchronous GPU readback reported an error
    #[error("GPU readback failed: {0}")]
    ReadbackFailed(String),

    /// Buffer id does not name a live buffer
    #[error("Unknown GPU buffer: {0:?}")]
    UnknownBuffer(BufferId),

    /// Write would run past the end of a buffer
    #[error("Write of {len} bytes at offset {offset} exceeds buffer size {size}")]
    WriteOutOfRange { offset: u64, len: usize, size: u64 },

    /// Mesh vertex layout cannot be consumed by the extraction kernel
    #[error("Unsupported vertex layout: {0}")]
    UnsupportedLayout(String),

    /// Triangle range does not fit in the vertex arena
    #[error("Triangles {offset}..{end} out of bounds (arena holds {available})")]
    RangeOutOfBounds {
        offset: usize,
        end: usize,
        available: usize,
    },

    /// Handle does not name a live BLAS
    #[error("Invalid BLAS handle: {0}")]
    InvalidHandle(u32),

    /// Acceleration engine refused or failed a BLAS build
    #[error("BLAS build failed: {0}")]
    BlasBuildFailed(String),

    /// Compressed BLAS data unavailable despite reported readiness
    #[error("BLAS geometry fetch failed for mesh {0}")]
    GeometryFetch(String),

    /// TLAS build failed
    #[error("TLAS build failed: {0}")]
    TlasBuildFailed(String),

    /// TLAS data unavailable after a successful build
    #[error("TLAS data fetch failed")]
    TlasFetch,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create a BLAS build error.
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::BlasBuildFailed(msg.into())
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::RangeOutOfBounds {
            offset: 10,
            end: 40,
            available: 30,
        };
        assert!(e.to_string().contains("10..40"));
        assert!(e.to_string().contains("30"));

        let e = Error::UnknownBuffer(BufferId(7));
        assert!(e.to_string().contains("7"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
