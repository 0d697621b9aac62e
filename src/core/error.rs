//! Error types for rtiview

use thiserror::Error;

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown index type: {0:?} (expected MORTON_SUM, SLIPPY_MAP or IIIF)")]
    UnknownIndexType(String),

    #[error("Unknown request mode: {0:?} (expected INCREMENTAL or DIRECT)")]
    UnknownRequestMode(String),

    #[error("Unknown geometry type: {0:?} (expected TILE_ALIGNED_GRID, PLANE or GRID)")]
    UnknownGeometryKind(String),

    #[error("Invalid level count: {0} (must be between 1 and 12)")]
    InvalidLevelCount(u32),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Runtime error: {0}")]
    Runtime(String),
}
