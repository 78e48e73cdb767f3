use crate::Extent;

/// Recoverable errors raised at the engine's outer surfaces.
///
/// Contract violations inside a running pass are not represented here: they
/// panic, because a mis-accounted fan-in would corrupt the pass in flight.
#[derive(Debug, thiserror::Error)]
pub enum SluiceError {
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Extent, got: Extent },

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
