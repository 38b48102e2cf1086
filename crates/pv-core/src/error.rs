//! Error types for Polyvox
//!
//! These only surface on the control path (configuration, layout
//! negotiation, state I/O). The audio path is infallible: it clamps,
//! saturates, or no-ops instead of returning errors.

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum PvError {
    #[error("unsupported bus layout: {0}")]
    InvalidLayout(String),

    #[error("sidechain input selected but not connected")]
    SidechainDisabled,

    #[error("invalid pitch detection range: {min_hz}..{max_hz} Hz")]
    InvalidPitchRange { min_hz: f64, max_hz: f64 },

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("state error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type PvResult<T> = Result<T, PvError>;
