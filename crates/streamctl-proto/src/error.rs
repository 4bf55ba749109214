// error.rs -- shared error taxonomy for the control/input channel core

use thiserror::Error;

/// Errors that can surface from the codec, transport, or session layers.
///
/// Every variant maps to one of the callback-visible outcomes described in
/// the error handling design: transport and crypto failures propagate up to
/// `connectionTerminated`, while `Runt` packets are dropped silently after a
/// trace log and `QueueFull`/`AllocFail` promote to an IDR request instead
/// of failing the caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport failure: {0}")]
    TransportFail(String),

    #[error("crypto failure: {0}")]
    CryptoFail(String),

    #[error("packet shorter than its declared header ({got} < {want} bytes)")]
    Runt { got: usize, want: usize },

    #[error("invalidation queue is full")]
    QueueFull,

    #[error("allocation failed")]
    AllocFail,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type CoreResult<T> = Result<T, CoreError>;
