use crate::device::DeviceError;
use thiserror::Error;

/// Why a validation attempt was rejected.
///
/// The external wire line never carries this level of detail — callers get a
/// generic `ERR <reason>` while the full kind is logged server-side.
/// Signature rejections are not represented here: they have to carry the
/// response-signing key (null key for unknown clients) and live in
/// [`crate::signature::SignatureCheck`].
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed code")]
    BadInput,

    #[error("validation mode disabled: {0}")]
    ModeDisabled(&'static str),

    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("counter already accepted (replay)")]
    Replayed,

    #[error("no matching counter or time step")]
    InvalidCode,

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, ValidationError>;
