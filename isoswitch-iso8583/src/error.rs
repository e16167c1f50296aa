use isoswitch_core::error::GatewayError;
use thiserror::Error;

/// Framing and field codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid length header {0:?}")]
    InvalidLengthHeader(String),

    #[error("Invalid message type indicator")]
    InvalidMti,

    #[error("Missing message type indicator")]
    MissingMti,

    #[error("Invalid bitmap")]
    InvalidBitmap,

    #[error("Field {0} has no format definition")]
    UnknownField(u16),

    #[error("Message truncated in field {0}")]
    Truncated(u16),

    #[error("Field {field} has invalid length {len}")]
    FieldLength { field: u16, len: usize },

    #[error("Field {0} is not ASCII")]
    NotAscii(u16),
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

impl From<CodecError> for GatewayError {
    fn from(err: CodecError) -> Self {
        Self::codec(err.to_string())
    }
}
