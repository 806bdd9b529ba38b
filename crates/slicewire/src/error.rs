use crate::exception::UserException;

/// Errors produced while marshalling or unmarshalling a message.
///
/// All variants are fail-fast: the stream never retries or repairs corrupt
/// input, it reports the condition at the point of detection and the caller
/// decides. Detection-site context (position, requested width, limits) is
/// carried as structured fields rather than formatted strings.
#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    /// A read would consume bytes past the end of the buffer, or a declared
    /// region, slice, or sequence extends past the available data.
    #[error("unmarshal out of bounds at byte {position} (requested {requested}, available {available})")]
    UnmarshalOutOfBounds {
        position: usize,
        requested: usize,
        available: usize,
    },

    /// A buffer resize would exceed the configured maximum message size.
    #[error("memory limit exceeded ({requested} bytes, max {max})")]
    MemoryLimitExceeded { requested: usize, max: usize },

    /// A decoded size, count, or encapsulation length is negative.
    #[error("negative size on the wire: {value}")]
    NegativeSize { value: i32 },

    /// An encapsulation's major encoding version differs from ours, or its
    /// minor version is higher than we understand.
    #[error("unsupported encoding version {major}.{minor}")]
    UnsupportedEncoding { major: u8, minor: u8 },

    /// A decoded string is not valid UTF-8.
    #[error("invalid string: {0}")]
    InvalidString(#[from] std::string::FromUtf8Error),

    /// Every slice of a marshalled exception was skipped without finding a
    /// registered factory. Carries the most-derived type id seen.
    #[error("unknown user exception: {type_id}")]
    UnknownUserException { type_id: String },

    /// A user exception decoded successfully. Its "successful decode" is by
    /// design an error signal to the invoking layer, not a value.
    #[error("user exception: {0}")]
    UserError(Box<dyn UserException>),
}

pub type Result<T> = std::result::Result<T, MarshalError>;
