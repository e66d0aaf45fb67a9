/// Errors raised while encoding, decoding or converting wire values.
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    /// The buffer ended before a field was fully read.
    #[error("buffer exhausted: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A tagged value carried an unknown type tag.
    #[error("unknown value tag 0x{0:02x}")]
    UnknownTag(u8),

    /// A value did not have the type the caller asked for.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in string field: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Bytes were left over after the last expected field.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// Containers nested deeper than the decoder allows.
    #[error("values nested deeper than {0} levels")]
    TooDeep(usize),

    /// A type signature could not be parsed.
    #[error("invalid type signature '{0}'")]
    InvalidSignature(String),

    /// A literal could not be parsed for the given signature.
    #[error("cannot parse '{literal}' as {signature}")]
    InvalidLiteral { signature: String, literal: String },

    /// A method argument was missing.
    #[error("missing argument #{0}")]
    MissingArgument(usize),

    /// More arguments were supplied than the method takes.
    #[error("expected {expected} arguments, got {found}")]
    UnexpectedArguments { expected: usize, found: usize },
}

pub type Result<T> = std::result::Result<T, SerialError>;
