#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The packet ended in the middle of a field.
    #[error("packet truncated")]
    Truncated,

    /// A string field claims more bytes than any peer may legitimately send.
    #[error("string field too long: {0} bytes")]
    StringTooLong(usize),

    /// A text field was not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    Utf8(#[from] std::str::Utf8Error),

    /// The message number is not a connection-layer message.
    #[error("unknown message number {0}")]
    UnknownMessage(u8),

    /// Bytes were left over after the last field of the message.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// A boolean field held something other than 0 or 1.
    #[error("invalid boolean value {0}")]
    InvalidBool(u8),
}
