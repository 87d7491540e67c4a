use thiserror::Error;

/// Errors produced while decoding bencoded input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// Input ended in the middle of a value.
    #[error("truncated input")]
    Truncated,

    /// A byte that cannot start or continue a value at this position.
    #[error("unexpected byte {0:#04x} at offset {1}")]
    UnexpectedByte(u8, usize),

    /// Malformed integer (empty, leading zeros, or `-0`).
    #[error("invalid integer")]
    InvalidInteger,

    /// Malformed string length prefix.
    #[error("invalid string length")]
    InvalidLength,

    /// Dictionary keys out of bytewise order or duplicated.
    #[error("dictionary keys not sorted and unique")]
    UnorderedKeys,

    /// Dictionary key was not a byte string.
    #[error("dictionary key is not a string")]
    NonStringKey,

    /// Nesting exceeded the depth limit.
    #[error("nesting too deep")]
    TooDeep,

    /// Bytes remained after the outermost value.
    #[error("trailing data after value")]
    TrailingData,
}
