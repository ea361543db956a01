/// A tile payload that could not be read at all. Only the affected tile fails.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    /// The payload looked compressed but did not inflate.
    #[error("unable to decompress tile payload: {0}")]
    Decompress(#[source] std::io::Error),

    /// The payload is not a protobuf encoded vector tile.
    #[error("payload is not a vector tile: {0}")]
    InvalidTile(String),
}

/// A corrupt geometry command stream. Only the affected feature is dropped.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CommandStreamError {
    /// Command id other than `MoveTo`, `LineTo` or `ClosePath`.
    #[error("unknown geometry command {0}")]
    UnknownCommand(u32),

    /// The stream ended before all parameters of the command at this position were read.
    #[error("command at position {0} is missing parameters")]
    Truncated(usize),

    /// `LineTo` or `ClosePath` was issued before the ring was started.
    #[error("ring drawn before any MoveTo")]
    NoCurrentRing,

    /// Polygon rings must start with exactly one `MoveTo`.
    #[error("MoveTo repeated {0} times in a polygon")]
    RepeatedMoveTo(u32),

    /// The cursor left the `i32` coordinate range.
    #[error("coordinate overflow")]
    Overflow,
}
