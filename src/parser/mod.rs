use thiserror::Error;

use crate::models::ReadingSet;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Bad checksum or structure, the whole frame is dropped
    #[error("Malformed frame: {0}")]
    Malformed(String),
    /// One entry the parser does not understand, only that entry is skipped
    #[error("Unsupported entry: {0}")]
    Unsupported(String),
}

/// Turns one raw device frame into readings. Implementations do no I/O.
pub trait FrameParser: Send {
    fn parse(&self, frame: &[u8]) -> Result<ReadingSet, ParseError>;
}
