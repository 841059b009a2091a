mod parser;
mod timeline;

pub use timeline::{Timeline, Track, TrackSelection};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed MIDI data: {0}")]
    Malformed(String),

    #[error("score contains no notes")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<midly::Error> for ParseError {
    fn from(e: midly::Error) -> Self {
        ParseError::Malformed(e.to_string())
    }
}
