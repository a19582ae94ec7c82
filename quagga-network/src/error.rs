//! Transport errors.
//!
//! Socket errors and parse errors both close the connection; outbound
//! connections then re-enter the reconnect schedule. Illegal-message
//! conditions additionally add to the peer's ban score.

use displaydoc::Display;
use thiserror::Error;

#[derive(Error, Debug, Display)]
pub enum Error {
    /// io error: {0}
    Io(#[from] std::io::Error),
    /// malformed frame: {0}
    Parse(&'static str),
    /// frame exceeds the maximum message size
    OversizedFrame,
    /// peer does not speak this protocol
    NotOurProtocol,
    /// chunked message reassembly violated: {0}
    IllegalChunk(&'static str),
    /// unknown service {0}
    UnknownService(u32),
    /// the connection was closed
    Closed,
    /// the endpoint is banned
    Banned,
}

impl Error {
    /// The ban score this failure adds to the peer, if any.
    pub fn ban_score(&self) -> u32 {
        use crate::constants::ILLEGAL_MESSAGE_SCORE;
        match self {
            Error::Parse(_)
            | Error::IllegalChunk(_)
            | Error::UnknownService(_)
            | Error::OversizedFrame => ILLEGAL_MESSAGE_SCORE,
            _ => 0,
        }
    }
}
