use std::io;

use thiserror::Error;

/// What went wrong while reading or writing a consensus structure.
///
/// `Io` is the transport's fault (short reads included, as
/// `UnexpectedEof`); `Parse` means the bytes arrived but do not form the
/// structure they claim to be.
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("parse error: {0}")]
    Parse(&'static str),
}
