//! The wire protocol: tag-length-value items inside length-prefixed
//! frames.

pub mod codec;
pub mod message;
pub mod tags;
