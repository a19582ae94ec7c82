//! Proof-of-work arithmetic: compact difficulty encodings, expanded
//! 256-bit targets, and cumulative chain work.

pub mod difficulty;
