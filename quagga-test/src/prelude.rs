//! Common imports for test code.

pub use color_eyre::eyre::{bail, ensure, eyre, Report, Result, WrapErr};
pub use pretty_assertions::{assert_eq, assert_ne};
