pub mod common;
pub mod config;
pub mod pg;

pub use common::{Error, ErrorKind, Result};
