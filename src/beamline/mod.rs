pub mod beam;
pub mod chunk;
pub mod common;
pub mod config;
pub mod scope;

pub use common::{Error, ErrorKind, Result};
