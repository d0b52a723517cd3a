pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod invocation;
pub mod paths;

pub use error::{Error, Result};
