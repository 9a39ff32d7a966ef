pub mod codec;
pub mod error;
pub mod memory_access;
pub mod variable_model;
pub mod symbol_binding;
pub mod capture;
#[cfg(feature = "process")]
pub mod process;

pub use error::{Error, Result};
