pub mod error;
pub mod models;
pub mod services;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{ProvisionError, Result};
