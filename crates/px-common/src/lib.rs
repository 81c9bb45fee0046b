pub mod error;
pub mod scope;

pub use error::{Error, Result, TeardownError};
pub use scope::ReleaseStack;
