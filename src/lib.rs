pub mod daemon;
pub mod error;
pub mod runenv;

pub use error::{RelayError, Result};
