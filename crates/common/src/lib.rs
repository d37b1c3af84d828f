//! Types shared by the mail notifier crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
