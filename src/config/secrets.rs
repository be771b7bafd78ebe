//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers don't need a direct secrecy
//! dependency to work with the connection string.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
