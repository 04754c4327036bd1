//! Utility functions for key derivation and payload classification.

mod keys;
mod truthy;

pub use keys::content_key;
pub use truthy::is_truthy;
