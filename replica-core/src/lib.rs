//! Replica Core Library
//!
//! This library provides the shared vocabulary of the replicated state
//! machine: terms, log indexes, member identities, the member roster and
//! the error taxonomy used across all crates.

pub mod error;
pub mod roster;
pub mod types;

pub use error::*;
pub use roster::*;
pub use types::*;
