//! Core constants, error types and collaborator traits.
//!
//! These are shared by every layer and carry no runtime dependencies.

pub mod constants;
mod error;
mod traits;

pub use error::*;
pub use traits::*;
