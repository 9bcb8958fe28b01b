//! Request and response model shared by every dispatcher.
//!
//! This module re-exports types from `request::types`.

pub mod types;

pub use types::*;
