//! # Configuration Module
//!
//! Centralizes the keydir's configuration constants. Interdependent values
//! are co-located and their relationships enforced through compile-time
//! assertions.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency
//!   documentation

pub mod constants;
pub use constants::*;
