//! # Configuration Module
//!
//! Centralizes every numeric constant of the on-disk format and the runtime.
//! Interdependent values live next to each other in [`constants`] and are
//! enforced through compile-time assertions, so a geometry change that would
//! corrupt existing files fails the build instead of the database.

pub mod constants;
pub use constants::*;
