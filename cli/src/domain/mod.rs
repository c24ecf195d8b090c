//! Domain layer — pure types and validation, no I/O.

pub mod config;
pub mod error;
pub mod validate;
