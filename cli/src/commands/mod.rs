//! Command implementations

pub mod review;
pub mod run;
pub mod version;
