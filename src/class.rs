//! The parsed class model the engine consumes. Producing it from class-file bytes is the
//! concern of an external parser; [`builder`] assembles it directly for hosts and tests.

pub mod builder;
mod structs;

pub use structs::*;
