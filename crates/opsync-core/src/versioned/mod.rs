//! Versioned, signed objects and their at-rest files.

pub mod file;
mod signed;

pub use signed::{ObjectHeader, PayloadKey, SignedData};
