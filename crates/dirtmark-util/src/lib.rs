#![forbid(unsafe_code)]
//! Hashing, filesystem, and process helpers shared by the dirtmark crates.

pub mod error;
pub mod fs;
pub mod hash;
pub mod process;
