//! Compose definition format.
//!
//! This module parses compose documents (the `services` / `volumes` /
//! `networks` YAML format) into raw types. The `manifest` module resolves
//! them into the validated, ID-indexed model the engine runs on.

pub mod ordered;
pub mod parser;
pub mod types;


pub use ordered::OrderedMap;
pub use parser::ComposeParser;
pub use types::*;
