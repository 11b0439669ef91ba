//! Context Budgeting Module
//!
//! Token accounting for passages handed to the answer generator.

pub mod tokens;

pub use tokens::{estimate_tokens_quick, TokenCounter};
