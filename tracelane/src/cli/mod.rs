//! Command-line interface for the session controller binary.

pub mod args;

pub use args::{Args, DetailPolicyArg};
