//! Command line parsing for the operator binary

pub mod args;

pub use args::{parse_args, validate_args, Args, Command};
