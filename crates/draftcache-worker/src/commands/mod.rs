//! Command implementations for the worker CLI.
//!
//! Each submodule implements the logic for one subcommand.

pub mod replay;
pub mod run;
pub mod status;
