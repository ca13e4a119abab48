//! Subcommand handlers

pub mod restore;
pub mod run;
pub mod status;
