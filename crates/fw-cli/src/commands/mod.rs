//! CLI subcommand implementations.

pub mod activity;
pub mod fills;
pub mod repair;
pub mod replay;
pub mod run;
pub mod sessions;
pub mod status;
pub mod util;
