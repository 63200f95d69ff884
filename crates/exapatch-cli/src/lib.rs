// exapatch-cli: Clap commands and colored terminal output
// Depends on exapatch-core, exapatch-runtime, exapatch-agent

pub mod commands;
pub mod ui;

pub use commands::run;
