//! # exapatch: Exadata infrastructure patch orchestration
//!
//! Facade crate that re-exports the exapatch workspace crates so consumers
//! can depend on a single `exapatch` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | exapatch-core | Targets, versions, error codes, ledger document, config, logging |
//! | [`runtime`] | exapatch-runtime | Remote execution, node filter, staging, ledger replicas, tool sessions, health checks |
//! | [`agent`] | exapatch-agent | Request schema, launch-node rotation, plugin hooks, patch orchestrator |
//! | [`cli`] | exapatch-cli | Clap commands and terminal output |

pub use exapatch_agent as agent;
pub use exapatch_cli as cli;
pub use exapatch_core as core;
pub use exapatch_runtime as runtime;
