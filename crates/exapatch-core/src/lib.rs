// exapatch-core: Pure types, error codes, ledger document, config, utilities
// Foundation crate with no internal exapatch dependencies.

pub mod config;
pub mod error;
pub mod ledger;
pub mod observability;
pub mod outcome;
pub mod retry;
pub mod target;
pub mod time;
pub mod version;
