// exapatch-runtime: Remote execution, staging, ledger persistence, tool sessions, health checks
// Depends on exapatch-core

pub mod executor;
#[cfg(any(test, feature = "mock"))]
pub mod executor_mock;
pub mod filter;
pub mod health;
pub mod inspect;
pub mod ledger_store;
pub mod parallel;
pub mod session;
pub mod sink;
pub mod staging;
pub mod vm;
