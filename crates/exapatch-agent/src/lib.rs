// exapatch-agent: Patch orchestrator, request schema, launch-node rotation, plugin hooks
// Depends on exapatch-core, exapatch-runtime

pub mod orchestrator;
pub mod plan;
pub mod plugins;
pub mod request;

pub use orchestrator::{Collaborators, PatchOrchestrator, Phase, RunSummary};
pub use request::PatchRequest;
