use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::target::{Operation, Stage, TargetKind};
use crate::time::utc_now;

/// Status of one ledger stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Sleeping,
}

impl std::fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Sleeping => write!(f, "sleeping"),
        }
    }
}

/// Validate that a stage transition is allowed.
///
/// Writing the same status again is a no-op and always allowed.
pub fn validate_transition(from: PatchStatus, to: PatchStatus) -> Result<()> {
    if from == to {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        // Start work
        (PatchStatus::Pending, PatchStatus::Running)
        // Nothing to do for this node
        | (PatchStatus::Pending, PatchStatus::Completed)
        // Inter-node wait
        | (PatchStatus::Pending, PatchStatus::Sleeping)
        | (PatchStatus::Sleeping, PatchStatus::Running)
        | (PatchStatus::Sleeping, PatchStatus::Pending)
        // Finish
        | (PatchStatus::Running, PatchStatus::Completed)
        | (PatchStatus::Running, PatchStatus::Failed)
        // Retry of a failed stage
        | (PatchStatus::Failed, PatchStatus::Running)
    );

    if !valid {
        bail!("Invalid ledger transition: {} -> {}", from, to);
    }
    Ok(())
}

/// `"yes"` / `"no"` flag kept for compatibility with status consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SleepFlag {
    Yes,
    #[default]
    No,
}

/// Per-node entry of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProgress {
    pub node_name: String,
    pub target_type: TargetKind,
    #[serde(default)]
    pub patchmgr_start_time: Option<String>,
    pub last_updated_time: String,
    pub status: PatchStatus,
    #[serde(default)]
    pub status_details: String,
    /// Console-log directory of the tool invocation that last touched this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
    pub stages: BTreeMap<Stage, PatchStatus>,
}

impl NodeProgress {
    pub fn new(node: &str, kind: TargetKind) -> Self {
        let stages = kind
            .profile()
            .stages
            .iter()
            .map(|s| (*s, PatchStatus::Pending))
            .collect();
        Self {
            node_name: node.to_string(),
            target_type: kind,
            patchmgr_start_time: None,
            last_updated_time: utc_now(),
            status: PatchStatus::Pending,
            status_details: String::new(),
            log_dir: None,
            stages,
        }
    }

    /// Roll the stage statuses up into the node's overall status.
    pub fn derived_status(&self) -> PatchStatus {
        let has = |s: PatchStatus| self.stages.values().any(|v| *v == s);
        if has(PatchStatus::Failed) {
            PatchStatus::Failed
        } else if has(PatchStatus::Running) {
            PatchStatus::Running
        } else if has(PatchStatus::Sleeping) {
            PatchStatus::Sleeping
        } else if !self.stages.is_empty()
            && self.stages.values().all(|v| *v == PatchStatus::Completed)
        {
            PatchStatus::Completed
        } else {
            PatchStatus::Pending
        }
    }
}

/// The persisted progress ledger for one target kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDocument {
    pub target_type: TargetKind,
    /// Operation that wrote the ledger; progress is only resumed by the same one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    #[serde(default)]
    pub active_launch_node: Option<String>,
    #[serde(default)]
    pub launch_nodes: Vec<String>,
    #[serde(default)]
    pub sleep_infra_patch: SleepFlag,
    #[serde(default)]
    pub node_patching_progress_data: Vec<NodeProgress>,
}

impl LedgerDocument {
    pub fn new(kind: TargetKind, nodes: &[String], launch_nodes: &[String]) -> Self {
        Self {
            target_type: kind,
            operation: None,
            active_launch_node: launch_nodes.first().cloned(),
            launch_nodes: launch_nodes.to_vec(),
            sleep_infra_patch: SleepFlag::No,
            node_patching_progress_data: nodes.iter().map(|n| NodeProgress::new(n, kind)).collect(),
        }
    }

    pub fn with_operation(mut self, op: Operation) -> Self {
        self.operation = Some(op);
        self
    }

    pub fn node(&self, name: &str) -> Option<&NodeProgress> {
        self.node_patching_progress_data
            .iter()
            .find(|n| n.node_name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut NodeProgress> {
        self.node_patching_progress_data
            .iter_mut()
            .find(|n| n.node_name == name)
    }

    /// Status of a node's stage; `None` when the node or stage is not tracked.
    pub fn stage(&self, name: &str, stage: Stage) -> Option<PatchStatus> {
        self.node(name).and_then(|n| n.stages.get(&stage).copied())
    }

    /// Apply a validated stage transition and refresh the derived fields.
    pub fn set_stage(&mut self, name: &str, stage: Stage, status: PatchStatus) -> Result<()> {
        let kind = self.target_type;
        if self.node(name).is_none() {
            self.node_patching_progress_data
                .push(NodeProgress::new(name, kind));
        }
        let Some(node) = self.node_mut(name) else {
            bail!("Node {} missing from ledger", name);
        };
        let Some(current) = node.stages.get(&stage).copied() else {
            bail!("Stage {} is not tracked for {} targets", stage, kind);
        };
        validate_transition(current, status)?;

        node.stages.insert(stage, status);
        if stage == Stage::PatchMgr && status == PatchStatus::Running {
            node.patchmgr_start_time = Some(utc_now());
        }
        node.status = node.derived_status();
        node.last_updated_time = utc_now();
        Ok(())
    }

    /// Nodes whose every tracked stage is completed.
    pub fn completed_nodes(&self) -> Vec<String> {
        self.node_patching_progress_data
            .iter()
            .filter(|n| n.derived_status() == PatchStatus::Completed)
            .map(|n| n.node_name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_valid_transitions() {
        assert!(validate_transition(PatchStatus::Pending, PatchStatus::Running).is_ok());
        assert!(validate_transition(PatchStatus::Running, PatchStatus::Completed).is_ok());
        assert!(validate_transition(PatchStatus::Running, PatchStatus::Failed).is_ok());
        assert!(validate_transition(PatchStatus::Failed, PatchStatus::Running).is_ok());
        assert!(validate_transition(PatchStatus::Completed, PatchStatus::Completed).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(validate_transition(PatchStatus::Completed, PatchStatus::Running).is_err());
        assert!(validate_transition(PatchStatus::Pending, PatchStatus::Failed).is_err());
        assert!(validate_transition(PatchStatus::Completed, PatchStatus::Pending).is_err());
        assert!(validate_transition(PatchStatus::Failed, PatchStatus::Completed).is_err());
    }

    #[test]
    fn test_document_stage_updates() {
        let mut doc = LedgerDocument::new(TargetKind::Dom0, &nodes(&["a", "b"]), &nodes(&["a"]));
        assert_eq!(doc.active_launch_node.as_deref(), Some("a"));
        assert_eq!(doc.stage("b", Stage::PatchMgr), Some(PatchStatus::Pending));

        doc.set_stage("b", Stage::PatchMgr, PatchStatus::Running).unwrap();
        let b = doc.node("b").unwrap();
        assert_eq!(b.status, PatchStatus::Running);
        assert!(b.patchmgr_start_time.is_some());

        assert!(doc.set_stage("b", Stage::PatchMgr, PatchStatus::Pending).is_err());
    }

    #[test]
    fn test_stage_not_tracked_for_cells() {
        let mut doc = LedgerDocument::new(TargetKind::Cell, &nodes(&["cel1"]), &nodes(&["db1"]));
        assert!(doc.set_stage("cel1", Stage::PrePatch, PatchStatus::Running).is_err());
        doc.set_stage("cel1", Stage::PatchMgr, PatchStatus::Completed).unwrap();
        assert_eq!(doc.completed_nodes(), vec!["cel1".to_string()]);
    }

    #[test]
    fn test_derived_status_precedence() {
        let mut p = NodeProgress::new("a", TargetKind::Dom0);
        assert_eq!(p.derived_status(), PatchStatus::Pending);
        p.stages.insert(Stage::PrePatch, PatchStatus::Completed);
        p.stages.insert(Stage::PatchMgr, PatchStatus::Sleeping);
        assert_eq!(p.derived_status(), PatchStatus::Sleeping);
        p.stages.insert(Stage::PostPatch, PatchStatus::Failed);
        assert_eq!(p.derived_status(), PatchStatus::Failed);
    }

    #[test]
    fn test_document_json_shape() {
        let doc = LedgerDocument::new(TargetKind::Dom0, &nodes(&["a"]), &nodes(&["b", "c"]));
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["sleep_infra_patch"], "no");
        assert_eq!(json["target_type"], "dom0");
        let entry = &json["node_patching_progress_data"][0];
        assert_eq!(entry["node_name"], "a");
        assert_eq!(entry["stages"]["patch_mgr"], "pending");

        let back: LedgerDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
    }
}
