use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use exapatch_core::error::{ErrorCode, patch_error};
use exapatch_core::target::{OpStyle, Operation, TargetKind};
use exapatch_core::version;
use serde::{Deserialize, Serialize};

// ============================================================================
// Request schema
// ============================================================================

/// One operation against a set of infrastructure targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRequest {
    #[serde(default = "new_request_id")]
    pub request_id: String,
    pub target_kind: TargetKind,
    pub operation: Operation,
    /// Every node of the cluster for this kind.
    pub nodes: Vec<String>,
    /// Subset of `nodes` to operate on; empty means all of them.
    #[serde(default)]
    pub include_nodes: Vec<String>,
    #[serde(default)]
    pub target_version: Option<String>,
    #[serde(default)]
    pub payload: Option<PayloadSpec>,
    /// Hosts allowed to run the patch tool. Required for kinds that cannot
    /// host their own tool; defaults to the cluster nodes otherwise.
    #[serde(default)]
    pub launch_candidates: Vec<String>,
    /// Single launch node outside the target set; disables rotation.
    #[serde(default)]
    pub external_launch_node: Option<String>,
    #[serde(default)]
    pub style: OpStyle,
    /// Keep the tool's image backup before patching.
    #[serde(default = "default_backup")]
    pub backup: bool,
    #[serde(default)]
    pub exasplice: bool,
    /// A retry of an earlier request for the same targets.
    #[serde(default)]
    pub retried: bool,
}

/// Local patch archive and where the tool lives inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadSpec {
    pub path: PathBuf,
    /// Bundle directory name; defaults to the target version.
    #[serde(default)]
    pub bundle: Option<String>,
    /// Tool path relative to the unpacked archive root.
    #[serde(default = "default_tool")]
    pub tool: String,
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_backup() -> bool {
    true
}

fn default_tool() -> String {
    "patchmgr".to_string()
}

impl PatchRequest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let req: Self = serde_json::from_str(s).with_context(|| "Failed to parse request JSON")?;
        req.validate()?;
        Ok(req)
    }

    /// Reject requests the orchestrator cannot act on.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("Request {} has no nodes", self.request_id);
        }
        for node in &self.include_nodes {
            if !self.nodes.contains(node) {
                bail!("Included node {} is not part of the cluster node list", node);
            }
        }
        if self.operation.tool_action().is_some() && self.payload.is_none() {
            bail!("{} requires a payload", self.operation);
        }
        if matches!(self.operation, Operation::Patch | Operation::Precheck) {
            match self.target_version.as_deref() {
                Some(v) if version::is_valid(v) => {}
                Some(v) => {
                    return Err(patch_error(
                        ErrorCode::InvalidTargetVersion,
                        format!("Target version '{}' is not a dotted numeric version", v),
                    ));
                }
                None => bail!("{} requires a target version", self.operation),
            }
        }
        let profile = self.target_kind.profile();
        if self.operation.tool_action().is_some()
            && !profile.self_hosting
            && self.launch_candidates.is_empty()
            && self.external_launch_node.is_none()
        {
            bail!(
                "{} targets cannot run the patch tool themselves; pass launch_candidates or external_launch_node",
                self.target_kind
            );
        }
        Ok(())
    }

    /// Nodes this request operates on, in request order.
    pub fn selected_nodes(&self) -> Vec<String> {
        if self.include_nodes.is_empty() {
            self.nodes.clone()
        } else {
            self.nodes
                .iter()
                .filter(|n| self.include_nodes.contains(n))
                .cloned()
                .collect()
        }
    }

    /// Inter-node sleep only applies to multi-node include lists.
    pub fn sleeps_between_nodes(&self) -> bool {
        self.include_nodes.len() > 1
    }

    /// Bundle directory for the payload.
    pub fn bundle_name(&self) -> String {
        self.payload
            .as_ref()
            .and_then(|p| p.bundle.clone())
            .or_else(|| self.target_version.clone())
            .unwrap_or_else(|| self.operation.to_string())
    }

    /// Every host that may hold a replica of the ledger.
    pub fn ledger_replicas(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        let extra = self
            .launch_candidates
            .iter()
            .chain(self.external_launch_node.iter());
        let all = if self.target_kind.profile().self_hosting {
            self.nodes.iter().chain(extra).collect::<Vec<_>>()
        } else {
            extra.collect::<Vec<_>>()
        };
        for host in all {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<PatchRequest> {
        PatchRequest::parse(json)
    }

    #[test]
    fn test_minimal_patch_request() {
        let req = parse(
            r#"{
                "target_kind": "dom0",
                "operation": "patch",
                "nodes": ["a", "b"],
                "target_version": "22.1.0",
                "payload": {"path": "/tmp/p.zip"}
            }"#,
        )
        .unwrap();
        assert!(!req.request_id.is_empty());
        assert!(req.backup);
        assert!(!req.retried);
        assert_eq!(req.style, OpStyle::Auto);
        assert_eq!(req.bundle_name(), "22.1.0");
        assert_eq!(req.payload.as_ref().unwrap().tool, "patchmgr");
        assert_eq!(req.selected_nodes(), vec!["a", "b"]);
        assert_eq!(req.ledger_replicas(), vec!["a", "b"]);
    }

    #[test]
    fn test_include_list_must_be_subset() {
        let err = parse(
            r#"{"target_kind": "domu", "operation": "postcheck",
                "nodes": ["a"], "include_nodes": ["z"]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("z"));

        let req = parse(
            r#"{"target_kind": "domu", "operation": "postcheck",
                "nodes": ["a", "b", "c"], "include_nodes": ["c", "a"]}"#,
        )
        .unwrap();
        assert_eq!(req.selected_nodes(), vec!["a", "c"]);
        assert!(req.sleeps_between_nodes());
    }

    #[test]
    fn test_tool_operations_need_payload_and_version() {
        assert!(
            parse(r#"{"target_kind": "dom0", "operation": "patch", "nodes": ["a"], "target_version": "22.1"}"#)
                .is_err()
        );
        let err = parse(
            r#"{"target_kind": "dom0", "operation": "precheck", "nodes": ["a"],
                "target_version": "latest", "payload": {"path": "/p.zip"}}"#,
        )
        .unwrap_err();
        assert_eq!(
            exapatch_core::error::PatchError::from_anyhow(&err).code,
            ErrorCode::InvalidTargetVersion
        );
        assert!(
            parse(r#"{"target_kind": "dom0", "operation": "rollback", "nodes": ["a"],
                      "payload": {"path": "/p.zip"}}"#)
                .is_ok()
        );
    }

    #[test]
    fn test_cells_need_launch_hosts() {
        let base = r#""target_kind": "cell", "operation": "patch", "nodes": ["cel1"],
                      "target_version": "22.1.0", "payload": {"path": "/p.zip"}"#;
        assert!(parse(&format!("{{{}}}", base)).is_err());

        let req = parse(&format!(r#"{{{}, "launch_candidates": ["db1", "db2"]}}"#, base)).unwrap();
        assert_eq!(req.ledger_replicas(), vec!["db1", "db2"]);
    }
}
