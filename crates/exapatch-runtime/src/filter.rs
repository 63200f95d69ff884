use std::cmp::Ordering;

use anyhow::Result;
use exapatch_core::error::{ErrorCode, PatchError, patch_error};
use exapatch_core::target::{Operation, TargetKind};
use exapatch_core::version;
use tracing::{info, warn};

use crate::inspect::NodeInspector;

/// Why a node was left out of the current operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// Active image is at or past the requested target.
    AtOrAboveTarget { current: String },
    /// Rollback requested but no backup image exists.
    NoRollbackImage,
    /// Backup image is not strictly older than the active image.
    RollbackImageNotLower { active: String, inactive: String },
    /// The version could not be read.
    VersionUnknown,
    /// The version could not be ordered against the target.
    Incomparable { current: String },
    /// Every stage finished in an earlier attempt of a retried request.
    CompletedEarlier,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AtOrAboveTarget { current } => write!(f, "already at {}", current),
            Self::NoRollbackImage => write!(f, "no rollback image"),
            Self::RollbackImageNotLower { active, inactive } => {
                write!(f, "inactive {} is not lower than active {}", inactive, active)
            }
            Self::VersionUnknown => write!(f, "version unknown"),
            Self::Incomparable { current } => write!(f, "version {} not comparable", current),
            Self::CompletedEarlier => write!(f, "completed by an earlier attempt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discarded {
    pub node: String,
    pub reason: DiscardReason,
}

/// Partition of the candidate list. Every input node lands in exactly one side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterResult {
    pub to_patch: Vec<String>,
    pub discarded: Vec<Discarded>,
}

impl FilterResult {
    pub fn discarded_nodes(&self) -> Vec<String> {
        self.discarded.iter().map(|d| d.node.clone()).collect()
    }

    pub fn is_discarded(&self, node: &str) -> bool {
        self.discarded.iter().any(|d| d.node == node)
    }
}

/// Versions read for one node.
#[derive(Debug, Clone, Default)]
pub struct NodeVersions {
    pub active: Option<String>,
    pub inactive: Option<String>,
}

/// Decide whether one node needs the operation. `None` means keep it.
pub fn classify(
    operation: Operation,
    target_version: Option<&str>,
    versions: &NodeVersions,
) -> Option<DiscardReason> {
    match operation {
        Operation::Postcheck | Operation::Oneoff | Operation::OneoffV2 | Operation::ImageBackup => {
            None
        }
        Operation::Patch | Operation::Precheck => {
            let Some(current) = versions.active.as_deref() else {
                return Some(DiscardReason::VersionUnknown);
            };
            let target = target_version.unwrap_or_default();
            match version::compare(current, target) {
                Some(Ordering::Less) => None,
                Some(_) => Some(DiscardReason::AtOrAboveTarget {
                    current: current.to_string(),
                }),
                None => Some(DiscardReason::Incomparable {
                    current: current.to_string(),
                }),
            }
        }
        Operation::Rollback => {
            let Some(active) = versions.active.as_deref() else {
                return Some(DiscardReason::VersionUnknown);
            };
            let Some(inactive) = versions.inactive.as_deref() else {
                return Some(DiscardReason::NoRollbackImage);
            };
            match version::compare(inactive, active) {
                Some(Ordering::Less) => None,
                Some(_) => Some(DiscardReason::RollbackImageNotLower {
                    active: active.to_string(),
                    inactive: inactive.to_string(),
                }),
                None => Some(DiscardReason::Incomparable {
                    current: active.to_string(),
                }),
            }
        }
    }
}

/// Classify `nodes` into to-patch and discarded.
///
/// Errors when the requested target version itself is unusable, or when a
/// rollback cannot tell whether a node has a backup image. A node whose
/// active version cannot be read is discarded rather than failing the run.
pub async fn filter_nodes(
    inspector: &dyn NodeInspector,
    nodes: &[String],
    kind: TargetKind,
    operation: Operation,
    target_version: Option<&str>,
) -> Result<FilterResult> {
    if matches!(operation, Operation::Patch | Operation::Precheck) {
        let valid = target_version.is_some_and(version::is_valid);
        if !valid {
            return Err(PatchError::new(
                ErrorCode::InvalidTargetVersion,
                format!(
                    "Target version '{}' is missing or malformed for {} {}",
                    target_version.unwrap_or_default(),
                    kind,
                    operation
                ),
            )
            .with_suggestion("Pass a dotted numeric target version such as 22.1.0")
            .into());
        }
    }

    let mut result = FilterResult::default();
    for node in nodes {
        let versions = read_versions(inspector, node, kind, operation).await?;
        match classify(operation, target_version, &versions) {
            None => result.to_patch.push(node.clone()),
            Some(reason) => {
                info!(node = %node, %kind, %operation, reason = %reason, "Node discarded");
                result.discarded.push(Discarded {
                    node: node.clone(),
                    reason,
                });
            }
        }
    }

    info!(
        %kind,
        %operation,
        to_patch = result.to_patch.len(),
        discarded = result.discarded.len(),
        "Node filter complete"
    );
    Ok(result)
}

async fn read_versions(
    inspector: &dyn NodeInspector,
    node: &str,
    kind: TargetKind,
    operation: Operation,
) -> Result<NodeVersions> {
    if matches!(
        operation,
        Operation::Postcheck | Operation::Oneoff | Operation::OneoffV2 | Operation::ImageBackup
    ) {
        return Ok(NodeVersions::default());
    }

    let active = match inspector.active_version(node, kind).await {
        Ok(v) => v,
        Err(e) => {
            warn!(node, error = %e, "Failed to read active version");
            None
        }
    };
    let inactive = if operation == Operation::Rollback {
        match inspector.inactive_version(node, kind).await {
            Ok(v) => v,
            Err(e) => {
                let code = PatchError::from_anyhow(&e).code;
                if code == ErrorCode::InactiveImageUnavailable {
                    return Err(e);
                }
                return Err(patch_error(
                    ErrorCode::InactiveImageUnavailable,
                    format!("Unable to read the inactive image of {}: {:#}", node, e),
                ));
            }
        }
    } else {
        None
    };
    Ok(NodeVersions { active, inactive })
}
