//! Launch-node ordering and rotation groups.

use exapatch_core::target::TargetKind;
use exapatch_runtime::filter::FilterResult;
use exapatch_runtime::staging::{LaunchNodeState, LaunchNodes};

use crate::request::PatchRequest;

/// Nodes patched by one launch node in one pass.
#[derive(Debug, Clone)]
pub struct NodeGroup {
    pub launch: LaunchNodeState,
    pub nodes: Vec<String>,
}

/// Launch nodes needed for `kind`: two for self-hosting kinds so the first
/// launch node can itself be patched, otherwise one.
pub fn required_launch_nodes(kind: TargetKind, external: bool) -> usize {
    if !external && kind.profile().self_hosting {
        2
    } else {
        1
    }
}

/// Ordered launch candidates.
///
/// Explicit candidates are used as given. Self-hosting kinds otherwise try
/// the to-patch nodes first, then discarded nodes, then the rest of the
/// cluster.
pub fn launch_candidates(req: &PatchRequest, filter: &FilterResult) -> Vec<String> {
    if !req.launch_candidates.is_empty() || !req.target_kind.profile().self_hosting {
        return req.launch_candidates.clone();
    }
    let mut ordered: Vec<String> = Vec::new();
    let discarded = filter.discarded_nodes();
    for node in filter
        .to_patch
        .iter()
        .chain(discarded.iter())
        .chain(req.nodes.iter())
    {
        if !ordered.contains(node) {
            ordered.push(node.clone());
        }
    }
    ordered
}

/// Split `to_patch` into rotation passes.
///
/// The primary patches everyone else; if the primary is itself a target the
/// secondary patches it in a second pass. An external launch node gets a
/// single pass.
pub fn plan_groups(launch: &LaunchNodes, to_patch: &[String]) -> Vec<NodeGroup> {
    let primary = &launch.primary;
    let secondary = match (&launch.secondary, launch.external) {
        (Some(s), false) => s,
        _ => {
            return vec![NodeGroup {
                launch: primary.clone(),
                nodes: to_patch.to_vec(),
            }];
        }
    };

    let mut groups = Vec::new();
    let others: Vec<String> = to_patch
        .iter()
        .filter(|n| **n != primary.host)
        .cloned()
        .collect();
    if !others.is_empty() {
        groups.push(NodeGroup {
            launch: primary.clone(),
            nodes: others,
        });
    }
    if to_patch.contains(&primary.host) {
        groups.push(NodeGroup {
            launch: secondary.clone(),
            nodes: vec![primary.host.clone()],
        });
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use exapatch_runtime::filter::{DiscardReason, Discarded};
    use exapatch_runtime::staging::{Payload, StagingOptions};
    use std::time::Duration;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn state(host: &str) -> LaunchNodeState {
        let options = StagingOptions {
            remote_root: "/r".to_string(),
            checksum_attempts: 1,
            retry_delay: Duration::from_millis(1),
            headroom_factor: 1,
        };
        let payload = Payload {
            local_path: "/tmp/p.zip".into(),
            bundle: "22.1.0".to_string(),
            tool_relative_path: "patchmgr".to_string(),
            size_mb: 1,
        };
        LaunchNodeState::new(host, &options, &payload)
    }

    fn request(kind: &str, extra: &str) -> PatchRequest {
        PatchRequest::parse(&format!(
            r#"{{"target_kind": "{}", "operation": "patch", "nodes": ["a", "b", "c", "d"],
                "target_version": "22.1.0", "payload": {{"path": "/p.zip"}}{}}}"#,
            kind, extra
        ))
        .unwrap()
    }

    #[test]
    fn test_candidates_put_discarded_after_targets() {
        let filter = FilterResult {
            to_patch: names(&["b", "c", "d"]),
            discarded: vec![Discarded {
                node: "a".to_string(),
                reason: DiscardReason::AtOrAboveTarget {
                    current: "22.1.0".to_string(),
                },
            }],
        };
        let req = request("dom0", "");
        assert_eq!(launch_candidates(&req, &filter), names(&["b", "c", "d", "a"]));

        let req = request("cell", r#", "launch_candidates": ["db1"]"#);
        assert_eq!(launch_candidates(&req, &filter), names(&["db1"]));
    }

    #[test]
    fn test_rotation_groups() {
        let launch = LaunchNodes {
            primary: state("b"),
            secondary: Some(state("c")),
            external: false,
        };
        let groups = plan_groups(&launch, &names(&["b", "c", "d"]));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].launch.host, "b");
        assert_eq!(groups[0].nodes, names(&["c", "d"]));
        assert_eq!(groups[1].launch.host, "c");
        assert_eq!(groups[1].nodes, names(&["b"]));
    }

    #[test]
    fn test_primary_not_a_target_needs_no_second_pass() {
        let launch = LaunchNodes {
            primary: state("a"),
            secondary: Some(state("b")),
            external: false,
        };
        let groups = plan_groups(&launch, &names(&["c"]));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].launch.host, "a");

        let launch = LaunchNodes {
            primary: state("b"),
            secondary: Some(state("a")),
            external: false,
        };
        let groups = plan_groups(&launch, &names(&["b"]));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].launch.host, "a");
    }

    #[test]
    fn test_external_launch_node_single_pass() {
        let launch = LaunchNodes {
            primary: state("ext"),
            secondary: None,
            external: true,
        };
        let groups = plan_groups(&launch, &names(&["a", "b"]));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].nodes, names(&["a", "b"]));
        assert_eq!(required_launch_nodes(TargetKind::Dom0, true), 1);
        assert_eq!(required_launch_nodes(TargetKind::Dom0, false), 2);
        assert_eq!(required_launch_nodes(TargetKind::Cell, false), 1);
    }
}
