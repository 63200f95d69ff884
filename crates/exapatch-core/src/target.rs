use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Kind of infrastructure component being patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Compute-node hypervisor.
    Dom0,
    /// Guest VM.
    DomU,
    /// Storage cell.
    Cell,
    IbSwitch,
    RoceSwitch,
}

impl TargetKind {
    pub const ALL: [TargetKind; 5] = [
        TargetKind::Dom0,
        TargetKind::DomU,
        TargetKind::Cell,
        TargetKind::IbSwitch,
        TargetKind::RoceSwitch,
    ];

    /// Dispatch table entry for this kind.
    pub fn profile(self) -> &'static TargetProfile {
        match self {
            Self::Dom0 => &DOM0_PROFILE,
            Self::DomU => &DOMU_PROFILE,
            Self::Cell => &CELL_PROFILE,
            Self::IbSwitch => &IBSWITCH_PROFILE,
            Self::RoceSwitch => &ROCESWITCH_PROFILE,
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dom0 => write!(f, "dom0"),
            Self::DomU => write!(f, "domu"),
            Self::Cell => write!(f, "cell"),
            Self::IbSwitch => write!(f, "ibswitch"),
            Self::RoceSwitch => write!(f, "roceswitch"),
        }
    }
}

impl FromStr for TargetKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dom0" | "hypervisor" => Ok(Self::Dom0),
            "domu" | "guest-vm" | "guest_vm" => Ok(Self::DomU),
            "cell" | "storage-cell" => Ok(Self::Cell),
            "ibswitch" | "ib-switch" => Ok(Self::IbSwitch),
            "roceswitch" | "roce-switch" => Ok(Self::RoceSwitch),
            other => bail!("Unknown target kind '{}'", other),
        }
    }
}

/// How a target kind's versions are read and filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSource {
    /// `imageinfo` plus the db server backup partition for the inactive image.
    DbServerImage,
    /// `imageinfo` for both active and inactive images.
    CellImage,
    /// Switch firmware version; no inactive image.
    SwitchFirmware,
}

/// Per-kind behavior that would otherwise be scattered string checks.
#[derive(Debug)]
pub struct TargetProfile {
    /// patchmgr argument selecting the component class.
    pub tool_flag: &'static str,
    /// Ledger stages tracked for each node of this kind.
    pub stages: &'static [Stage],
    pub version_source: VersionSource,
    /// Nodes of this kind can act as launch nodes for their peers.
    pub self_hosting: bool,
    /// Nodes of this kind host guest VMs that need lifecycle handling.
    pub hosts_vms: bool,
    /// Rolling order is driven node-by-node by the engine rather than by the tool.
    pub engine_rolling: bool,
}

const ALL_STAGES: &[Stage] = &[Stage::PrePatch, Stage::PatchMgr, Stage::PostPatch];
const TOOL_STAGE_ONLY: &[Stage] = &[Stage::PatchMgr];

static DOM0_PROFILE: TargetProfile = TargetProfile {
    tool_flag: "--dbnodes",
    stages: ALL_STAGES,
    version_source: VersionSource::DbServerImage,
    self_hosting: true,
    hosts_vms: true,
    engine_rolling: true,
};

static DOMU_PROFILE: TargetProfile = TargetProfile {
    tool_flag: "--dbnodes",
    stages: ALL_STAGES,
    version_source: VersionSource::DbServerImage,
    self_hosting: true,
    hosts_vms: false,
    engine_rolling: true,
};

static CELL_PROFILE: TargetProfile = TargetProfile {
    tool_flag: "--cells",
    stages: TOOL_STAGE_ONLY,
    version_source: VersionSource::CellImage,
    self_hosting: false,
    hosts_vms: false,
    engine_rolling: false,
};

static IBSWITCH_PROFILE: TargetProfile = TargetProfile {
    tool_flag: "--ibswitches",
    stages: TOOL_STAGE_ONLY,
    version_source: VersionSource::SwitchFirmware,
    self_hosting: false,
    hosts_vms: false,
    engine_rolling: false,
};

static ROCESWITCH_PROFILE: TargetProfile = TargetProfile {
    tool_flag: "--roceswitches",
    stages: TOOL_STAGE_ONLY,
    version_source: VersionSource::SwitchFirmware,
    self_hosting: false,
    hosts_vms: false,
    engine_rolling: false,
};

/// Operation requested against a set of targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Precheck,
    Patch,
    Rollback,
    Postcheck,
    ImageBackup,
    Oneoff,
    OneoffV2,
}

impl Operation {
    /// patchmgr action flag, or `None` for operations that never invoke the tool.
    pub fn tool_action(self) -> Option<&'static str> {
        match self {
            Self::Precheck => Some("--precheck"),
            Self::Patch => Some("--upgrade"),
            Self::Rollback => Some("--rollback"),
            Self::ImageBackup => Some("--backup"),
            Self::Postcheck | Self::Oneoff | Self::OneoffV2 => None,
        }
    }

    /// Operations that change the image on the node.
    pub fn mutates_image(self) -> bool {
        matches!(self, Self::Patch | Self::Rollback)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Precheck => write!(f, "precheck"),
            Self::Patch => write!(f, "patch"),
            Self::Rollback => write!(f, "rollback"),
            Self::Postcheck => write!(f, "postcheck"),
            Self::ImageBackup => write!(f, "image_backup"),
            Self::Oneoff => write!(f, "oneoff"),
            Self::OneoffV2 => write!(f, "oneoff_v2"),
        }
    }
}

/// Requested node ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStyle {
    #[default]
    Auto,
    Rolling,
    NonRolling,
}

impl OpStyle {
    /// Resolve `Auto` against the target kind: rolling where the engine sequences nodes itself.
    pub fn resolve(self, kind: TargetKind) -> OpStyle {
        match self {
            Self::Auto if kind.profile().engine_rolling => Self::Rolling,
            Self::Auto => Self::NonRolling,
            other => other,
        }
    }
}

/// Ledger stage of a node's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PrePatch,
    PatchMgr,
    PostPatch,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrePatch => write!(f, "pre_patch"),
            Self::PatchMgr => write!(f, "patch_mgr"),
            Self::PostPatch => write!(f, "post_patch"),
        }
    }
}

/// Hostname up to the first dot.
pub fn short_name(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_kind_roundtrip_display_parse() {
        for kind in TargetKind::ALL {
            let parsed: TargetKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("toaster".parse::<TargetKind>().is_err());
    }

    #[test]
    fn test_target_kind_serde_lowercase() {
        let json = serde_json::to_string(&TargetKind::IbSwitch).unwrap();
        assert_eq!(json, "\"ibswitch\"");
    }

    #[test]
    fn test_profiles() {
        assert!(TargetKind::Dom0.profile().hosts_vms);
        assert!(!TargetKind::DomU.profile().hosts_vms);
        assert_eq!(TargetKind::Cell.profile().tool_flag, "--cells");
        assert_eq!(TargetKind::Cell.profile().stages, &[Stage::PatchMgr]);
        assert!(!TargetKind::RoceSwitch.profile().self_hosting);
    }

    #[test]
    fn test_auto_style_resolution() {
        assert_eq!(OpStyle::Auto.resolve(TargetKind::Dom0), OpStyle::Rolling);
        assert_eq!(OpStyle::Auto.resolve(TargetKind::Cell), OpStyle::NonRolling);
        assert_eq!(OpStyle::NonRolling.resolve(TargetKind::Dom0), OpStyle::NonRolling);
    }

    #[test]
    fn test_tool_actions() {
        assert_eq!(Operation::Patch.tool_action(), Some("--upgrade"));
        assert_eq!(Operation::Postcheck.tool_action(), None);
        assert!(Operation::Rollback.mutates_image());
        assert!(!Operation::Precheck.mutates_image());
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("node1.example.com"), "node1");
        assert_eq!(short_name("node1"), "node1");
    }
}
