use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level engine configuration loaded from TOML.
///
/// Every field has a default, so an empty file is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub staging: StagingSection,
    #[serde(default)]
    pub parallel: ParallelSection,
    #[serde(default)]
    pub rolling: RollingSection,
    #[serde(default)]
    pub checks: ChecksSection,
}

/// Paths used on launch nodes and locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Remote root holding payload bundles, logs, and the progress ledger.
    #[serde(default = "default_remote_root")]
    pub remote_root: String,
    /// Local directory for status snapshots.
    #[serde(default = "default_status_dir")]
    pub status_dir: PathBuf,
    /// Remote directory holding plugin scripts.
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: String,
    /// SSH user for remote commands.
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Timeout for a single remote command (seconds).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

/// External tool polling behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Hard limit on one tool invocation (seconds).
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,
    /// Sleep between console-log reads (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Interval between notification progress updates (seconds).
    #[serde(default = "default_notification_interval")]
    pub notification_interval_secs: u64,
    /// Process-exit checks after the exit marker is seen.
    #[serde(default = "default_completion_checks")]
    pub completion_checks: u32,
    #[serde(default = "default_completion_wait")]
    pub completion_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingSection {
    /// Copy-and-verify attempts per launch-node candidate.
    #[serde(default = "default_checksum_attempts")]
    pub checksum_attempts: u32,
    #[serde(default = "default_checksum_retry_delay")]
    pub checksum_retry_delay_secs: u64,
    /// Required free space as a multiple of the payload size.
    #[serde(default = "default_space_headroom_factor")]
    pub space_headroom_factor: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSection {
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_join_deadline")]
    pub join_deadline_secs: u64,
    /// Join deadline for cluster-membership checks, which take longer to settle.
    #[serde(default = "default_crs_join_deadline")]
    pub crs_join_deadline_secs: u64,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingSection {
    /// Pause between nodes of a multi-node include list (seconds).
    #[serde(default)]
    pub sleep_between_nodes_secs: u64,
    #[serde(default = "default_max_sleep")]
    pub max_sleep_secs: u64,
}

/// Custom checks run on the to-patch nodes before any node is touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksSection {
    #[serde(default = "default_true")]
    pub stale_mounts: bool,
    /// Filesystem whose free space is checked on every target.
    #[serde(default = "default_free_space_path")]
    pub free_space_path: String,
    /// Minimum free space under `free_space_path` (MB); 0 disables the check.
    #[serde(default = "default_min_free_space")]
    pub min_free_space_mb: u64,
}

fn default_true() -> bool {
    true
}
fn default_free_space_path() -> String {
    "/".to_string()
}
fn default_min_free_space() -> u64 {
    1024
}

fn default_remote_root() -> String {
    "/EXAVMIMAGES/exapatch".to_string()
}
fn default_status_dir() -> PathBuf {
    PathBuf::from("/var/lib/exapatch/status")
}
fn default_plugin_dir() -> String {
    "/opt/exapatch/plugins".to_string()
}
fn default_ssh_user() -> String {
    "root".to_string()
}
fn default_command_timeout() -> u64 {
    180
}
fn default_session_timeout() -> u64 {
    14_400
}
fn default_poll_interval() -> u64 {
    5
}
fn default_notification_interval() -> u64 {
    300
}
fn default_completion_checks() -> u32 {
    12
}
fn default_completion_wait() -> u64 {
    5
}
fn default_checksum_attempts() -> u32 {
    3
}
fn default_checksum_retry_delay() -> u64 {
    10
}
fn default_space_headroom_factor() -> u64 {
    3
}
fn default_task_timeout() -> u64 {
    180
}
fn default_join_deadline() -> u64 {
    180
}
fn default_crs_join_deadline() -> u64 {
    1200
}
fn default_max_sleep() -> u64 {
    3600
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            remote_root: default_remote_root(),
            status_dir: default_status_dir(),
            plugin_dir: default_plugin_dir(),
            ssh_user: default_ssh_user(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout(),
            poll_interval_secs: default_poll_interval(),
            notification_interval_secs: default_notification_interval(),
            completion_checks: default_completion_checks(),
            completion_wait_secs: default_completion_wait(),
        }
    }
}

impl Default for StagingSection {
    fn default() -> Self {
        Self {
            checksum_attempts: default_checksum_attempts(),
            checksum_retry_delay_secs: default_checksum_retry_delay(),
            space_headroom_factor: default_space_headroom_factor(),
        }
    }
}

impl Default for ParallelSection {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout(),
            join_deadline_secs: default_join_deadline(),
            crs_join_deadline_secs: default_crs_join_deadline(),
            max_concurrency: None,
        }
    }
}

impl Default for RollingSection {
    fn default() -> Self {
        Self {
            sleep_between_nodes_secs: 0,
            max_sleep_secs: default_max_sleep(),
        }
    }
}

impl Default for ChecksSection {
    fn default() -> Self {
        Self {
            stale_mounts: true,
            free_space_path: default_free_space_path(),
            min_free_space_mb: default_min_free_space(),
        }
    }
}

impl PatchConfig {
    /// Load config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read patch config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "Failed to parse patch config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.poll_interval_secs == 0 {
            anyhow::bail!("session.poll_interval_secs must be greater than zero");
        }
        if self.session.poll_interval_secs >= self.session.timeout_secs {
            anyhow::bail!(
                "session.poll_interval_secs ({}) must be below session.timeout_secs ({})",
                self.session.poll_interval_secs,
                self.session.timeout_secs
            );
        }
        if self.staging.checksum_attempts == 0 {
            anyhow::bail!("staging.checksum_attempts must be at least 1");
        }
        if self.staging.space_headroom_factor == 0 {
            anyhow::bail!("staging.space_headroom_factor must be at least 1");
        }
        if self.rolling.sleep_between_nodes_secs > self.rolling.max_sleep_secs {
            anyhow::bail!(
                "rolling.sleep_between_nodes_secs ({}) exceeds rolling.max_sleep_secs ({})",
                self.rolling.sleep_between_nodes_secs,
                self.rolling.max_sleep_secs
            );
        }
        if self.engine.remote_root.trim().is_empty() || !self.engine.remote_root.starts_with('/') {
            anyhow::bail!(
                "engine.remote_root must be an absolute path, got '{}'",
                self.engine.remote_root
            );
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.command_timeout_secs)
    }

    /// Inter-node sleep, clamped to the configured maximum.
    pub fn inter_node_sleep(&self) -> Duration {
        Duration::from_secs(
            self.rolling
                .sleep_between_nodes_secs
                .min(self.rolling.max_sleep_secs),
        )
    }
}
