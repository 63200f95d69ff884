use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use exapatch_core::config::PatchConfig;
use exapatch_core::error::{ErrorCode, PatchError, patch_error};
use exapatch_core::retry::retry_flat;
use exapatch_core::target::{Operation, TargetKind};
use exapatch_core::version;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::executor::RemoteExecutor;
use crate::inspect::NodeInspector;

/// Local patch payload to stage on launch nodes.
#[derive(Debug, Clone)]
pub struct Payload {
    /// Zip archive on the orchestrator host.
    pub local_path: PathBuf,
    /// Bundle directory name under the remote bundle root, usually the target version.
    pub bundle: String,
    /// Path of the patch tool inside the unpacked archive.
    pub tool_relative_path: String,
    pub size_mb: u64,
}

impl Payload {
    /// Describe a payload, sizing it from the local file.
    pub fn from_file(
        local_path: impl Into<PathBuf>,
        bundle: impl Into<String>,
        tool_relative_path: impl Into<String>,
    ) -> Result<Self> {
        let local_path = local_path.into();
        let len = std::fs::metadata(&local_path)
            .with_context(|| format!("Failed to stat payload {}", local_path.display()))?
            .len();
        Ok(Self {
            local_path,
            bundle: bundle.into(),
            tool_relative_path: tool_relative_path.into(),
            size_mb: len.div_ceil(1024 * 1024).max(1),
        })
    }

    pub fn zip_name(&self) -> String {
        self.local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload.zip".to_string())
    }
}

/// Staging knobs.
#[derive(Debug, Clone)]
pub struct StagingOptions {
    pub remote_root: String,
    pub checksum_attempts: u32,
    pub retry_delay: Duration,
    pub headroom_factor: u64,
}

impl StagingOptions {
    pub fn from_config(config: &PatchConfig) -> Self {
        Self {
            remote_root: config.engine.remote_root.clone(),
            checksum_attempts: config.staging.checksum_attempts,
            retry_delay: Duration::from_secs(config.staging.checksum_retry_delay_secs),
            headroom_factor: config.staging.space_headroom_factor,
        }
    }

    pub fn bundle_root(&self) -> String {
        format!("{}/bundles", self.remote_root)
    }

    pub fn log_root(&self) -> String {
        format!("{}/logs", self.remote_root)
    }
}

/// A launch node with a validated, unpacked payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchNodeState {
    pub host: String,
    pub bundle_dir: String,
    pub zip_path: String,
    pub tool_path: String,
    pub tool_dir: String,
    pub log_root: String,
}

impl LaunchNodeState {
    pub fn new(host: &str, options: &StagingOptions, payload: &Payload) -> Self {
        let bundle_dir = format!("{}/{}", options.bundle_root(), payload.bundle);
        let tool_path = format!("{}/{}", bundle_dir, payload.tool_relative_path);
        let tool_dir = tool_path
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_else(|| bundle_dir.clone());
        Self {
            host: host.to_string(),
            zip_path: format!("{}/{}", bundle_dir, payload.zip_name()),
            bundle_dir,
            tool_path,
            tool_dir,
            log_root: options.log_root(),
        }
    }

    /// Console-log directory for one invocation, before the completion rename.
    pub fn log_dir(&self, kind: TargetKind, operation: Operation, first_node: &str) -> String {
        crate::session::log_dir_for(&self.log_root, kind, operation, first_node)
    }

    /// Log directory name after the completion rename.
    pub fn renamed_log_dir(&self, log_dir: &str) -> String {
        crate::session::renamed_log_dir(log_dir, &self.host)
    }
}

/// Launch nodes selected for one run.
#[derive(Debug, Clone)]
pub struct LaunchNodes {
    /// Patches every other node.
    pub primary: LaunchNodeState,
    /// Patches the primary in the rotation pass.
    pub secondary: Option<LaunchNodeState>,
    /// `primary` was supplied externally.
    pub external: bool,
}

impl LaunchNodes {
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts = vec![self.primary.host.clone()];
        if let Some(s) = &self.secondary {
            hosts.push(s.host.clone());
        }
        hosts
    }
}

/// Inputs for launch-node selection.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSelection<'a> {
    /// Ordered candidates; tried front to back.
    pub candidates: &'a [String],
    /// Nodes that will be patched in this run.
    pub targets: &'a [String],
    pub external: Option<&'a str>,
    /// Number of launch nodes needed without an external one (1 or 2).
    pub required: usize,
    /// Kind of the launch nodes, for reading their image versions.
    pub launch_kind: TargetKind,
}

/// Picks launch nodes and stages the payload on them.
pub struct LaunchNodeSelector {
    exec: Arc<dyn RemoteExecutor>,
    inspector: Arc<dyn NodeInspector>,
    options: StagingOptions,
}

impl LaunchNodeSelector {
    pub fn new(
        exec: Arc<dyn RemoteExecutor>,
        inspector: Arc<dyn NodeInspector>,
        options: StagingOptions,
    ) -> Self {
        Self {
            exec,
            inspector,
            options,
        }
    }

    /// Select the launch nodes for a run.
    ///
    /// With an external launch node exactly one node is staged; otherwise
    /// `required` nodes are picked in two phases from the candidates.
    pub async fn select(&self, selection: LaunchSelection<'_>, payload: &Payload) -> Result<LaunchNodes> {
        let local_sha = local_sha256(&payload.local_path).await?;

        if let Some(external) = selection.external {
            if selection.targets.iter().any(|t| t == external) {
                return Err(PatchError::new(
                    ErrorCode::LaunchNodeIsTarget,
                    format!("External launch node {} is also a patch target", external),
                )
                .with_suggestion("Pass a launch node that is not part of the node list")
                .into());
            }
            let primary = self
                .stage_on(external, payload, &local_sha, selection.launch_kind)
                .await
                .with_context(|| format!("Staging on external launch node {} failed", external))?;
            return Ok(LaunchNodes {
                primary,
                secondary: None,
                external: true,
            });
        }

        let mut rejected: Vec<(String, String)> = Vec::new();
        let primary = self
            .stage_first(selection, payload, &local_sha, &[], &mut rejected)
            .await;
        let Some(primary) = primary else {
            return Err(insufficient(selection.required, 0, &rejected));
        };

        let secondary = if selection.required >= 2 {
            let skip = [primary.host.clone()];
            match self
                .stage_first(selection, payload, &local_sha, &skip, &mut rejected)
                .await
            {
                Some(s) => Some(s),
                None => return Err(insufficient(selection.required, 1, &rejected)),
            }
        } else {
            None
        };

        info!(
            primary = %primary.host,
            secondary = secondary.as_ref().map(|s| s.host.as_str()).unwrap_or("-"),
            "Launch nodes selected"
        );
        Ok(LaunchNodes {
            primary,
            secondary,
            external: false,
        })
    }

    /// First candidate (not in `skip`) on which staging succeeds.
    async fn stage_first(
        &self,
        selection: LaunchSelection<'_>,
        payload: &Payload,
        local_sha: &str,
        skip: &[String],
        rejected: &mut Vec<(String, String)>,
    ) -> Option<LaunchNodeState> {
        for candidate in selection.candidates {
            if skip.contains(candidate) || rejected.iter().any(|(h, _)| h == candidate) {
                continue;
            }
            match self
                .stage_on(candidate, payload, local_sha, selection.launch_kind)
                .await
            {
                Ok(state) => return Some(state),
                Err(e) => {
                    let pe = PatchError::from_anyhow(&e);
                    warn!(
                        candidate = %candidate,
                        code = %pe.code,
                        error = %pe.message,
                        "Launch node candidate rejected"
                    );
                    rejected.push((candidate.clone(), pe.message));
                }
            }
        }
        None
    }

    /// Stage and validate the payload on one host.
    #[instrument(skip_all, fields(host = %host))]
    pub async fn stage_on(
        &self,
        host: &str,
        payload: &Payload,
        local_sha: &str,
        launch_kind: TargetKind,
    ) -> Result<LaunchNodeState> {
        let state = LaunchNodeState::new(host, &self.options, payload);

        self.purge_old_bundles(host, payload, launch_kind).await;

        let mkdir = self
            .exec
            .run(host, &format!("mkdir -p {} {}", state.bundle_dir, state.log_root))
            .await?;
        if !mkdir.success() {
            anyhow::bail!("Failed to create {} on {}", state.bundle_dir, host);
        }

        self.check_space(host, &state.bundle_dir, payload.size_mb).await?;
        self.copy_verified(host, payload, &state.zip_path, local_sha)
            .await?;

        let unzip = self
            .exec
            .run(
                host,
                &format!("unzip -o -q {} -d {}", state.zip_path, state.bundle_dir),
            )
            .await?;
        if !unzip.success() {
            return Err(patch_error(
                ErrorCode::UnzipError,
                format!(
                    "Failed to unpack {} on {} (exit {})",
                    state.zip_path, host, unzip.exit_code
                ),
            ));
        }

        if !self.exec.exists(host, &state.tool_path).await? {
            return Err(PatchError::new(
                ErrorCode::ToolMissingOnLaunchNode,
                format!("Patch tool {} missing on {} after unpack", state.tool_path, host),
            )
            .with_suggestion("Verify the payload archive layout")
            .into());
        }

        info!(bundle = %state.bundle_dir, "Payload staged");
        Ok(state)
    }

    async fn check_space(&self, host: &str, dir: &str, size_mb: u64) -> Result<()> {
        let required = size_mb.saturating_mul(self.options.headroom_factor);
        let out = self
            .exec
            .run(
                host,
                &format!("df -mP {} | tail -n1 | awk '{{print $(NF-2)}}'", dir),
            )
            .await?;
        let available: u64 = out.stdout.trim().parse().map_err(|_| {
            patch_error(
                ErrorCode::InsufficientSpace,
                format!("Unable to read free space on {}: '{}'", host, out.stdout.trim()),
            )
        })?;
        if available < required {
            return Err(PatchError::new(
                ErrorCode::InsufficientSpace,
                format!(
                    "{} has {} MB free in {}, {} MB required",
                    host, available, dir, required
                ),
            )
            .with_suggestion(format!("Free at least {} MB on {}", required - available, host))
            .into());
        }
        Ok(())
    }

    async fn remote_sha256(&self, host: &str, path: &str) -> Result<String> {
        let out = self
            .exec
            .run(
                host,
                &format!("sha256sum {} 2>/dev/null | awk '{{print $1}}'", path),
            )
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Copy the payload until the remote checksum matches, up to the attempt bound.
    async fn copy_verified(
        &self,
        host: &str,
        payload: &Payload,
        zip_path: &str,
        local_sha: &str,
    ) -> Result<()> {
        let local_path = payload.local_path.as_path();
        retry_flat(
            self.options.checksum_attempts,
            self.options.retry_delay,
            "payload copy",
            |attempt| async move {
                let remote = self.remote_sha256(host, zip_path).await?;
                if remote == local_sha {
                    return Ok(());
                }
                info!(attempt, zip = %zip_path, "Copying payload");
                self.exec
                    .copy(host, local_path, zip_path)
                    .await
                    .map_err(|e| {
                        patch_error(
                            ErrorCode::PayloadCopyError,
                            format!("Copy to {} failed: {:#}", host, e),
                        )
                    })?;
                let after = self.remote_sha256(host, zip_path).await?;
                if after != local_sha {
                    return Err(PatchError::new(
                        ErrorCode::ChecksumValidationFailed,
                        format!(
                            "Checksum mismatch for {} on {} after copy (local {}, remote {})",
                            zip_path, host, local_sha, after
                        ),
                    )
                    .with_suggestion("Check network stability and disk health on the launch node")
                    .into());
                }
                Ok(())
            },
        )
        .await
    }

    /// Remove bundles other than the target, active, and inactive versions.
    async fn purge_old_bundles(&self, host: &str, payload: &Payload, launch_kind: TargetKind) {
        let mut keep = vec![payload.bundle.clone()];
        if let Ok(Some(v)) = self.inspector.active_version(host, launch_kind).await {
            keep.push(v);
        }
        if let Ok(Some(v)) = self.inspector.inactive_version(host, launch_kind).await {
            keep.push(v);
        }

        let root = self.options.bundle_root();
        let listing = match self.exec.run(host, &format!("ls -1 {} 2>/dev/null", root)).await {
            Ok(out) => out.stdout,
            Err(e) => {
                warn!(error = %e, "Unable to list old bundles");
                return;
            }
        };

        for entry in listing.lines().map(str::trim).filter(|e| !e.is_empty()) {
            if keep
                .iter()
                .any(|k| k.as_str() == entry || version::compare(entry, k).is_some_and(|o| o.is_eq()))
            {
                continue;
            }
            let path = format!("{}/{}", root, entry);
            match self.exec.run(host, &format!("rm -rf {}", path)).await {
                Ok(out) if out.success() => info!(path = %path, "Purged old bundle"),
                Ok(out) => warn!(path = %path, exit_code = out.exit_code, "Bundle purge failed"),
                Err(e) => warn!(path = %path, error = %e, "Bundle purge failed"),
            }
        }
    }
}

fn insufficient(required: usize, found: usize, rejected: &[(String, String)]) -> anyhow::Error {
    let reasons: Vec<String> = rejected
        .iter()
        .map(|(h, why)| format!("{}: {}", h, why))
        .collect();
    PatchError::new(
        ErrorCode::InsufficientLaunchNodes,
        format!(
            "{} launch node(s) required, {} usable; rejected [{}]",
            required,
            found,
            reasons.join("; ")
        ),
    )
    .with_suggestion("Free space or fix payload staging on the candidate nodes, or pass an external launch node")
    .into()
}

/// SHA-256 of a local file, hex encoded.
pub async fn local_sha256(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open payload {}", path.display()))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)
            .with_context(|| format!("Failed to hash payload {}", path.display()))?;
        Ok(hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect())
    })
    .await
    .context("Payload hashing task failed")?
}
