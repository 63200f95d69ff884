use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use exapatch_core::error::{ErrorCode, PatchError};
use exapatch_core::target::{TargetKind, VersionSource};
use exapatch_core::version;
use tracing::debug;

use crate::executor::RemoteExecutor;

/// Reads image versions from target nodes.
#[async_trait]
pub trait NodeInspector: Send + Sync {
    /// Active image version, or `None` when it cannot be determined.
    async fn active_version(&self, host: &str, kind: TargetKind) -> Result<Option<String>>;

    /// Inactive (rollback) image version, or `None` when no backup image
    /// exists. An error means the backup state itself could not be read.
    async fn inactive_version(&self, host: &str, kind: TargetKind) -> Result<Option<String>>;
}

/// `NodeInspector` built on the on-node image tooling.
pub struct ImageInfoInspector {
    exec: Arc<dyn RemoteExecutor>,
}

const ACTIVE_VERSION_CMD: &str = "/usr/local/bin/imageinfo -ver";
const CELL_INACTIVE_VERSION_CMD: &str = "/usr/local/bin/imageinfo -inactive -ver";
const DBSERVER_BACKUP_VERSION_CMD: &str = "/opt/oracle.SupportTools/dbserver_backup.sh --ignore-nfs-smbfs-mounts --check-rollback --get-backup-version";
const SWITCH_VERSION_CMD: &str = "version | head -1 | awk '{print $NF}'";

impl ImageInfoInspector {
    pub fn new(exec: Arc<dyn RemoteExecutor>) -> Self {
        Self { exec }
    }

    async fn read_version(&self, host: &str, cmd: &str) -> Result<Option<String>> {
        let out = self.exec.run(host, cmd).await?;
        if !out.success() {
            debug!(host, cmd, exit_code = out.exit_code, "Version query failed");
            return Ok(None);
        }
        Ok(out
            .last_line()
            .filter(|v| version::is_valid(v))
            .map(str::to_string))
    }
}

#[async_trait]
impl NodeInspector for ImageInfoInspector {
    async fn active_version(&self, host: &str, kind: TargetKind) -> Result<Option<String>> {
        match kind.profile().version_source {
            VersionSource::SwitchFirmware => self.read_version(host, SWITCH_VERSION_CMD).await,
            _ => self.read_version(host, ACTIVE_VERSION_CMD).await,
        }
    }

    async fn inactive_version(&self, host: &str, kind: TargetKind) -> Result<Option<String>> {
        match kind.profile().version_source {
            VersionSource::SwitchFirmware => Ok(None),
            VersionSource::CellImage => self.read_version(host, CELL_INACTIVE_VERSION_CMD).await,
            VersionSource::DbServerImage => {
                // 0: rollback available, 2: available at the active version,
                // 1: error, 3: no rollback image.
                let out = self.exec.run(host, DBSERVER_BACKUP_VERSION_CMD).await?;
                match out.exit_code {
                    0 | 2 => Ok(out
                        .last_line()
                        .filter(|v| version::is_valid(v))
                        .map(str::to_string)),
                    1 => Err(PatchError::new(
                        ErrorCode::InactiveImageUnavailable,
                        format!("Backup check on {} failed; inactive image unknown", host),
                    )
                    .with_suggestion(format!(
                        "Run dbserver_backup.sh --check-rollback on {} and fix the reported error",
                        host
                    ))
                    .into()),
                    code => {
                        debug!(host, exit_code = code, "No rollback image available");
                        Ok(None)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor_mock::{MockExecutor, MockResponse};

    #[tokio::test]
    async fn test_active_version() {
        let mock = MockExecutor::new().on("imageinfo -ver", |_, _| {
            Some(MockResponse::ok("22.1.0.0.0.220703\n"))
        });
        let inspector = ImageInfoInspector::new(Arc::new(mock));
        let v = inspector.active_version("db1", TargetKind::Dom0).await.unwrap();
        assert_eq!(v.as_deref(), Some("22.1.0.0.0.220703"));
    }

    #[tokio::test]
    async fn test_garbage_version_is_unknown() {
        let mock = MockExecutor::new()
            .on("imageinfo -ver", |_, _| Some(MockResponse::ok("command not found")));
        let inspector = ImageInfoInspector::new(Arc::new(mock));
        assert!(
            inspector
                .active_version("db1", TargetKind::Dom0)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_dbserver_backup_exit_codes() {
        let mock = MockExecutor::new().on("dbserver_backup.sh", |call, _| {
            Some(match call.host.as_str() {
                "has" => MockResponse::ok("21.2.2.0.0.210709"),
                "same" => MockResponse {
                    exit_code: 2,
                    stdout: "22.1.0.0.0.220703".to_string(),
                },
                "broken" => MockResponse::fail(1),
                _ => MockResponse {
                    exit_code: 3,
                    stdout: "21.2.2.0.0.210709".to_string(),
                },
            })
        });
        let inspector = ImageInfoInspector::new(Arc::new(mock));
        assert_eq!(
            inspector
                .inactive_version("has", TargetKind::Dom0)
                .await
                .unwrap()
                .as_deref(),
            Some("21.2.2.0.0.210709")
        );
        assert!(
            inspector
                .inactive_version("same", TargetKind::DomU)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            inspector
                .inactive_version("none", TargetKind::Dom0)
                .await
                .unwrap()
                .is_none()
        );
        let err = inspector
            .inactive_version("broken", TargetKind::Dom0)
            .await
            .unwrap_err();
        assert_eq!(
            PatchError::from_anyhow(&err).code,
            ErrorCode::InactiveImageUnavailable
        );
    }

    #[tokio::test]
    async fn test_switch_has_no_inactive_image() {
        let inspector = ImageInfoInspector::new(Arc::new(MockExecutor::new()));
        assert!(
            inspector
                .inactive_version("sw1", TargetKind::IbSwitch)
                .await
                .unwrap()
                .is_none()
        );
    }
}
