use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use exapatch_core::error::{ErrorCode, patch_error};

use crate::executor::{RemoteExecutor, run_stdout, shell_quote};

/// Guest VM lifecycle on a hypervisor.
#[async_trait]
pub trait VmController: Send + Sync {
    /// Guests currently running on `host`.
    async fn running_vms(&self, host: &str) -> Result<Vec<String>>;

    async fn shutdown(&self, host: &str, vm: &str) -> Result<()>;

    async fn start(&self, host: &str, vm: &str) -> Result<()>;
}

/// `VmController` driving libvirt through `virsh`.
pub struct VirshController {
    exec: Arc<dyn RemoteExecutor>,
}

impl VirshController {
    pub fn new(exec: Arc<dyn RemoteExecutor>) -> Self {
        Self { exec }
    }

    async fn virsh(&self, host: &str, action: &str, vm: &str) -> Result<()> {
        let out = self
            .exec
            .run(host, &format!("virsh {} {}", action, shell_quote(vm)))
            .await?;
        if !out.success() {
            return Err(patch_error(
                ErrorCode::VmLifecycleFailed,
                format!(
                    "virsh {} {} on {} failed (exit {}): {}",
                    action,
                    vm,
                    host,
                    out.exit_code,
                    out.stderr.trim()
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl VmController for VirshController {
    async fn running_vms(&self, host: &str) -> Result<Vec<String>> {
        let stdout = run_stdout(self.exec.as_ref(), host, "virsh list --name --state-running").await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn shutdown(&self, host: &str, vm: &str) -> Result<()> {
        self.virsh(host, "shutdown", vm).await
    }

    async fn start(&self, host: &str, vm: &str) -> Result<()> {
        self.virsh(host, "start", vm).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor_mock::{MockExecutor, MockResponse};

    #[tokio::test]
    async fn test_running_vms_parses_names() {
        let mock = MockExecutor::new().on("virsh list", |_, _| {
            Some(MockResponse::ok("vm1.example.com\nvm2.example.com\n\n"))
        });
        let ctl = VirshController::new(Arc::new(mock));
        let vms = ctl.running_vms("db1").await.unwrap();
        assert_eq!(vms, vec!["vm1.example.com", "vm2.example.com"]);
    }

    #[tokio::test]
    async fn test_shutdown_failure_maps_code() {
        let mock = MockExecutor::new().on("virsh shutdown", |_, _| Some(MockResponse::fail(1)));
        let ctl = VirshController::new(Arc::new(mock.clone()));
        let err = ctl.shutdown("db1", "vm1").await.unwrap_err();
        let pe = exapatch_core::error::PatchError::from_anyhow(&err);
        assert_eq!(pe.code, ErrorCode::VmLifecycleFailed);
        assert_eq!(mock.count_calls("virsh shutdown 'vm1'"), 1);
    }
}
