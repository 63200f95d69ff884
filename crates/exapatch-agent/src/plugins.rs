use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use exapatch_core::error::{ErrorCode, PatchError};
use exapatch_core::target::TargetKind;
use exapatch_runtime::executor::RemoteExecutor;
use tracing::{debug, info};

/// Operator-supplied actions around each node's patch.
#[async_trait]
pub trait PluginHooks: Send + Sync {
    async fn pre_patch(&self, kind: TargetKind, node: &str) -> Result<()>;
    async fn post_patch(&self, kind: TargetKind, node: &str) -> Result<()>;
    /// One-off action for the `oneoff` / `oneoff_v2` operations.
    async fn oneoff(&self, node: &str, v2: bool) -> Result<()>;
}

/// Runs `<plugin_dir>/<name>.sh <node>` on the node when the script exists.
pub struct ScriptPlugins {
    exec: Arc<dyn RemoteExecutor>,
    plugin_dir: String,
}

impl ScriptPlugins {
    pub fn new(exec: Arc<dyn RemoteExecutor>, plugin_dir: &str) -> Self {
        Self {
            exec,
            plugin_dir: plugin_dir.trim_end_matches('/').to_string(),
        }
    }

    pub fn script_path(&self, name: &str) -> String {
        format!("{}/{}.sh", self.plugin_dir, name)
    }

    async fn run_script(&self, name: &str, node: &str) -> Result<()> {
        let script = self.script_path(name);
        if !self.exec.exists(node, &script).await? {
            debug!(node, script = %script, "No plugin script");
            return Ok(());
        }
        info!(node, script = %script, "Running plugin");
        let out = self.exec.run(node, &format!("{} {}", script, node)).await?;
        if !out.success() {
            return Err(PatchError::new(
                ErrorCode::PatchOperationFailed,
                format!(
                    "Plugin {} failed on {} (exit {}): {}",
                    script,
                    node,
                    out.exit_code,
                    out.stderr.trim()
                ),
            )
            .with_suggestion(format!("Check {} on {}", script, node))
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl PluginHooks for ScriptPlugins {
    async fn pre_patch(&self, kind: TargetKind, node: &str) -> Result<()> {
        self.run_script(&format!("pre_{}", kind), node).await
    }

    async fn post_patch(&self, kind: TargetKind, node: &str) -> Result<()> {
        self.run_script(&format!("post_{}", kind), node).await
    }

    async fn oneoff(&self, node: &str, v2: bool) -> Result<()> {
        self.run_script(if v2 { "oneoff_v2" } else { "oneoff" }, node)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exapatch_runtime::executor_mock::{MockExecutor, MockResponse};

    #[tokio::test]
    async fn test_missing_script_is_skipped() {
        let mock = MockExecutor::new();
        let plugins = ScriptPlugins::new(Arc::new(mock.clone()), "/opt/exapatch/plugins/");
        plugins.pre_patch(TargetKind::Dom0, "db1").await.unwrap();
        assert_eq!(mock.count_calls("pre_dom0.sh db1"), 0);
    }

    #[tokio::test]
    async fn test_script_runs_with_node_argument() {
        let mock = MockExecutor::new()
            .with_file("db1", "/opt/exapatch/plugins/post_domu.sh", "#!/bin/sh")
            .with_file("db1", "/opt/exapatch/plugins/oneoff_v2.sh", "#!/bin/sh");
        let plugins = ScriptPlugins::new(Arc::new(mock.clone()), "/opt/exapatch/plugins");
        plugins.post_patch(TargetKind::DomU, "db1").await.unwrap();
        plugins.oneoff("db1", true).await.unwrap();
        assert_eq!(mock.count_calls("/opt/exapatch/plugins/post_domu.sh db1"), 1);
        assert_eq!(mock.count_calls("/opt/exapatch/plugins/oneoff_v2.sh db1"), 1);
    }

    #[tokio::test]
    async fn test_failing_script_is_an_error() {
        let mock = MockExecutor::new()
            .with_file("db1", "/p/pre_cell.sh", "#!/bin/sh")
            .on("/p/pre_cell.sh db1", |_, _| Some(MockResponse::fail(3)));
        let plugins = ScriptPlugins::new(Arc::new(mock), "/p");
        let err = plugins.pre_patch(TargetKind::Cell, "db1").await.unwrap_err();
        assert!(err.to_string().contains("exit 3"));
    }
}
