use std::sync::Arc;

use anyhow::{Context, Result};
use exapatch_core::error::PatchError;
use exapatch_core::ledger::{LedgerDocument, PatchStatus, SleepFlag};
use exapatch_core::target::{Stage, TargetKind};
use tracing::{debug, info, warn};

use crate::executor::{RemoteExecutor, run_stdout, write_file};
use crate::sink::{StatusSink, StatusSnapshot};

/// Remote path of the ledger for one target kind.
pub fn ledger_path(remote_root: &str, kind: TargetKind) -> String {
    format!("{}/exapatch_{}_progress.json", remote_root, kind)
}

/// Read the ledger from the first replica that has a readable copy.
///
/// A document that is absent or unparsable everywhere means "no prior state".
pub async fn load_ledger(
    exec: &dyn RemoteExecutor,
    path: &str,
    replicas: &[String],
) -> Option<(String, LedgerDocument)> {
    for host in replicas {
        let out = match exec.run(host, &format!("cat {} 2>/dev/null", path)).await {
            Ok(out) => out,
            Err(e) => {
                debug!(host = %host, error = %e, "Ledger replica unreachable");
                continue;
            }
        };
        if !out.success() || out.stdout.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerDocument>(&out.stdout) {
            Ok(doc) => return Some((host.clone(), doc)),
            Err(e) => warn!(host = %host, error = %e, "Ignoring unparsable ledger replica"),
        }
    }
    None
}

/// Replicated per-node, per-stage progress for one request.
///
/// Every mutation is written to all replicas and published to the status
/// sink. Only the orchestrator mutates it.
pub struct ProgressLedger {
    exec: Arc<dyn RemoteExecutor>,
    sink: Arc<dyn StatusSink>,
    request_id: String,
    path: String,
    replicas: Vec<String>,
    doc: LedgerDocument,
}

impl ProgressLedger {
    /// Start a ledger from `doc`, replicated to its launch nodes.
    ///
    /// When `prior` is given (a retried request) and was written by the same
    /// kind and operation, its stage statuses are kept for nodes that are
    /// still tracked.
    pub async fn init(
        exec: Arc<dyn RemoteExecutor>,
        sink: Arc<dyn StatusSink>,
        request_id: &str,
        path: &str,
        mut doc: LedgerDocument,
        prior: Option<&LedgerDocument>,
    ) -> Result<Self> {
        let kind = doc.target_type;
        if let Some(prior) =
            prior.filter(|p| p.target_type == kind && p.operation == doc.operation)
        {
            for entry in doc.node_patching_progress_data.iter_mut() {
                if let Some(old) = prior.node(&entry.node_name) {
                    *entry = old.clone();
                }
            }
            if prior.active_launch_node.is_some() {
                doc.active_launch_node = prior.active_launch_node.clone();
            }
        }

        let ledger = Self {
            exec,
            sink,
            request_id: request_id.to_string(),
            path: path.to_string(),
            replicas: doc.launch_nodes.clone(),
            doc,
        };
        ledger.persist().await?;
        info!(
            %kind,
            nodes = ledger.doc.node_patching_progress_data.len(),
            replicas = ?ledger.replicas,
            "Progress ledger initialized"
        );
        Ok(ledger)
    }

    /// Add replica hosts and write the document to them.
    pub async fn add_replicas(&mut self, hosts: &[String]) -> Result<()> {
        for host in hosts {
            if !self.replicas.contains(host) {
                self.replicas.push(host.clone());
            }
            if !self.doc.launch_nodes.contains(host) {
                self.doc.launch_nodes.push(host.clone());
            }
        }
        if self.doc.active_launch_node.is_none() {
            self.doc.active_launch_node = hosts.first().cloned();
        }
        self.persist().await
    }

    pub fn is_sleeping(&self) -> bool {
        self.doc.sleep_infra_patch == SleepFlag::Yes
    }

    pub fn document(&self) -> &LedgerDocument {
        &self.doc
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn get(&self, node: &str, stage: Stage) -> Option<PatchStatus> {
        self.doc.stage(node, stage)
    }

    pub fn active_launch_node(&self) -> Option<&str> {
        self.doc.active_launch_node.as_deref()
    }

    /// Transition a node's stage and replicate.
    pub async fn set(&mut self, node: &str, stage: Stage, status: PatchStatus) -> Result<()> {
        if self.doc.stage(node, stage) == Some(status) {
            return Ok(());
        }
        self.doc
            .set_stage(node, stage, status)
            .with_context(|| format!("Ledger update for {} {}", node, stage))?;
        debug!(node, %stage, %status, "Ledger stage updated");
        self.persist().await
    }

    /// Set a stage only when the kind tracks it.
    pub async fn set_if_tracked(&mut self, node: &str, stage: Stage, status: PatchStatus) -> Result<()> {
        if self.doc.target_type.profile().stages.contains(&stage) {
            self.set(node, stage, status).await?;
        }
        Ok(())
    }

    /// Mark every tracked stage of `node` completed.
    pub async fn complete_all(&mut self, node: &str) -> Result<()> {
        for stage in self.doc.target_type.profile().stages {
            match self.doc.stage(node, *stage) {
                Some(PatchStatus::Completed) => {}
                Some(PatchStatus::Pending) | Some(PatchStatus::Running) | None => {
                    self.doc.set_stage(node, *stage, PatchStatus::Completed)?;
                }
                Some(PatchStatus::Sleeping) => {
                    self.doc.set_stage(node, *stage, PatchStatus::Pending)?;
                    self.doc.set_stage(node, *stage, PatchStatus::Completed)?;
                }
                Some(PatchStatus::Failed) => {
                    self.doc.set_stage(node, *stage, PatchStatus::Running)?;
                    self.doc.set_stage(node, *stage, PatchStatus::Completed)?;
                }
            }
        }
        self.persist().await
    }

    pub async fn set_details(&mut self, node: &str, details: &str) -> Result<()> {
        if let Some(entry) = self.doc.node_mut(node) {
            entry.status_details = details.to_string();
            entry.last_updated_time = exapatch_core::time::utc_now();
        }
        self.persist().await
    }

    /// Record the tool invocation now responsible for `nodes`.
    pub async fn record_invocation(&mut self, nodes: &[String], launch_node: &str, log_dir: &str) -> Result<()> {
        for node in nodes {
            if let Some(entry) = self.doc.node_mut(node) {
                entry.log_dir = Some(log_dir.to_string());
                entry.status_details = format!("patching via {}", launch_node);
                entry.last_updated_time = exapatch_core::time::utc_now();
            }
        }
        self.persist().await
    }

    /// Point the ledger at the launch node now driving the tool.
    ///
    /// The switch lands in a single document write, so readers see either
    /// the old or the new active node.
    pub async fn set_launch_node(&mut self, host: &str) -> Result<()> {
        if self.doc.active_launch_node.as_deref() == Some(host) {
            return Ok(());
        }
        info!(
            from = self.doc.active_launch_node.as_deref().unwrap_or("-"),
            to = host,
            "Switching active launch node"
        );
        self.doc.active_launch_node = Some(host.to_string());
        if !self.doc.launch_nodes.iter().any(|h| h == host) {
            self.doc.launch_nodes.push(host.to_string());
        }
        if !self.replicas.iter().any(|h| h == host) {
            self.replicas.push(host.to_string());
        }
        self.persist().await
    }

    pub async fn set_sleeping(&mut self, sleeping: bool) -> Result<()> {
        self.doc.sleep_infra_patch = if sleeping { SleepFlag::Yes } else { SleepFlag::No };
        self.persist().await
    }

    /// Publish the current snapshot with an error attached.
    pub fn publish_error(&self, error: &PatchError) {
        StatusSnapshot::new(&self.request_id, &self.doc, Some(error)).publish(self.sink.as_ref());
    }

    /// Write the document to every replica; fails only if no replica took it.
    async fn persist(&self) -> Result<()> {
        let body = serde_json::to_string_pretty(&self.doc).context("Failed to serialize ledger")?;
        let tmp = format!("{}.tmp", self.path);
        let mut written = 0usize;
        let mut last_err = None;

        for host in &self.replicas {
            let res = async {
                write_file(self.exec.as_ref(), host, &tmp, &body).await?;
                run_stdout(self.exec.as_ref(), host, &format!("mv -f {} {}", tmp, self.path))
                    .await?;
                Ok::<(), anyhow::Error>(())
            }
            .await;
            match res {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(host = %host, error = %e, "Ledger replica write failed");
                    last_err = Some(e);
                }
            }
        }

        StatusSnapshot::new(&self.request_id, &self.doc, None).publish(self.sink.as_ref());

        if written == 0
            && let Some(e) = last_err
        {
            return Err(e.context(format!("Ledger {} could not be written to any replica", self.path)));
        }
        Ok(())
    }
}
