use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use exapatch_core::config::PatchConfig;
use exapatch_core::error::{ErrorCode, ErrorSlot, PatchError, patch_error};
use exapatch_core::ledger::{LedgerDocument, PatchStatus};
use exapatch_core::outcome::PatchOutcome;
use exapatch_core::target::{OpStyle, Operation, Stage, TargetKind};
use exapatch_core::version;
use exapatch_runtime::executor::RemoteExecutor;
use exapatch_runtime::filter::{DiscardReason, Discarded, FilterResult, filter_nodes};
use exapatch_runtime::health::{
    CheckPolicy, HealthProbe, HealthValidationSuite, PdbSnapshot, ShellHealthProbe,
};
use exapatch_runtime::inspect::{ImageInfoInspector, NodeInspector};
use exapatch_runtime::ledger_store::{ProgressLedger, ledger_path, load_ledger};
use exapatch_runtime::parallel::{ParallelSettings, ParallelTaskRunner};
use exapatch_runtime::session::{
    CONSOLE_FILE, ExternalToolSession, SessionOutcome, SessionReport, SessionTimings, ToolRequest,
    parse_exit_marker, renamed_log_dir,
};
use exapatch_runtime::sink::{StatusSink, StatusSnapshot};
use exapatch_runtime::staging::{
    LaunchNodeSelector, LaunchNodeState, LaunchNodes, LaunchSelection, Payload, StagingOptions,
};
use exapatch_runtime::vm::{VirshController, VmController};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::plan::{NodeGroup, launch_candidates, plan_groups, required_launch_nodes};
use crate::plugins::{PluginHooks, ScriptPlugins};
use crate::request::PatchRequest;

// ============================================================================
// Collaborators and run bookkeeping
// ============================================================================

/// Everything the orchestrator talks to. Swapped wholesale in tests.
#[derive(Clone)]
pub struct Collaborators {
    pub exec: Arc<dyn RemoteExecutor>,
    pub inspector: Arc<dyn NodeInspector>,
    pub probe: Arc<dyn HealthProbe>,
    pub vms: Arc<dyn VmController>,
    pub plugins: Arc<dyn PluginHooks>,
    pub sink: Arc<dyn StatusSink>,
}

impl Collaborators {
    /// Shell-backed collaborators sharing one executor.
    pub fn over_executor(
        exec: Arc<dyn RemoteExecutor>,
        config: &PatchConfig,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            inspector: Arc::new(ImageInfoInspector::new(Arc::clone(&exec))),
            probe: Arc::new(ShellHealthProbe::new(
                Arc::clone(&exec),
                &config.engine.plugin_dir,
            )),
            vms: Arc::new(VirshController::new(Arc::clone(&exec))),
            plugins: Arc::new(ScriptPlugins::new(
                Arc::clone(&exec),
                &config.engine.plugin_dir,
            )),
            sink,
            exec,
        }
    }
}

/// Orchestration phases, in the order a full run enters them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Environment,
    Filter,
    Idempotency,
    Staging,
    CustomCheck,
    RollingLoop,
    NonRollingLoop,
    Aggregate,
    Cleanup,
    Done,
}

/// What one run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub patched: Vec<String>,
    pub discarded: Vec<String>,
    pub resumed: Vec<String>,
    pub launch_nodes: Vec<String>,
    pub sessions: u32,
    pub errors: Vec<String>,
}

/// Mutable state threaded through one run.
#[derive(Default)]
struct RunState {
    slot: ErrorSlot,
    ledger: Option<ProgressLedger>,
    /// Hosts probed for a live tool session before each launch.
    session_hosts: Vec<String>,
    /// The next invocation may adopt a session left by the earlier attempt.
    adopt_session: bool,
    /// Inactive image per node captured before a rollback.
    inactive_before: HashMap<String, String>,
    nodes_done: usize,
}

impl RunState {
    fn ledger(&mut self) -> Result<&mut ProgressLedger> {
        self.ledger
            .as_mut()
            .context("Progress ledger used before initialization")
    }
}

/// Prior-attempt work found in the ledger of a retried request.
#[derive(Debug, Default, PartialEq, Eq)]
struct ResumePlan {
    /// Nodes whose tool invocation was still running.
    running: Vec<ResumeNode>,
    /// Nodes whose tool finished but whose post-patch stage did not.
    post_only: Vec<String>,
}

impl ResumePlan {
    fn is_empty(&self) -> bool {
        self.running.is_empty() && self.post_only.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResumeNode {
    node: String,
    launch_node: Option<String>,
    log_dir: Option<String>,
}

/// How an earlier tool invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PriorRun {
    Finished,
    Failed(i32),
}

/// Guests stopped for a non-rolling pass.
#[derive(Debug, Default)]
struct StoppedGuests {
    /// (host, vm)
    vms: Vec<(String, String)>,
    /// Guests whose CRS has to be started once they are back.
    manual_crs: Vec<String>,
}

impl StoppedGuests {
    fn on(&self, host: &str) -> Vec<String> {
        self.vms
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, vm)| vm.clone())
            .collect()
    }
}

/// Split prior ledger progress into resume work, pulling those nodes out of
/// `filter`. Nodes completed earlier move to the discarded side.
fn plan_resume(prior: &LedgerDocument, selected: &[String], filter: &mut FilterResult) -> ResumePlan {
    let mut plan = ResumePlan::default();
    for node in selected {
        let Some(entry) = prior.node(node) else {
            continue;
        };
        let patch = entry.stages.get(&Stage::PatchMgr).copied();
        let status = entry.derived_status();

        if patch == Some(PatchStatus::Running) {
            plan.running.push(ResumeNode {
                node: node.clone(),
                launch_node: prior.active_launch_node.clone(),
                log_dir: entry.log_dir.clone(),
            });
        } else if status == PatchStatus::Completed {
            if !filter.is_discarded(node) {
                filter.to_patch.retain(|n| n != node);
                filter.discarded.push(Discarded {
                    node: node.clone(),
                    reason: DiscardReason::CompletedEarlier,
                });
            }
            continue;
        } else if patch == Some(PatchStatus::Completed) {
            plan.post_only.push(node.clone());
        } else {
            continue;
        }
        filter.to_patch.retain(|n| n != node);
        filter.discarded.retain(|d| d.node != *node);
    }
    plan
}

/// Hosts for heartbeat and CRS checks after `node` is patched.
fn health_targets(kind: TargetKind, node: &str, guests: &[String]) -> (Vec<String>, Vec<String>) {
    match kind {
        TargetKind::Dom0 => {
            let mut heartbeat = vec![node.to_string()];
            heartbeat.extend(guests.iter().cloned());
            (heartbeat, guests.to_vec())
        }
        TargetKind::DomU => (vec![node.to_string()], vec![node.to_string()]),
        _ => (vec![node.to_string()], Vec::new()),
    }
}

/// Hosts whose PDBs are affected by patching `node`.
fn pdb_hosts(kind: TargetKind, node: &str, guests: &[String]) -> Vec<String> {
    match kind {
        TargetKind::Dom0 => guests.to_vec(),
        TargetKind::DomU => vec![node.to_string()],
        _ => Vec::new(),
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives one request through filter, staging, tool sessions and health
/// validation, and reduces everything to a [`PatchOutcome`].
pub struct PatchOrchestrator {
    config: PatchConfig,
    deps: Collaborators,
    health: HealthValidationSuite,
    runner: ParallelTaskRunner,
    timings: SessionTimings,
    phases: Vec<Phase>,
    summary: RunSummary,
}

impl PatchOrchestrator {
    pub fn new(config: PatchConfig, deps: Collaborators) -> Self {
        let health = HealthValidationSuite::from_config(Arc::clone(&deps.probe), &config);
        let runner = ParallelTaskRunner::new(ParallelSettings::from_config(&config));
        let timings = SessionTimings::from_config(&config);
        Self {
            config,
            deps,
            health,
            runner,
            timings,
            phases: Vec::new(),
            summary: RunSummary::default(),
        }
    }

    /// Override the polling cadence derived from the config.
    pub fn with_session_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Phases entered by the last run.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    fn enter(&mut self, phase: Phase) {
        debug!(?phase, "Entering phase");
        self.phases.push(phase);
    }

    /// Run `req` to completion. Never panics and never returns an error: every
    /// failure is folded into `PatchOutcome::Failure` with the most specific
    /// code seen.
    #[instrument(skip_all, fields(request_id = %req.request_id, kind = %req.target_kind, operation = %req.operation))]
    pub async fn run(&mut self, req: &PatchRequest) -> PatchOutcome {
        self.phases.clear();
        self.summary = RunSummary::default();
        let mut st = RunState::default();

        let outcome = match self.execute(req, &mut st).await {
            Ok(outcome) => outcome,
            Err(e) => {
                st.slot.record(PatchError::from_anyhow(&e));
                let err = st
                    .slot
                    .take()
                    .unwrap_or_else(|| PatchError::from_anyhow(&e));
                error!(
                    code = %err.code,
                    error = %format!("{:#}", e),
                    suggestion = %err.suggestion,
                    "Operation failed"
                );
                self.summary.errors.push(err.message.clone());
                PatchOutcome::Failure(err)
            }
        };

        self.enter(Phase::Cleanup);
        self.cleanup(req, &mut st, &outcome).await;
        self.enter(Phase::Done);
        info!(
            code = outcome.code(),
            patched = self.summary.patched.len(),
            discarded = self.summary.discarded.len(),
            resumed = self.summary.resumed.len(),
            "Operation finished"
        );
        outcome
    }

    async fn execute(&mut self, req: &PatchRequest, st: &mut RunState) -> Result<PatchOutcome> {
        self.enter(Phase::Init);
        req.validate()?;
        let kind = req.target_kind;
        let op = req.operation;
        let selected = req.selected_nodes();
        info!(nodes = ?selected, retried = req.retried, "Starting operation");

        self.enter(Phase::Environment);
        let style = req.style.resolve(kind);
        let payload = match (&req.payload, op.tool_action()) {
            (Some(spec), Some(_)) => Some(Payload::from_file(
                &spec.path,
                req.bundle_name(),
                spec.tool.as_str(),
            )?),
            _ => None,
        };

        match op {
            Operation::Postcheck => return self.postcheck(req, &selected).await,
            Operation::Oneoff | Operation::OneoffV2 => return self.oneoff(req, &selected).await,
            _ => {}
        }

        self.enter(Phase::Filter);
        let mut filter = filter_nodes(
            self.deps.inspector.as_ref(),
            &selected,
            kind,
            op,
            req.target_version.as_deref(),
        )
        .await?;

        self.enter(Phase::Idempotency);
        let path = ledger_path(&self.config.engine.remote_root, kind);
        let prior = if req.retried {
            load_ledger(self.deps.exec.as_ref(), &path, &req.ledger_replicas())
                .await
                .filter(|(_, doc)| doc.operation == Some(op) && doc.target_type == kind)
        } else {
            None
        };
        let resume = match &prior {
            Some((_, doc)) => plan_resume(doc, &selected, &mut filter),
            None => ResumePlan::default(),
        };
        self.summary.discarded = filter.discarded_nodes();

        if filter.to_patch.is_empty() && resume.is_empty() {
            info!(discarded = filter.discarded.len(), "No node needs the operation");
            self.publish_no_action(req, &selected, &filter);
            return Ok(PatchOutcome::NoActionRequired);
        }

        let mut replicas: Vec<String> = Vec::new();
        if let Some((host, doc)) = &prior {
            replicas.push(host.clone());
            for h in &doc.launch_nodes {
                if !replicas.contains(h) {
                    replicas.push(h.clone());
                }
            }
            if let Some(active) = &doc.active_launch_node {
                st.session_hosts.push(active.clone());
            }
        }
        let doc = LedgerDocument::new(kind, &selected, &replicas).with_operation(op);
        st.ledger = Some(
            ProgressLedger::init(
                Arc::clone(&self.deps.exec),
                Arc::clone(&self.deps.sink),
                &req.request_id,
                &path,
                doc,
                prior.as_ref().map(|(_, d)| d),
            )
            .await?,
        );
        st.adopt_session = req.retried && resume.running.is_empty();

        for discarded in &filter.discarded {
            let ledger = st.ledger()?;
            if ledger
                .document()
                .node(&discarded.node)
                .is_some_and(|n| n.derived_status() == PatchStatus::Completed)
            {
                continue;
            }
            ledger.complete_all(&discarded.node).await?;
            ledger
                .set_details(&discarded.node, &format!("skipped: {}", discarded.reason))
                .await?;
        }

        self.resume_prior(req, st, &resume).await?;
        if filter.to_patch.is_empty() {
            self.enter(Phase::Aggregate);
            return Ok(PatchOutcome::Success);
        }

        self.enter(Phase::Staging);
        let Some(payload) = payload else {
            return Err(patch_error(
                ErrorCode::PatchOperationFailed,
                format!("{} requires a payload", op),
            ));
        };
        let launch = self.select_launch_nodes(req, &filter, &payload).await?;
        for host in launch
            .hosts()
            .into_iter()
            .chain(req.ledger_replicas())
            .chain(launch_candidates(req, &filter))
        {
            if !st.session_hosts.contains(&host) {
                st.session_hosts.push(host);
            }
        }
        self.summary.launch_nodes = launch.hosts();
        st.ledger()?.add_replicas(&launch.hosts()).await?;

        self.enter(Phase::CustomCheck);
        self.custom_checks(req, &filter.to_patch).await?;
        if op == Operation::Rollback {
            for node in &filter.to_patch {
                let inactive = self.deps.inspector.inactive_version(node, kind).await?;
                let Some(inactive) = inactive else {
                    return Err(PatchError::new(
                        ErrorCode::InactiveImageUnavailable,
                        format!("Rollback image of {} disappeared before the rollback", node),
                    )
                    .with_suggestion(format!("Check the backup partition of {}", node))
                    .into());
                };
                st.inactive_before.insert(node.clone(), inactive);
            }
        }

        let groups = plan_groups(&launch, &filter.to_patch);
        let engine_rolling =
            style == OpStyle::Rolling && kind.profile().engine_rolling && op.mutates_image();
        if engine_rolling {
            self.enter(Phase::RollingLoop);
            for group in &groups {
                self.rolling_pass(req, st, group).await?;
            }
        } else {
            self.enter(Phase::NonRollingLoop);
            let tool_rolling = style == OpStyle::Rolling && !kind.profile().engine_rolling;
            for group in &groups {
                self.group_pass(req, st, group, tool_rolling).await?;
            }
        }

        self.enter(Phase::Aggregate);
        info!(
            patched = ?self.summary.patched,
            sessions = self.summary.sessions,
            "All targeted nodes completed"
        );
        Ok(PatchOutcome::Success)
    }

    async fn cleanup(&mut self, req: &PatchRequest, st: &mut RunState, outcome: &PatchOutcome) {
        match st.ledger.as_mut() {
            Some(ledger) => {
                if ledger.is_sleeping()
                    && let Err(e) = ledger.set_sleeping(false).await
                {
                    warn!(error = %e, "Failed to clear the sleep flag");
                }
                if let PatchOutcome::Failure(err) = outcome {
                    ledger.publish_error(err);
                }
            }
            None => {
                if let PatchOutcome::Failure(err) = outcome {
                    let doc = LedgerDocument::new(req.target_kind, &req.selected_nodes(), &[])
                        .with_operation(req.operation);
                    StatusSnapshot::new(&req.request_id, &doc, Some(err))
                        .publish(self.deps.sink.as_ref());
                }
            }
        }
    }

    /// Status for a run that had nothing to do: every node reported complete.
    fn publish_no_action(&self, req: &PatchRequest, selected: &[String], filter: &FilterResult) {
        let kind = req.target_kind;
        let mut doc = LedgerDocument::new(kind, selected, &[]).with_operation(req.operation);
        for node in selected {
            for stage in kind.profile().stages {
                if let Err(e) = doc.set_stage(node, *stage, PatchStatus::Completed) {
                    warn!(node = %node, error = %e, "Could not mark node completed");
                }
            }
            let reason = filter
                .discarded
                .iter()
                .find(|d| d.node == *node)
                .map(|d| d.reason.to_string())
                .unwrap_or_else(|| "no action required".to_string());
            if let Some(entry) = doc.node_mut(node) {
                entry.status_details = format!("skipped: {}", reason);
            }
        }
        StatusSnapshot::new(&req.request_id, &doc, None).publish(self.deps.sink.as_ref());
    }

    async fn select_launch_nodes(
        &self,
        req: &PatchRequest,
        filter: &FilterResult,
        payload: &Payload,
    ) -> Result<LaunchNodes> {
        let kind = req.target_kind;
        let candidates = launch_candidates(req, filter);
        let selector = LaunchNodeSelector::new(
            Arc::clone(&self.deps.exec),
            Arc::clone(&self.deps.inspector),
            StagingOptions::from_config(&self.config),
        );
        let launch_kind = if kind.profile().self_hosting {
            kind
        } else {
            TargetKind::Dom0
        };
        selector
            .select(
                LaunchSelection {
                    candidates: &candidates,
                    targets: &filter.to_patch,
                    external: req.external_launch_node.as_deref(),
                    required: required_launch_nodes(kind, req.external_launch_node.is_some()),
                    launch_kind,
                },
                payload,
            )
            .await
    }

    async fn custom_checks(&self, req: &PatchRequest, nodes: &[String]) -> Result<()> {
        let kind = req.target_kind;
        if !kind.profile().self_hosting {
            return Ok(());
        }
        let policy = CheckPolicy::for_operation(req.operation);
        let checks = &self.config.checks;
        if checks.stale_mounts {
            self.health.stale_mounts(nodes, policy).await?;
        }
        if checks.min_free_space_mb > 0 {
            self.health
                .free_space(nodes, &checks.free_space_path, checks.min_free_space_mb, policy)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------------

    /// One node at a time through `group.launch`; stops at the first failure.
    #[instrument(skip_all, fields(launch_node = %group.launch.host, nodes = group.nodes.len()))]
    async fn rolling_pass(&mut self, req: &PatchRequest, st: &mut RunState, group: &NodeGroup) -> Result<()> {
        st.ledger()?.set_launch_node(&group.launch.host).await?;
        for node in &group.nodes {
            if st.nodes_done > 0 && req.sleeps_between_nodes() {
                self.pause_before(req, st, node).await?;
            }
            self.patch_node(req, st, &group.launch, node).await?;
            st.nodes_done += 1;
        }
        Ok(())
    }

    async fn pause_before(&self, req: &PatchRequest, st: &mut RunState, node: &str) -> Result<()> {
        let pause = self.config.inter_node_sleep();
        if pause.is_zero() {
            return Ok(());
        }
        let Some(stage) = req.target_kind.profile().stages.first().copied() else {
            return Ok(());
        };
        let ledger = st.ledger()?;
        let marked = ledger.get(node, stage) == Some(PatchStatus::Pending);
        if marked {
            ledger.set(node, stage, PatchStatus::Sleeping).await?;
        }
        ledger.set_sleeping(true).await?;
        info!(node, secs = pause.as_secs(), "Sleeping before next node");
        tokio::time::sleep(pause).await;
        if marked {
            ledger.set(node, stage, PatchStatus::Pending).await?;
        }
        ledger.set_sleeping(false).await
    }

    #[instrument(skip_all, fields(node = %node))]
    async fn patch_node(
        &mut self,
        req: &PatchRequest,
        st: &mut RunState,
        launch: &LaunchNodeState,
        node: &str,
    ) -> Result<()> {
        let kind = req.target_kind;
        let policy = CheckPolicy::for_operation(req.operation);
        let guests = self.guests(kind, node).await?;

        self.pre_patch(req, st, node).await?;
        let pdbs = self
            .health
            .capture_pdbs(&pdb_hosts(kind, node, &guests), policy)
            .await?;
        let manual_crs = self.manual_crs_guests(req, &guests).await;

        let nodes = [node.to_string()];
        self.invoke(req, st, launch, &nodes, false).await?;
        self.verify_versions(req, st, &nodes).await?;
        st.ledger()?
            .set(node, Stage::PatchMgr, PatchStatus::Completed)
            .await?;
        self.health.start_crs(&manual_crs, policy).await?;

        self.post_patch(req, st, node, &guests, &pdbs).await?;
        self.summary.patched.push(node.to_string());
        Ok(())
    }

    /// All of `group.nodes` in one tool invocation. Guests on image-changing
    /// passes are stopped first and always restarted afterwards.
    #[instrument(skip_all, fields(launch_node = %group.launch.host, nodes = group.nodes.len()))]
    async fn group_pass(
        &mut self,
        req: &PatchRequest,
        st: &mut RunState,
        group: &NodeGroup,
        tool_rolling: bool,
    ) -> Result<()> {
        let kind = req.target_kind;
        let op = req.operation;
        let policy = CheckPolicy::for_operation(op);
        st.ledger()?.set_launch_node(&group.launch.host).await?;

        for node in &group.nodes {
            self.pre_patch(req, st, node).await?;
        }

        let cycle_vms = kind.profile().hosts_vms && op.mutates_image();
        let stopped = if cycle_vms {
            self.stop_guests(&group.nodes).await?
        } else {
            StoppedGuests::default()
        };

        let mut guests: HashMap<String, Vec<String>> = HashMap::new();
        let mut pdb_targets: Vec<String> = Vec::new();
        for node in &group.nodes {
            let node_guests = if cycle_vms {
                stopped.on(node)
            } else {
                self.guests(kind, node).await?
            };
            if !cycle_vms {
                pdb_targets.extend(pdb_hosts(kind, node, &node_guests));
            }
            guests.insert(node.clone(), node_guests);
        }
        let pdbs = self.health.capture_pdbs(&pdb_targets, policy).await?;

        let tool = self
            .invoke(req, st, &group.launch, &group.nodes, tool_rolling)
            .await;
        if let Err(e) = &tool {
            st.slot.record(PatchError::from_anyhow(e));
        }
        if cycle_vms && let Err(e) = self.restore_guests(&stopped, policy).await {
            st.slot.record(PatchError::from_anyhow(&e));
            self.summary.errors.push(format!("{:#}", e));
            if tool.is_ok() {
                return Err(e);
            }
        }
        tool?;

        self.verify_versions(req, st, &group.nodes).await?;
        for node in &group.nodes {
            st.ledger()?
                .set(node, Stage::PatchMgr, PatchStatus::Completed)
                .await?;
        }
        for node in &group.nodes {
            let node_guests = guests.remove(node).unwrap_or_default();
            self.post_patch(req, st, node, &node_guests, &pdbs).await?;
            self.summary.patched.push(node.clone());
            st.nodes_done += 1;
        }
        Ok(())
    }

    /// Run one tool invocation for `nodes` and map a bad ending to an error.
    async fn invoke(
        &mut self,
        req: &PatchRequest,
        st: &mut RunState,
        launch: &LaunchNodeState,
        nodes: &[String],
        tool_rolling: bool,
    ) -> Result<SessionReport> {
        let kind = req.target_kind;
        let op = req.operation;
        let Some(first) = nodes.iter().min() else {
            return Err(patch_error(
                ErrorCode::InternalException,
                "Tool invocation without nodes",
            ));
        };
        let log_dir = launch.log_dir(kind, op, first);
        {
            let ledger = st.ledger()?;
            for node in nodes {
                ledger.set(node, Stage::PatchMgr, PatchStatus::Running).await?;
            }
            ledger
                .record_invocation(nodes, &launch.host, &log_dir)
                .await?;
        }

        let tool_req = ToolRequest {
            kind,
            operation: op,
            nodes: nodes.to_vec(),
            target_version: req.target_version.clone(),
            exasplice: req.exasplice,
            tool_rolling,
            backup: req.backup,
            retried: std::mem::take(&mut st.adopt_session),
        };
        let sink = Arc::clone(&self.deps.sink);
        let request_id = req.request_id.clone();
        let mut session = ExternalToolSession::new(Arc::clone(&self.deps.exec), self.timings)
            .with_progress_hook(move |host, count| {
                sink.update_status(
                    &format!("{}.progress", request_id),
                    &json!({
                        "request_id": request_id,
                        "launch_node": host,
                        "progress": count.to_string(),
                        "finished": count.finished,
                        "total": count.total,
                    }),
                );
            });

        let report = match session.execute(launch, &tool_req, &st.session_hosts).await {
            Ok(report) => report,
            Err(e) => {
                self.mark_failed(st, nodes, Stage::PatchMgr).await;
                return Err(e);
            }
        };
        self.summary.sessions += 1;

        let where_logs = report.final_log_dir.as_deref().unwrap_or(&report.log_dir);
        match report.outcome {
            SessionOutcome::Succeeded => {
                let ledger = st.ledger()?;
                for node in nodes {
                    ledger
                        .set_details(node, &format!("{} completed via {}", op, report.launch_node))
                        .await?;
                }
                Ok(report)
            }
            SessionOutcome::Failed { exit_code } => {
                self.mark_failed(st, nodes, Stage::PatchMgr).await;
                let detail = format!("patch tool exited {} (logs {})", exit_code, where_logs);
                for node in nodes {
                    if let Err(e) = st.ledger()?.set_details(node, &detail).await {
                        warn!(node = %node, error = %e, "Failed to record details");
                    }
                }
                Err(PatchError::new(
                    ErrorCode::ToolCommandFailed,
                    format!(
                        "{} {} on {:?} failed with exit status {}",
                        kind, op, nodes, exit_code
                    ),
                )
                .with_suggestion(format!(
                    "Inspect {} on {}{}",
                    where_logs,
                    report.launch_node,
                    report
                        .diag_bundle
                        .as_deref()
                        .map(|b| format!(" (diagnostics in {})", b))
                        .unwrap_or_default()
                ))
                .into())
            }
            SessionOutcome::TimedOut => Err(PatchError::new(
                ErrorCode::ConsoleReadTimeout,
                format!(
                    "No exit status from the patch tool on {} within {}s",
                    report.launch_node,
                    self.timings.timeout.as_secs()
                ),
            )
            .with_suggestion(format!(
                "The tool may still be running; retry the request to resume polling {}",
                report.log_dir
            ))
            .into()),
        }
    }

    /// Check each node reports the version the operation should have produced.
    async fn verify_versions(&self, req: &PatchRequest, st: &mut RunState, nodes: &[String]) -> Result<()> {
        let kind = req.target_kind;
        for node in nodes {
            let expected = match req.operation {
                Operation::Patch => req.target_version.clone(),
                Operation::Rollback => st.inactive_before.get(node).cloned(),
                _ => None,
            };
            let Some(expected) = expected else {
                continue;
            };
            let active = self.deps.inspector.active_version(node, kind).await?;
            let matches = active
                .as_deref()
                .and_then(|a| version::compare(a, &expected))
                .is_some_and(|o| o.is_eq());
            if matches {
                continue;
            }

            self.mark_failed(st, std::slice::from_ref(node), Stage::PatchMgr)
                .await;
            let active = active.unwrap_or_else(|| "unknown".to_string());
            let err = if req.operation == Operation::Rollback {
                PatchError::new(
                    ErrorCode::VersionMismatchDuringRollback,
                    format!(
                        "{} reports {} after rollback, expected {}",
                        node, active, expected
                    ),
                )
            } else {
                PatchError::new(
                    ErrorCode::PostchecksFailed,
                    format!("{} reports {} after patch, expected {}", node, active, expected),
                )
            };
            return Err(err
                .with_suggestion(format!("Check the image state of {} before retrying", node))
                .into());
        }
        Ok(())
    }

    async fn mark_failed(&self, st: &mut RunState, nodes: &[String], stage: Stage) {
        let Ok(ledger) = st.ledger() else {
            return;
        };
        for node in nodes {
            if ledger.get(node, stage) != Some(PatchStatus::Running) {
                continue;
            }
            if let Err(e) = ledger.set(node, stage, PatchStatus::Failed).await {
                warn!(node = %node, %stage, error = %e, "Failed to record stage failure");
            }
        }
    }

    /// Whether `stage` still needs to run for `node`; marks it running.
    async fn begin_stage(&self, kind: TargetKind, st: &mut RunState, node: &str, stage: Stage) -> Result<bool> {
        if !kind.profile().stages.contains(&stage) {
            return Ok(true);
        }
        let ledger = st.ledger()?;
        if ledger.get(node, stage) == Some(PatchStatus::Completed) {
            return Ok(false);
        }
        ledger.set(node, stage, PatchStatus::Running).await?;
        Ok(true)
    }

    async fn end_stage(
        &self,
        kind: TargetKind,
        st: &mut RunState,
        node: &str,
        stage: Stage,
        result: Result<()>,
    ) -> Result<()> {
        if !kind.profile().stages.contains(&stage) {
            return result;
        }
        match result {
            Ok(()) => {
                st.ledger()?
                    .set(node, stage, PatchStatus::Completed)
                    .await
            }
            Err(e) => {
                self.mark_failed(st, &[node.to_string()], stage).await;
                Err(e)
            }
        }
    }

    async fn pre_patch(&self, req: &PatchRequest, st: &mut RunState, node: &str) -> Result<()> {
        let kind = req.target_kind;
        if !self.begin_stage(kind, st, node, Stage::PrePatch).await? {
            return Ok(());
        }
        let result = if req.operation.mutates_image() {
            self.deps.plugins.pre_patch(kind, node).await
        } else {
            Ok(())
        };
        self.end_stage(kind, st, node, Stage::PrePatch, result).await
    }

    async fn post_patch(
        &self,
        req: &PatchRequest,
        st: &mut RunState,
        node: &str,
        guests: &[String],
        pdbs: &PdbSnapshot,
    ) -> Result<()> {
        let kind = req.target_kind;
        if !self.begin_stage(kind, st, node, Stage::PostPatch).await? {
            return Ok(());
        }
        let policy = CheckPolicy::for_operation(req.operation);
        let result = async {
            let (heartbeat, crs) = health_targets(kind, node, guests);
            self.health.heartbeat(&heartbeat, policy).await?;
            if !crs.is_empty() {
                self.health.crs(&crs, policy).await?;
            }
            let own: PdbSnapshot = pdb_hosts(kind, node, guests)
                .iter()
                .filter_map(|h| pdbs.get(h).map(|states| (h.clone(), states.clone())))
                .collect();
            self.health.pdb_degradation(&own, policy).await?;
            if req.operation.mutates_image() {
                self.deps.plugins.post_patch(kind, node).await?;
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;
        self.end_stage(kind, st, node, Stage::PostPatch, result).await
    }

    async fn guests(&self, kind: TargetKind, node: &str) -> Result<Vec<String>> {
        if kind.profile().hosts_vms {
            self.deps.vms.running_vms(node).await
        } else {
            Ok(Vec::new())
        }
    }

    async fn stop_guests(&self, hosts: &[String]) -> Result<StoppedGuests> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        for host in hosts {
            for vm in self.deps.vms.running_vms(host).await? {
                pairs.push((host.clone(), vm));
            }
        }
        if pairs.is_empty() {
            return Ok(StoppedGuests::default());
        }
        let vms: Vec<String> = pairs.iter().map(|(_, vm)| vm.clone()).collect();
        let manual_crs = self.health.crs_manual_start(&vms).await;
        let keys: Vec<String> = pairs.iter().map(|(h, v)| format!("{}/{}", h, v)).collect();
        let report = self
            .runner
            .run("vm_shutdown", &keys, |key| {
                let vms = Arc::clone(&self.deps.vms);
                async move {
                    let (host, vm) = key.split_once('/').unwrap_or((key.as_str(), ""));
                    vms.shutdown(host, vm).await
                }
            })
            .await;

        let succeeded = report.succeeded();
        let stopped = StoppedGuests {
            vms: pairs
                .into_iter()
                .zip(keys.iter())
                .filter(|(_, k)| succeeded.contains(&k.as_str()))
                .map(|(pair, _)| pair)
                .collect(),
            manual_crs,
        };
        if let Err(e) = report.check(ErrorCode::VmLifecycleFailed) {
            if let Err(restart) = self.start_guests(&stopped).await {
                warn!(error = %restart, "Failed to restart guests after a partial shutdown");
            }
            return Err(e);
        }
        info!(guests = stopped.vms.len(), "Guests stopped");
        Ok(stopped)
    }

    async fn start_guests(&self, stopped: &StoppedGuests) -> Result<()> {
        if stopped.vms.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = stopped
            .vms
            .iter()
            .map(|(h, v)| format!("{}/{}", h, v))
            .collect();
        let report = self
            .runner
            .run("vm_start", &keys, |key| {
                let vms = Arc::clone(&self.deps.vms);
                async move {
                    let (host, vm) = key.split_once('/').unwrap_or((key.as_str(), ""));
                    vms.start(host, vm).await
                }
            })
            .await;
        report.check(ErrorCode::VmLifecycleFailed)
    }

    /// Start the stopped guests, then CRS where it does not start by itself.
    async fn restore_guests(&self, stopped: &StoppedGuests, policy: CheckPolicy) -> Result<()> {
        self.start_guests(stopped).await?;
        self.health.start_crs(&stopped.manual_crs, policy).await
    }

    /// Guests of a hypervisor whose CRS must be started by hand after the
    /// hypervisor reboots.
    async fn manual_crs_guests(&self, req: &PatchRequest, guests: &[String]) -> Vec<String> {
        if !req.target_kind.profile().hosts_vms || !req.operation.mutates_image() {
            return Vec::new();
        }
        self.health.crs_manual_start(guests).await
    }

    // ------------------------------------------------------------------------
    // Retried requests
    // ------------------------------------------------------------------------

    /// Finish what the earlier attempt left behind. An earlier tool run that
    /// turns out to have failed fails this run.
    async fn resume_prior(&mut self, req: &PatchRequest, st: &mut RunState, plan: &ResumePlan) -> Result<()> {
        let kind = req.target_kind;
        for prior in &plan.running {
            let node = prior.node.as_str();
            let total = plan
                .running
                .iter()
                .filter(|r| r.log_dir == prior.log_dir)
                .count();
            match self.await_prior_run(prior, total).await? {
                PriorRun::Failed(exit_code) => {
                    self.mark_failed(st, &[prior.node.clone()], Stage::PatchMgr)
                        .await;
                    let launch_node = prior.launch_node.as_deref().unwrap_or("unknown");
                    return Err(PatchError::new(
                        ErrorCode::RetryExecutionFailed,
                        format!(
                            "Patch tool run resumed for {} on {} exited {}",
                            node, launch_node, exit_code
                        ),
                    )
                    .with_suggestion(format!(
                        "Inspect {} on {} before retrying",
                        prior.log_dir.as_deref().unwrap_or("the tool logs"),
                        launch_node
                    ))
                    .into());
                }
                PriorRun::Finished => {
                    let nodes = [prior.node.clone()];
                    self.verify_versions(req, st, &nodes).await?;
                    st.ledger()?
                        .set(node, Stage::PatchMgr, PatchStatus::Completed)
                        .await?;
                    let guests = self.guests(kind, node).await?;
                    self.post_patch(req, st, node, &guests, &PdbSnapshot::new())
                        .await?;
                    self.summary.resumed.push(prior.node.clone());
                    st.nodes_done += 1;
                }
            }
        }
        for node in &plan.post_only {
            let guests = self.guests(kind, node).await?;
            self.post_patch(req, st, node, &guests, &PdbSnapshot::new())
                .await?;
            self.summary.resumed.push(node.clone());
            st.nodes_done += 1;
        }
        Ok(())
    }

    /// Wait on, or read the result of, the tool invocation the ledger says
    /// was running for `prior.node`.
    async fn await_prior_run(&self, prior: &ResumeNode, total_nodes: usize) -> Result<PriorRun> {
        let (Some(host), Some(log_dir)) = (&prior.launch_node, &prior.log_dir) else {
            warn!(node = %prior.node, "No log location for the earlier run; treating it as finished");
            return Ok(PriorRun::Finished);
        };

        let console = format!("{}/{}", log_dir, CONSOLE_FILE);
        if self.deps.exec.exists(host, &console).await? {
            info!(node = %prior.node, host = %host, "Resuming earlier patch tool session");
            let mut session = ExternalToolSession::new(Arc::clone(&self.deps.exec), self.timings);
            let report = session.resume(host, log_dir, total_nodes).await?;
            return match report.outcome {
                SessionOutcome::Succeeded => Ok(PriorRun::Finished),
                SessionOutcome::Failed { exit_code } => Ok(PriorRun::Failed(exit_code)),
                SessionOutcome::TimedOut => Err(PatchError::new(
                    ErrorCode::ConsoleReadTimeout,
                    format!("Resumed session on {} did not finish", host),
                )
                .with_suggestion(format!("Check {} on {}", log_dir, host))
                .into()),
            };
        }

        let renamed = renamed_log_dir(log_dir, host);
        let out = self
            .deps
            .exec
            .run(host, &format!("tail -n 200 {}/{} 2>/dev/null", renamed, CONSOLE_FILE))
            .await?;
        match parse_exit_marker(&out.stdout) {
            Some(code) if code != 0 => Ok(PriorRun::Failed(code)),
            _ => Ok(PriorRun::Finished),
        }
    }

    // ------------------------------------------------------------------------
    // Tool-free operations
    // ------------------------------------------------------------------------

    async fn postcheck(&mut self, req: &PatchRequest, nodes: &[String]) -> Result<PatchOutcome> {
        let kind = req.target_kind;
        let policy = CheckPolicy::Enforce;
        let mut heartbeat: Vec<String> = Vec::new();
        let mut crs: Vec<String> = Vec::new();
        for node in nodes {
            let guests = self.guests(kind, node).await?;
            let (h, c) = health_targets(kind, node, &guests);
            heartbeat.extend(h);
            crs.extend(c);
        }
        self.health.heartbeat(&heartbeat, policy).await?;
        if !crs.is_empty() {
            self.health.crs(&crs, policy).await?;
        }

        if let Some(target) = req.target_version.as_deref() {
            for node in nodes {
                let active = self.deps.inspector.active_version(node, kind).await?;
                let at_target = active
                    .as_deref()
                    .and_then(|a| version::compare(a, target))
                    .is_some_and(|o| o.is_eq());
                if !at_target {
                    return Err(PatchError::new(
                        ErrorCode::PostchecksFailed,
                        format!(
                            "{} reports {}, expected {}",
                            node,
                            active.as_deref().unwrap_or("unknown"),
                            target
                        ),
                    )
                    .with_suggestion(format!("Patch {} to {} and rerun the postcheck", node, target))
                    .into());
                }
            }
        }

        self.enter(Phase::Aggregate);
        info!(nodes = nodes.len(), "Postcheck passed");
        Ok(PatchOutcome::Success)
    }

    async fn oneoff(&mut self, req: &PatchRequest, nodes: &[String]) -> Result<PatchOutcome> {
        let v2 = req.operation == Operation::OneoffV2;
        let report = self
            .runner
            .run(&req.operation.to_string(), nodes, |node| {
                let plugins = Arc::clone(&self.deps.plugins);
                async move { plugins.oneoff(&node, v2).await }
            })
            .await;
        report.check(ErrorCode::PatchOperationFailed)?;
        self.enter(Phase::Aggregate);
        self.summary.patched = nodes.to_vec();
        Ok(PatchOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn prior_doc() -> LedgerDocument {
        let mut doc = LedgerDocument::new(
            TargetKind::Dom0,
            &names(&["a", "b", "c", "d"]),
            &names(&["c"]),
        )
        .with_operation(Operation::Patch);
        for stage in [Stage::PrePatch, Stage::PatchMgr, Stage::PostPatch] {
            doc.set_stage("a", stage, PatchStatus::Running).unwrap();
            doc.set_stage("a", stage, PatchStatus::Completed).unwrap();
        }
        doc.set_stage("b", Stage::PrePatch, PatchStatus::Running).unwrap();
        doc.set_stage("b", Stage::PrePatch, PatchStatus::Completed).unwrap();
        doc.set_stage("b", Stage::PatchMgr, PatchStatus::Running).unwrap();
        doc.node_mut("b").unwrap().log_dir = Some("/logs/dom0_patch_b".to_string());

        doc.set_stage("c", Stage::PatchMgr, PatchStatus::Running).unwrap();
        doc.set_stage("c", Stage::PatchMgr, PatchStatus::Completed).unwrap();
        doc.set_stage("c", Stage::PostPatch, PatchStatus::Running).unwrap();
        doc.set_stage("c", Stage::PostPatch, PatchStatus::Failed).unwrap();
        doc
    }

    #[test]
    fn test_resume_plan_classifies_prior_progress() {
        let mut filter = FilterResult {
            to_patch: names(&["a", "b", "d"]),
            discarded: vec![Discarded {
                node: "c".to_string(),
                reason: DiscardReason::AtOrAboveTarget {
                    current: "22.1.0".to_string(),
                },
            }],
        };
        let plan = plan_resume(&prior_doc(), &names(&["a", "b", "c", "d"]), &mut filter);

        assert_eq!(
            plan.running,
            vec![ResumeNode {
                node: "b".to_string(),
                launch_node: Some("c".to_string()),
                log_dir: Some("/logs/dom0_patch_b".to_string()),
            }]
        );
        assert_eq!(plan.post_only, names(&["c"]));
        assert_eq!(filter.to_patch, names(&["d"]));
        assert_eq!(filter.discarded_nodes(), names(&["a"]));
        assert_eq!(filter.discarded[0].reason, DiscardReason::CompletedEarlier);
    }

    #[test]
    fn test_health_targets_per_kind() {
        let guests = names(&["vm1", "vm2"]);
        let (hb, crs) = health_targets(TargetKind::Dom0, "a", &guests);
        assert_eq!(hb, names(&["a", "vm1", "vm2"]));
        assert_eq!(crs, guests);

        let (hb, crs) = health_targets(TargetKind::DomU, "vm1", &[]);
        assert_eq!(hb, crs);

        let (hb, crs) = health_targets(TargetKind::Cell, "cel1", &[]);
        assert_eq!(hb, names(&["cel1"]));
        assert!(crs.is_empty());
        assert!(pdb_hosts(TargetKind::Cell, "cel1", &[]).is_empty());
        assert_eq!(pdb_hosts(TargetKind::Dom0, "a", &guests), guests);
    }

    #[test]
    fn test_stopped_guests_by_host() {
        let stopped = StoppedGuests {
            vms: vec![
                ("a".to_string(), "vm1".to_string()),
                ("b".to_string(), "vm2".to_string()),
                ("a".to_string(), "vm3".to_string()),
            ],
            manual_crs: Vec::new(),
        };
        assert_eq!(stopped.on("a"), names(&["vm1", "vm3"]));
        assert!(stopped.on("z").is_empty());
    }
}
