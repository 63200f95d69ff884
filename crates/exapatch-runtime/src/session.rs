use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Result, bail};
use exapatch_core::config::PatchConfig;
use exapatch_core::error::{ErrorCode, PatchError, patch_error};
use exapatch_core::target::{Operation, TargetKind, short_name};
use exapatch_core::time::utc_now;
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::executor::RemoteExecutor;
use crate::staging::LaunchNodeState;

/// Console log written by the patch tool inside its log directory.
pub const CONSOLE_FILE: &str = "PatchmgrConsole.out";
/// Exit 0 when a patch tool process is alive on the host.
pub const SESSION_PROBE_CMD: &str = "ps -ef | egrep -i 'patchmgr -' | egrep -vi 'grep|tail'";

const CONSOLE_TAIL_LINES: usize = 50;
const HARVEST_TAIL_LINES: usize = 200;

static EXIT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Exit status:\s*(-?\d+)").expect("exit marker regex"));
static PROGRESS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)working|success|info").expect("progress regex"));

/// Log directory for one invocation, before the completion rename.
pub fn log_dir_for(log_root: &str, kind: TargetKind, operation: Operation, first_node: &str) -> String {
    format!("{}/{}_{}_{}", log_root, kind, operation, short_name(first_node))
}

/// Log directory after the completion rename on `launch_node`.
pub fn renamed_log_dir(log_dir: &str, launch_node: &str) -> String {
    format!("{}_{}", log_dir, short_name(launch_node))
}

/// Exit code carried by the last marker line in `console`.
pub fn parse_exit_marker(console: &str) -> Option<i32> {
    EXIT_MARKER
        .captures_iter(console)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Console lines worth surfacing to the operator that come after `seen`,
/// the last line already reported. All matches when `seen` is not in the tail.
fn progress_lines<'a>(console: &'a str, seen: Option<&str>) -> Vec<&'a str> {
    let lines: Vec<&str> = console
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && PROGRESS_LINE.is_match(l))
        .collect();
    let start = seen
        .and_then(|s| lines.iter().rposition(|l| *l == s))
        .map_or(0, |i| i + 1);
    lines[start..].to_vec()
}

/// States of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    SessionCheck,
    AlreadyRunning { host: String },
    Launch,
    Polling { host: String },
    Succeeded,
    Failed { exit_code: i32 },
    TimedOut,
}

/// Terminal result of a session.
///
/// `TimedOut` means the result is unknown; `Failed` means the tool reported
/// a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Succeeded,
    Failed { exit_code: i32 },
    TimedOut,
}

/// Polling cadence and limits.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub notification_interval: Duration,
    pub completion_checks: u32,
    pub completion_wait: Duration,
}

impl SessionTimings {
    pub fn from_config(config: &PatchConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.session.poll_interval_secs),
            timeout: Duration::from_secs(config.session.timeout_secs),
            notification_interval: Duration::from_secs(config.session.notification_interval_secs),
            completion_checks: config.session.completion_checks,
            completion_wait: Duration::from_secs(config.session.completion_wait_secs),
        }
    }
}

/// What to ask the tool to do.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub kind: TargetKind,
    pub operation: Operation,
    pub nodes: Vec<String>,
    pub target_version: Option<String>,
    pub exasplice: bool,
    /// Let the tool sequence the nodes itself.
    pub tool_rolling: bool,
    pub backup: bool,
    /// Retried request: an already-running session is adopted, not rejected.
    pub retried: bool,
}

/// A launched command line and where it writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub command: String,
    pub launch_node: String,
    pub node_list_file: String,
    pub log_dir: String,
    pub started_at: String,
    pub timeout: Duration,
}

/// Notification-derived node progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressCount {
    pub finished: usize,
    pub total: usize,
}

impl std::fmt::Display for ProgressCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}]", self.finished, self.total)
    }
}

/// Everything learned from one session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub launch_node: String,
    pub log_dir: String,
    /// Set when the log directory was renamed after completion.
    pub final_log_dir: Option<String>,
    /// `None` when an existing session was adopted.
    pub invocation: Option<ToolInvocation>,
    pub history: Vec<SessionState>,
    pub console_tail: String,
    pub diag_bundle: Option<String>,
    pub progress: Option<ProgressCount>,
}

impl SessionReport {
    pub fn launched(&self) -> bool {
        self.invocation.is_some()
    }
}

type ProgressHook = Box<dyn Fn(&str, ProgressCount) + Send + Sync>;

/// Build the detached patch tool command line.
pub fn build_command(
    launch: &LaunchNodeState,
    req: &ToolRequest,
    node_list_file: &str,
    log_dir: &str,
) -> Result<String> {
    let Some(action) = req.operation.tool_action() else {
        bail!("{} does not invoke the patch tool", req.operation);
    };
    let binary = launch
        .tool_path
        .rsplit('/')
        .next()
        .unwrap_or("patchmgr");

    let mut args = vec![
        format!("./{}", binary),
        req.kind.profile().tool_flag.to_string(),
        node_list_file.to_string(),
        action.to_string(),
    ];

    if matches!(req.operation, Operation::Patch | Operation::Precheck) {
        let Some(version) = req.target_version.as_deref() else {
            bail!("{} requires a target version", req.operation);
        };
        let repo_flag = if req.exasplice {
            "--exasplice_repo"
        } else {
            "--iso_repo"
        };
        args.extend([
            repo_flag.to_string(),
            launch.zip_path.clone(),
            "--target_version".to_string(),
            version.to_string(),
        ]);
    }
    if req.tool_rolling {
        args.push("--rolling".to_string());
    }
    if req.operation == Operation::Patch && !req.backup {
        args.push("--nobackup".to_string());
    }
    args.extend(["--log_dir".to_string(), log_dir.to_string()]);

    Ok(format!(
        "cd {}; nohup {} </dev/null >/dev/null 2>&1 &",
        launch.tool_dir,
        args.join(" ")
    ))
}

/// One invocation of the external patch tool, driven to a terminal state.
pub struct ExternalToolSession {
    exec: Arc<dyn RemoteExecutor>,
    timings: SessionTimings,
    state: SessionState,
    history: Vec<SessionState>,
    last_line: Option<String>,
    progress: Option<ProgressCount>,
    progress_hook: Option<ProgressHook>,
}

impl ExternalToolSession {
    pub fn new(exec: Arc<dyn RemoteExecutor>, timings: SessionTimings) -> Self {
        Self {
            exec,
            timings,
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
            last_line: None,
            progress: None,
            progress_hook: None,
        }
    }

    /// Called with the launch node and each notification progress update.
    pub fn with_progress_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, ProgressCount) + Send + Sync + 'static,
    {
        self.progress_hook = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "Session transition");
        self.state = next.clone();
        self.history.push(next);
    }

    /// Host among `hosts` running a patch tool process, if any.
    pub async fn probe(&self, hosts: &[String]) -> Result<Option<String>> {
        for host in hosts {
            match self.exec.run(host, SESSION_PROBE_CMD).await {
                Ok(out) if out.success() => return Ok(Some(host.clone())),
                Ok(_) => {}
                Err(e) => warn!(host = %host, error = %e, "Session probe failed"),
            }
        }
        Ok(None)
    }

    /// Run the full state machine: check for a live session, launch or adopt,
    /// poll to a terminal state, then harvest and rename.
    #[instrument(skip_all, fields(launch_node = %launch.host, kind = %req.kind, operation = %req.operation))]
    pub async fn execute(
        &mut self,
        launch: &LaunchNodeState,
        req: &ToolRequest,
        probe_hosts: &[String],
    ) -> Result<SessionReport> {
        let Some(first) = req.nodes.iter().min() else {
            bail!("Tool invocation needs at least one node");
        };
        let log_dir = log_dir_for(&launch.log_root, req.kind, req.operation, first);

        self.transition(SessionState::SessionCheck);
        let mut hosts: Vec<String> = probe_hosts.to_vec();
        if !hosts.contains(&launch.host) {
            hosts.insert(0, launch.host.clone());
        }

        let (host, invocation) = match self.probe(&hosts).await? {
            Some(running) if !req.retried => {
                return Err(PatchError::new(
                    ErrorCode::SessionAlreadyActive,
                    format!("A patch tool session is already running on {}", running),
                )
                .with_suggestion(format!(
                    "Wait for the session on {} to finish or stop it before retrying",
                    running
                ))
                .into());
            }
            Some(running) => {
                info!(host = %running, "Adopting running patch tool session");
                self.transition(SessionState::AlreadyRunning {
                    host: running.clone(),
                });
                (running, None)
            }
            None => {
                self.transition(SessionState::Launch);
                let invocation = self.launch(launch, req, &log_dir).await?;
                (launch.host.clone(), Some(invocation))
            }
        };

        let mut report = self.poll_to_end(&host, &log_dir, req.nodes.len()).await?;
        report.invocation = invocation;
        Ok(report)
    }

    /// Adopt a session already known to be running on `host` and poll it.
    pub async fn resume(&mut self, host: &str, log_dir: &str, total_nodes: usize) -> Result<SessionReport> {
        self.transition(SessionState::AlreadyRunning {
            host: host.to_string(),
        });
        self.poll_to_end(host, log_dir, total_nodes).await
    }

    async fn launch(
        &mut self,
        launch: &LaunchNodeState,
        req: &ToolRequest,
        log_dir: &str,
    ) -> Result<ToolInvocation> {
        let host = launch.host.as_str();
        let node_list_file = format!("{}_nodes.lst", log_dir);

        // Stale markers from an earlier run must not satisfy this one.
        self.exec
            .run(
                host,
                &format!("rm -rf {} {}", log_dir, renamed_log_dir(log_dir, host)),
            )
            .await?;
        self.exec
            .run(host, &format!("mkdir -p {}", log_dir))
            .await?;

        let mut nodes = req.nodes.clone();
        nodes.sort();
        let write = self
            .exec
            .run(
                host,
                &format!("printf '%s\\n' {} > {}", nodes.join(" "), node_list_file),
            )
            .await?;
        if !write.success() {
            return Err(patch_error(
                ErrorCode::ToolCommandFailed,
                format!("Failed to write node list {} on {}", node_list_file, host),
            ));
        }

        let command = build_command(launch, req, &node_list_file, log_dir)?;
        info!(host, command = %command, "Launching patch tool");
        let out = self.exec.run(host, &command).await?;
        if !out.success() {
            return Err(PatchError::new(
                ErrorCode::ToolCommandFailed,
                format!(
                    "Patch tool launch on {} failed (exit {}): {}",
                    host,
                    out.exit_code,
                    out.stderr.trim()
                ),
            )
            .with_suggestion(format!("Run the command manually on {} to see the error", host))
            .into());
        }

        Ok(ToolInvocation {
            command,
            launch_node: host.to_string(),
            node_list_file,
            log_dir: log_dir.to_string(),
            started_at: utc_now(),
            timeout: self.timings.timeout,
        })
    }

    async fn poll_to_end(&mut self, host: &str, log_dir: &str, total_nodes: usize) -> Result<SessionReport> {
        self.transition(SessionState::Polling {
            host: host.to_string(),
        });
        let outcome = self.poll(host, log_dir, total_nodes).await;

        match outcome {
            SessionOutcome::Succeeded => self.transition(SessionState::Succeeded),
            SessionOutcome::Failed { exit_code } => {
                self.transition(SessionState::Failed { exit_code })
            }
            SessionOutcome::TimedOut => self.transition(SessionState::TimedOut),
        }

        if outcome != SessionOutcome::TimedOut {
            self.wait_for_exit(host).await;
        }

        let console_tail = self
            .exec
            .run(
                host,
                &format!("tail -n {} {}/{} 2>/dev/null", HARVEST_TAIL_LINES, log_dir, CONSOLE_FILE),
            )
            .await
            .map(|o| o.stdout)
            .unwrap_or_default();

        let diag_bundle = if outcome == SessionOutcome::Succeeded {
            None
        } else {
            self.collect_diagnostics(host, log_dir).await
        };

        // A timed-out session keeps its directory so a retry polls the same place.
        let final_log_dir = if outcome == SessionOutcome::TimedOut {
            None
        } else {
            self.rename_log_dir(host, log_dir).await
        };

        info!(host, ?outcome, log_dir, "Patch tool session finished");
        Ok(SessionReport {
            outcome,
            launch_node: host.to_string(),
            log_dir: log_dir.to_string(),
            final_log_dir,
            invocation: None,
            history: self.history.clone(),
            console_tail,
            diag_bundle,
            progress: self.progress,
        })
    }

    async fn poll(&mut self, host: &str, log_dir: &str, total_nodes: usize) -> SessionOutcome {
        let console = format!("{}/{}", log_dir, CONSOLE_FILE);
        let started = Instant::now();
        let mut last_notification = Instant::now();

        loop {
            tokio::time::sleep(self.timings.poll_interval).await;

            match self
                .exec
                .run(host, &format!("tail -n {} {} 2>/dev/null", CONSOLE_TAIL_LINES, console))
                .await
            {
                Ok(out) if out.success() => {
                    let fresh = progress_lines(&out.stdout, self.last_line.as_deref());
                    for line in &fresh {
                        info!(launch_node = host, log_dir, "{}", line);
                    }
                    if let Some(line) = fresh.last() {
                        self.last_line = Some(line.to_string());
                    }
                    if let Some(code) = parse_exit_marker(&out.stdout) {
                        return if code == 0 {
                            SessionOutcome::Succeeded
                        } else {
                            SessionOutcome::Failed { exit_code: code }
                        };
                    }
                }
                Ok(_) => debug!(host, console = %console, "Console log not readable yet"),
                Err(e) => warn!(host, error = %e, "Console read failed"),
            }

            if last_notification.elapsed() >= self.timings.notification_interval {
                last_notification = Instant::now();
                self.update_progress(host, log_dir, total_nodes).await;
            }

            if started.elapsed() >= self.timings.timeout {
                warn!(
                    host,
                    timeout_secs = self.timings.timeout.as_secs(),
                    "No exit marker before timeout"
                );
                return SessionOutcome::TimedOut;
            }
        }
    }

    async fn update_progress(&mut self, host: &str, log_dir: &str, total: usize) {
        let cmd = format!(
            "grep -il 'succeeded' {}/notifications/notification_patchmgr* 2>/dev/null | wc -l",
            log_dir
        );
        let finished = match self.exec.run(host, &cmd).await {
            Ok(out) => out.stdout.trim().parse::<usize>().unwrap_or(0),
            Err(e) => {
                debug!(host, error = %e, "Notification read failed");
                return;
            }
        };
        let count = ProgressCount {
            finished: finished.min(total),
            total,
        };
        if self.progress != Some(count) {
            info!(launch_node = host, progress = %count, "Patch progress");
            self.progress = Some(count);
            if let Some(hook) = &self.progress_hook {
                hook(host, count);
            }
        }
    }

    async fn wait_for_exit(&self, host: &str) {
        for _ in 0..self.timings.completion_checks {
            match self.exec.run(host, SESSION_PROBE_CMD).await {
                Ok(out) if !out.success() => return,
                Ok(_) => {}
                Err(e) => {
                    warn!(host, error = %e, "Session exit check failed");
                    return;
                }
            }
            tokio::time::sleep(self.timings.completion_wait).await;
        }
        warn!(host, "Patch tool process still present after exit marker");
    }

    async fn collect_diagnostics(&self, host: &str, log_dir: &str) -> Option<String> {
        let bundle = format!("{}_diag.tar.gz", log_dir);
        match self
            .exec
            .run(host, &format!("tar -czf {} -C {} .", bundle, log_dir))
            .await
        {
            Ok(out) if out.success() => Some(bundle),
            Ok(out) => {
                warn!(host, exit_code = out.exit_code, "Diagnostic bundle failed");
                None
            }
            Err(e) => {
                warn!(host, error = %e, "Diagnostic bundle failed");
                None
            }
        }
    }

    async fn rename_log_dir(&self, host: &str, log_dir: &str) -> Option<String> {
        let renamed = renamed_log_dir(log_dir, host);
        if let Err(e) = self.exec.run(host, &format!("rm -rf {}", renamed)).await {
            warn!(host, error = %e, "Failed to clear previous log dir");
        }
        match self
            .exec
            .run(host, &format!("mv -f {} {}", log_dir, renamed))
            .await
        {
            Ok(out) if out.success() => Some(renamed),
            Ok(out) => {
                warn!(host, exit_code = out.exit_code, log_dir, "Log dir rename failed");
                None
            }
            Err(e) => {
                warn!(host, error = %e, log_dir, "Log dir rename failed");
                None
            }
        }
    }
}
