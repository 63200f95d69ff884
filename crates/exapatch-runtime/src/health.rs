//! Cluster health validation: heartbeat, CRS membership and restart, PDB
//! degradation, stale mounts and free space. Every check fans out over
//! [`ParallelTaskRunner`] and is gated by a [`CheckPolicy`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use exapatch_core::config::PatchConfig;
use exapatch_core::error::{ErrorCode, PatchError, patch_error};
use exapatch_core::target::Operation;
use tracing::{info, instrument, warn};

use crate::executor::RemoteExecutor;
use crate::parallel::{ParallelSettings, ParallelTaskRunner, RunReport};

const HEARTBEAT_CMD: &str = "uptime";
const GRID_HOME: &str = "grid=$(grep -iE 'grid|asm' /etc/oratab 2>/dev/null | grep -v '^#' | cut -d: -f2 | head -1)";
/// `crsctl config crs` when High Availability Services autostart is off.
const CRS_AUTOSTART_DISABLED: &str = "CRS-4621";
/// `crsctl start crs` when the stack is already up.
const CRS_ALREADY_ACTIVE: &str = "CRS-4640";
const STALE_MOUNT_CMD: &str = "for m in $(awk '$3 ~ /^nfs/ {print $2}' /proc/mounts); do timeout 10 stat -t \"$m\" >/dev/null 2>&1 || echo \"$m\"; done";

/// PDB open mode as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    Read,
    Mount,
    Migrate,
    Other(String),
}

impl std::str::FromStr for OpenMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().replace(' ', "_").as_str() {
            "READ_WRITE" => Self::ReadWrite,
            "READ" | "READ_ONLY" => Self::Read,
            "MOUNT" | "MOUNTED" => Self::Mount,
            "MIGRATE" => Self::Migrate,
            other => Self::Other(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdbState {
    pub cdb: String,
    pub pdb: String,
    pub open_mode: OpenMode,
    pub restricted: bool,
}

impl PdbState {
    /// Parse one `cdb pdb open_mode restricted` line.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let cdb = parts.next()?.to_string();
        let pdb = parts.next()?.to_string();
        let open_mode = parts.next()?.parse().ok()?;
        let restricted = matches!(
            parts.next()?.to_ascii_lowercase().as_str(),
            "yes" | "true"
        );
        Some(Self {
            cdb,
            pdb,
            open_mode,
            restricted,
        })
    }
}

/// Whether moving from `pre` to `post` degraded the PDB.
///
/// READ_WRITE and READ may move between each other but must keep their
/// restricted flag. MOUNT and MIGRATE must stay where they were.
pub fn is_degraded(pre: &PdbState, post: &PdbState) -> bool {
    use OpenMode::*;
    match (&pre.open_mode, &post.open_mode) {
        (ReadWrite, ReadWrite) | (Read, Read) | (Read, ReadWrite) => {
            pre.restricted != post.restricted
        }
        (Mount, Mount) | (Migrate, Migrate) => false,
        (Other(a), Other(b)) => a != b,
        _ => true,
    }
}

/// PDB states per host, captured before a node is touched.
pub type PdbSnapshot = BTreeMap<String, Vec<PdbState>>;

/// Degraded PDBs between two captures of one host.
pub fn degraded_pdbs(before: &[PdbState], after: &[PdbState]) -> Vec<String> {
    before
        .iter()
        .filter_map(|pre| {
            let post = after
                .iter()
                .find(|p| p.cdb == pre.cdb && p.pdb == pre.pdb);
            match post {
                Some(post) if !is_degraded(pre, post) => None,
                _ => Some(format!("{}/{}", pre.cdb, pre.pdb)),
            }
        })
        .collect()
}

/// Node-level health reads.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn heartbeat(&self, host: &str) -> Result<bool>;
    async fn crs_online(&self, host: &str) -> Result<bool>;
    /// Whether CRS comes up by itself when the host boots.
    async fn crs_autostart(&self, host: &str) -> Result<bool>;
    async fn start_crs(&self, host: &str) -> Result<()>;
    async fn pdb_states(&self, host: &str) -> Result<Vec<PdbState>>;
    /// Mount points that do not answer `stat`.
    async fn stale_mounts(&self, host: &str) -> Result<Vec<String>>;
    async fn free_space_mb(&self, host: &str, path: &str) -> Result<u64>;
}

/// `crsctl <args>` from the grid home; a no-op on hosts without one.
fn crsctl(args: &str) -> String {
    format!("{}; test -z \"$grid\" || $grid/bin/crsctl {}", GRID_HOME, args)
}

/// `HealthProbe` over plain shell commands.
pub struct ShellHealthProbe {
    exec: Arc<dyn RemoteExecutor>,
    pdb_script: String,
}

impl ShellHealthProbe {
    pub fn new(exec: Arc<dyn RemoteExecutor>, plugin_dir: &str) -> Self {
        Self {
            exec,
            pdb_script: format!("{}/pdb_status.sh", plugin_dir.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl HealthProbe for ShellHealthProbe {
    async fn heartbeat(&self, host: &str) -> Result<bool> {
        Ok(self.exec.run(host, HEARTBEAT_CMD).await?.success())
    }

    async fn crs_online(&self, host: &str) -> Result<bool> {
        let cmd = crsctl("check crs | grep -q 'CRS-4537'");
        Ok(self.exec.run(host, &cmd).await?.success())
    }

    async fn crs_autostart(&self, host: &str) -> Result<bool> {
        let out = self.exec.run(host, &crsctl("config crs 2>&1")).await?;
        if out.stdout.contains(CRS_AUTOSTART_DISABLED) {
            return Ok(false);
        }
        if !out.success() {
            bail!("crsctl config crs failed on {} (exit {})", host, out.exit_code);
        }
        Ok(true)
    }

    async fn start_crs(&self, host: &str) -> Result<()> {
        let out = self.exec.run(host, &crsctl("start crs 2>&1")).await?;
        if out.success() || out.stdout.contains(CRS_ALREADY_ACTIVE) {
            return Ok(());
        }
        Err(patch_error(
            ErrorCode::CrsServicesDown,
            format!(
                "crsctl start crs failed on {} (exit {}): {}",
                host,
                out.exit_code,
                out.stdout.trim()
            ),
        ))
    }

    async fn pdb_states(&self, host: &str) -> Result<Vec<PdbState>> {
        // Hosts without the query script have no databases to check.
        let cmd = format!(
            "test -x {0} && {0} || true",
            self.pdb_script
        );
        let out = self.exec.run(host, &cmd).await?;
        if !out.success() {
            bail!("PDB status query failed on {} (exit {})", host, out.exit_code);
        }
        Ok(out.stdout.lines().filter_map(PdbState::parse_line).collect())
    }

    async fn stale_mounts(&self, host: &str) -> Result<Vec<String>> {
        let out = self.exec.run(host, STALE_MOUNT_CMD).await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn free_space_mb(&self, host: &str, path: &str) -> Result<u64> {
        let out = self
            .exec
            .run(
                host,
                &format!("df -mP {} | tail -n1 | awk '{{print $(NF-2)}}'", path),
            )
            .await?;
        let value = out.stdout.trim();
        value
            .parse()
            .map_err(|_| anyhow::anyhow!("Unparsable free space '{}' on {}", value, host))
    }
}

/// Whether a failed check blocks the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPolicy {
    /// Log and continue.
    Warn,
    /// Fail the step.
    Enforce,
}

impl CheckPolicy {
    /// Prechecks only warn; anything that changes a node enforces.
    pub fn for_operation(operation: Operation) -> Self {
        match operation {
            Operation::Precheck => Self::Warn,
            _ => Self::Enforce,
        }
    }
}

/// Apply `policy` to a finished run. A killed run always fails.
fn gate(report: &RunReport, code: ErrorCode, policy: CheckPolicy) -> Result<()> {
    if report.killed {
        return report.check(code);
    }
    match report.check(code) {
        Ok(()) => Ok(()),
        Err(e) if policy == CheckPolicy::Warn => {
            warn!(check = %report.label, error = %e, "Health check failed; continuing");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub struct HealthValidationSuite {
    probe: Arc<dyn HealthProbe>,
    runner: ParallelTaskRunner,
    crs_runner: ParallelTaskRunner,
}

impl HealthValidationSuite {
    pub fn new(probe: Arc<dyn HealthProbe>, settings: ParallelSettings, crs_join_deadline: Duration) -> Self {
        Self {
            probe,
            runner: ParallelTaskRunner::new(settings),
            crs_runner: ParallelTaskRunner::new(
                ParallelSettings {
                    task_timeout: crs_join_deadline,
                    ..settings
                }
                .with_join_deadline(crs_join_deadline),
            ),
        }
    }

    pub fn from_config(probe: Arc<dyn HealthProbe>, config: &PatchConfig) -> Self {
        Self::new(
            probe,
            ParallelSettings::from_config(config),
            Duration::from_secs(config.parallel.crs_join_deadline_secs),
        )
    }

    #[instrument(skip_all, fields(hosts = hosts.len()))]
    pub async fn heartbeat(&self, hosts: &[String], policy: CheckPolicy) -> Result<RunReport> {
        let report = self
            .runner
            .run("heartbeat", hosts, |host| {
                let probe = Arc::clone(&self.probe);
                async move {
                    if probe.heartbeat(&host).await? {
                        Ok(())
                    } else {
                        Err(patch_error(
                            ErrorCode::HeartbeatFailure,
                            format!("{} is not responding", host),
                        ))
                    }
                }
            })
            .await;
        gate(&report, ErrorCode::HeartbeatFailure, policy)?;
        Ok(report)
    }

    #[instrument(skip_all, fields(hosts = hosts.len()))]
    pub async fn crs(&self, hosts: &[String], policy: CheckPolicy) -> Result<RunReport> {
        let report = self
            .crs_runner
            .run("crs", hosts, |host| {
                let probe = Arc::clone(&self.probe);
                async move {
                    if probe.crs_online(&host).await? {
                        Ok(())
                    } else {
                        Err(patch_error(
                            ErrorCode::CrsServicesDown,
                            format!("Cluster Ready Services are not online on {}", host),
                        ))
                    }
                }
            })
            .await;
        gate(&report, ErrorCode::CrsServicesDown, policy)?;
        Ok(report)
    }

    /// Hosts among `hosts` with CRS autostart disabled. Read while the hosts
    /// are still up; a host whose setting cannot be read is left out.
    #[instrument(skip_all, fields(hosts = hosts.len()))]
    pub async fn crs_manual_start(&self, hosts: &[String]) -> Vec<String> {
        if hosts.is_empty() {
            return Vec::new();
        }
        let manual: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let report = self
            .runner
            .run("crs_autostart", hosts, |host| {
                let probe = Arc::clone(&self.probe);
                let manual = Arc::clone(&manual);
                async move {
                    if !probe.crs_autostart(&host).await? {
                        manual
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(host);
                    }
                    Ok(())
                }
            })
            .await;
        if let Err(e) = report.check(ErrorCode::CrsServicesDown) {
            warn!(error = %e, "CRS autostart setting unreadable on some hosts");
        }
        let mut manual = manual
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        manual.sort_by_key(|h| hosts.iter().position(|x| x == h));
        if !manual.is_empty() {
            info!(hosts = ?manual, "CRS autostart disabled");
        }
        manual
    }

    /// Start CRS on `hosts` after they were restarted.
    #[instrument(skip_all, fields(hosts = hosts.len()))]
    pub async fn start_crs(&self, hosts: &[String], policy: CheckPolicy) -> Result<()> {
        if hosts.is_empty() {
            return Ok(());
        }
        let report = self
            .crs_runner
            .run("crs_start", hosts, |host| {
                let probe = Arc::clone(&self.probe);
                async move { probe.start_crs(&host).await }
            })
            .await;
        gate(&report, ErrorCode::CrsServicesDown, policy)
    }

    /// Heartbeat then CRS on the given hosts.
    pub async fn post_patch(&self, hosts: &[String], policy: CheckPolicy) -> Result<()> {
        if hosts.is_empty() {
            return Ok(());
        }
        self.heartbeat(hosts, policy).await?;
        self.crs(hosts, policy).await?;
        info!(hosts = hosts.len(), "Post-patch health validated");
        Ok(())
    }

    /// Capture PDB states on every host for a later degradation check.
    #[instrument(skip_all, fields(hosts = hosts.len()))]
    pub async fn capture_pdbs(&self, hosts: &[String], policy: CheckPolicy) -> Result<PdbSnapshot> {
        let snapshot: Arc<Mutex<PdbSnapshot>> = Arc::new(Mutex::new(BTreeMap::new()));
        let report = self
            .runner
            .run("pdb_capture", hosts, |host| {
                let probe = Arc::clone(&self.probe);
                let snapshot = Arc::clone(&snapshot);
                async move {
                    let states = probe.pdb_states(&host).await?;
                    snapshot
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(host, states);
                    Ok(())
                }
            })
            .await;
        gate(&report, ErrorCode::PdbDegraded, policy)?;
        let captured = snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(captured)
    }

    /// Compare current PDB states against `before`.
    #[instrument(skip_all, fields(hosts = before.len()))]
    pub async fn pdb_degradation(&self, before: &PdbSnapshot, policy: CheckPolicy) -> Result<()> {
        let hosts: Vec<String> = before
            .iter()
            .filter(|(_, states)| !states.is_empty())
            .map(|(host, _)| host.clone())
            .collect();
        if hosts.is_empty() {
            return Ok(());
        }
        let before = Arc::new(before.clone());
        let report = self
            .runner
            .run("pdb_degradation", &hosts, |host| {
                let probe = Arc::clone(&self.probe);
                let before = Arc::clone(&before);
                async move {
                    let after = probe.pdb_states(&host).await?;
                    let prior = before.get(&host).map(Vec::as_slice).unwrap_or_default();
                    let degraded = degraded_pdbs(prior, &after);
                    if degraded.is_empty() {
                        Ok(())
                    } else {
                        Err(PatchError::new(
                            ErrorCode::PdbDegraded,
                            format!("Degraded PDBs on {}: {}", host, degraded.join(", ")),
                        )
                        .with_suggestion(format!(
                            "Reopen the listed PDBs on {} in their pre-patch mode",
                            host
                        ))
                        .into())
                    }
                }
            })
            .await;
        gate(&report, ErrorCode::PdbDegraded, policy)
    }

    #[instrument(skip_all, fields(hosts = hosts.len()))]
    pub async fn stale_mounts(&self, hosts: &[String], policy: CheckPolicy) -> Result<()> {
        let report = self
            .runner
            .run("stale_mounts", hosts, |host| {
                let probe = Arc::clone(&self.probe);
                async move {
                    let stale = probe.stale_mounts(&host).await?;
                    if stale.is_empty() {
                        Ok(())
                    } else {
                        Err(PatchError::new(
                            ErrorCode::StaleMountDetected,
                            format!("Stale mounts on {}: {}", host, stale.join(", ")),
                        )
                        .with_suggestion(format!("Unmount or repair {} on {}", stale.join(", "), host))
                        .into())
                    }
                }
            })
            .await;
        gate(&report, ErrorCode::StaleMountDetected, policy)
    }

    #[instrument(skip_all, fields(hosts = hosts.len(), path, min_mb))]
    pub async fn free_space(&self, hosts: &[String], path: &str, min_mb: u64, policy: CheckPolicy) -> Result<()> {
        let path = path.to_string();
        let report = self
            .runner
            .run("free_space", hosts, |host| {
                let probe = Arc::clone(&self.probe);
                let path = path.clone();
                async move {
                    let free = probe.free_space_mb(&host, &path).await?;
                    if free >= min_mb {
                        Ok(())
                    } else {
                        Err(patch_error(
                            ErrorCode::InsufficientSpace,
                            format!(
                                "{} has {} MB free under {}, needs {} MB",
                                host, free, path, min_mb
                            ),
                        ))
                    }
                }
            })
            .await;
        gate(&report, ErrorCode::InsufficientSpace, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::executor_mock::{MockExecutor, MockResponse};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn pdb(mode: OpenMode, restricted: bool) -> PdbState {
        PdbState {
            cdb: "cdb1".to_string(),
            pdb: "pdb1".to_string(),
            open_mode: mode,
            restricted,
        }
    }

    #[derive(Default)]
    struct FakeProbe {
        down: HashSet<String>,
        crs_down: HashSet<String>,
        crs_manual: HashSet<String>,
        started: Mutex<Vec<String>>,
        hang: HashSet<String>,
        stale: HashSet<String>,
        pdbs: Mutex<BTreeMap<String, Vec<PdbState>>>,
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn heartbeat(&self, host: &str) -> Result<bool> {
            if self.hang.contains(host) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(!self.down.contains(host))
        }

        async fn crs_online(&self, host: &str) -> Result<bool> {
            Ok(!self.crs_down.contains(host))
        }

        async fn crs_autostart(&self, host: &str) -> Result<bool> {
            if host == "unreadable" {
                anyhow::bail!("crsctl missing");
            }
            Ok(!self.crs_manual.contains(host))
        }

        async fn start_crs(&self, host: &str) -> Result<()> {
            if self.crs_down.contains(host) {
                anyhow::bail!("CRS-4000: start failed");
            }
            self.started.lock().unwrap().push(host.to_string());
            Ok(())
        }

        async fn pdb_states(&self, host: &str) -> Result<Vec<PdbState>> {
            Ok(self.pdbs.lock().unwrap().get(host).cloned().unwrap_or_default())
        }

        async fn stale_mounts(&self, host: &str) -> Result<Vec<String>> {
            Ok(if self.stale.contains(host) {
                vec!["/nfs/share".to_string()]
            } else {
                vec![]
            })
        }

        async fn free_space_mb(&self, host: &str, _path: &str) -> Result<u64> {
            Ok(if host == "small" { 10 } else { 100_000 })
        }
    }

    fn suite(probe: FakeProbe, join_deadline: Duration) -> HealthValidationSuite {
        let settings = ParallelSettings {
            task_timeout: Duration::from_secs(3600),
            join_deadline,
            max_parallelism: 8,
        };
        HealthValidationSuite::new(Arc::new(probe), settings, join_deadline)
    }

    #[test]
    fn test_degradation_matrix() {
        use OpenMode::*;
        let cases = [
            (pdb(ReadWrite, false), pdb(ReadWrite, false), false),
            (pdb(ReadWrite, false), pdb(ReadWrite, true), true),
            (pdb(ReadWrite, true), pdb(ReadWrite, true), false),
            (pdb(ReadWrite, false), pdb(Read, false), true),
            (pdb(ReadWrite, false), pdb(Mount, false), true),
            (pdb(Read, false), pdb(ReadWrite, false), false),
            (pdb(Read, true), pdb(ReadWrite, false), true),
            (pdb(Read, false), pdb(Mount, false), true),
            (pdb(Mount, true), pdb(Mount, false), false),
            (pdb(Mount, false), pdb(ReadWrite, false), true),
            (pdb(Migrate, false), pdb(Migrate, true), false),
            (pdb(Migrate, false), pdb(Read, false), true),
        ];
        for (pre, post, expected) in cases {
            assert_eq!(is_degraded(&pre, &post), expected, "{:?} -> {:?}", pre, post);
        }
    }

    #[test]
    fn test_parse_pdb_line_and_missing_pdb() {
        let state = PdbState::parse_line("cdb1 pdb1 READ_WRITE NO").unwrap();
        assert_eq!(state, pdb(OpenMode::ReadWrite, false));
        assert!(PdbState::parse_line("garbage").is_none());

        let before = vec![state];
        assert_eq!(degraded_pdbs(&before, &[]), vec!["cdb1/pdb1"]);
    }

    #[tokio::test]
    async fn test_hung_heartbeat_is_killed_even_when_warning() {
        let probe = FakeProbe {
            hang: ["vm3".to_string()].into(),
            ..Default::default()
        };
        let suite = suite(probe, Duration::from_millis(50));
        let err = suite
            .heartbeat(&names(&["vm1", "vm2", "vm3", "vm4", "vm5"]), CheckPolicy::Warn)
            .await
            .unwrap_err();
        let pe = PatchError::from_anyhow(&err);
        assert_eq!(pe.code, ErrorCode::ParallelCheckTimedOut);
        assert!(pe.message.contains("vm3"));
    }

    #[tokio::test]
    async fn test_policy_gates_failures() {
        let probe = FakeProbe {
            down: ["vm2".to_string()].into(),
            ..Default::default()
        };
        let suite = suite(probe, Duration::from_secs(5));
        let hosts = names(&["vm1", "vm2"]);

        let report = suite.heartbeat(&hosts, CheckPolicy::Warn).await.unwrap();
        assert_eq!(report.succeeded(), vec!["vm1"]);

        let err = suite.heartbeat(&hosts, CheckPolicy::Enforce).await.unwrap_err();
        assert_eq!(
            PatchError::from_anyhow(&err).code,
            ErrorCode::HeartbeatFailure
        );
    }

    #[tokio::test]
    async fn test_crs_and_custom_checks() {
        let probe = FakeProbe {
            crs_down: ["vm1".to_string()].into(),
            stale: ["db2".to_string()].into(),
            ..Default::default()
        };
        let suite = suite(probe, Duration::from_secs(5));

        let err = suite
            .post_patch(&names(&["vm1"]), CheckPolicy::Enforce)
            .await
            .unwrap_err();
        assert_eq!(PatchError::from_anyhow(&err).code, ErrorCode::CrsServicesDown);

        let err = suite
            .stale_mounts(&names(&["db1", "db2"]), CheckPolicy::Enforce)
            .await
            .unwrap_err();
        let pe = PatchError::from_anyhow(&err);
        assert_eq!(pe.code, ErrorCode::StaleMountDetected);
        assert!(pe.message.contains("/nfs/share"));

        suite
            .stale_mounts(&names(&["db2"]), CheckPolicy::Warn)
            .await
            .unwrap();

        let err = suite
            .free_space(&names(&["db1", "small"]), "/u01", 1000, CheckPolicy::Enforce)
            .await
            .unwrap_err();
        assert_eq!(
            PatchError::from_anyhow(&err).code,
            ErrorCode::InsufficientSpace
        );
    }

    #[tokio::test]
    async fn test_crs_restart_only_where_autostart_is_off() {
        let fake = Arc::new(FakeProbe {
            crs_manual: ["vm2".to_string(), "vm4".to_string()].into(),
            crs_down: ["vm4".to_string()].into(),
            ..Default::default()
        });
        let settings = ParallelSettings {
            task_timeout: Duration::from_secs(5),
            join_deadline: Duration::from_secs(5),
            max_parallelism: 4,
        };
        let suite = HealthValidationSuite::new(fake.clone(), settings, Duration::from_secs(5));

        let manual = suite
            .crs_manual_start(&names(&["vm1", "vm2", "unreadable", "vm3"]))
            .await;
        assert_eq!(manual, names(&["vm2"]));
        suite.start_crs(&manual, CheckPolicy::Enforce).await.unwrap();
        assert_eq!(*fake.started.lock().unwrap(), names(&["vm2"]));

        let err = suite
            .start_crs(&names(&["vm4"]), CheckPolicy::Enforce)
            .await
            .unwrap_err();
        assert_eq!(PatchError::from_anyhow(&err).code, ErrorCode::CrsServicesDown);
    }

    #[tokio::test]
    async fn test_shell_crs_autostart_and_start() {
        let mock = MockExecutor::new()
            .on("crsctl config crs", |call, _| {
                Some(match call.host.as_str() {
                    "vm1" => MockResponse::ok(
                        "CRS-4622: Oracle High Availability Services autostart is enabled.",
                    ),
                    "vm2" => MockResponse::ok(
                        "CRS-4621: Oracle High Availability Services autostart is disabled.",
                    ),
                    _ => MockResponse::fail(1),
                })
            })
            .on("crsctl start crs", |call, _| {
                Some(match call.host.as_str() {
                    "vm1" => MockResponse {
                        exit_code: 1,
                        stdout: "CRS-4640: Oracle High Availability Services is already active"
                            .to_string(),
                    },
                    "vm2" => MockResponse::empty(),
                    _ => MockResponse::fail(1),
                })
            });
        let shell = ShellHealthProbe::new(Arc::new(mock.clone()), "/opt/exapatch/plugins");

        assert!(shell.crs_autostart("vm1").await.unwrap());
        assert!(!shell.crs_autostart("vm2").await.unwrap());
        assert!(shell.crs_autostart("vm3").await.is_err());

        shell.start_crs("vm1").await.unwrap();
        shell.start_crs("vm2").await.unwrap();
        let err = shell.start_crs("vm3").await.unwrap_err();
        assert_eq!(PatchError::from_anyhow(&err).code, ErrorCode::CrsServicesDown);
        assert!(
            mock.calls()
                .iter()
                .all(|c| !c.cmd.contains("crsctl") || c.cmd.starts_with("grid=$("))
        );
    }

    #[tokio::test]
    async fn test_pdb_capture_then_degradation() {
        let shell = Arc::new(FakeProbe::default());
        shell
            .pdbs
            .lock()
            .unwrap()
            .insert("vm1".to_string(), vec![pdb(OpenMode::ReadWrite, false)]);
        let settings = ParallelSettings {
            task_timeout: Duration::from_secs(5),
            join_deadline: Duration::from_secs(5),
            max_parallelism: 4,
        };
        let suite = HealthValidationSuite::new(shell.clone(), settings, Duration::from_secs(5));
        let hosts = names(&["vm1", "vm2"]);

        let before = suite.capture_pdbs(&hosts, CheckPolicy::Enforce).await.unwrap();
        assert_eq!(before.len(), 2);
        suite.pdb_degradation(&before, CheckPolicy::Enforce).await.unwrap();

        shell
            .pdbs
            .lock()
            .unwrap()
            .insert("vm1".to_string(), vec![pdb(OpenMode::Mount, false)]);
        let err = suite
            .pdb_degradation(&before, CheckPolicy::Enforce)
            .await
            .unwrap_err();
        let pe = PatchError::from_anyhow(&err);
        assert_eq!(pe.code, ErrorCode::PdbDegraded);
        assert!(pe.message.contains("cdb1/pdb1"));
    }

    #[tokio::test]
    async fn test_shell_checks_read_commands() {
        let mock = MockExecutor::new()
            .with_free_space("db1", 4096)
            .on("/proc/mounts", |call, _| {
                Some(MockResponse::ok(if call.host == "db2" { "/mnt/nfs\n" } else { "" }))
            })
            .on("pdb_status.sh", |_, _| {
                Some(MockResponse::ok("cdb1 pdb1 READ_WRITE NO\ncdb1 pdb2 MOUNTED YES\n"))
            })
            .on("crsctl", |call, _| {
                Some(if call.host == "vm2" {
                    MockResponse::fail(1)
                } else {
                    MockResponse::empty()
                })
            });
        let probe = ShellHealthProbe::new(Arc::new(mock), "/opt/exapatch/plugins/");

        assert!(probe.heartbeat("db1").await.unwrap());
        assert!(probe.crs_online("vm1").await.unwrap());
        assert!(!probe.crs_online("vm2").await.unwrap());
        assert!(probe.stale_mounts("db1").await.unwrap().is_empty());
        assert_eq!(probe.stale_mounts("db2").await.unwrap(), vec!["/mnt/nfs"]);
        assert_eq!(probe.free_space_mb("db1", "/u01").await.unwrap(), 4096);

        let states = probe.pdb_states("vm1").await.unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[1].open_mode, OpenMode::Mount);
        assert!(states[1].restricted);
    }
}
