//! In-memory `RemoteExecutor` for tests.
//!
//! Backed by a per-host filesystem simulation that understands the small
//! shell vocabulary the engine emits. Tests layer extra behaviour on top with
//! [`MockExecutor::on`] handlers, which see every command before the
//! filesystem does.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use exapatch_core::error::{ErrorCode, patch_error};
use sha2::{Digest, Sha256};

use crate::executor::{CommandOutput, RemoteExecutor};

/// Free space reported by `df` when a host has no explicit value.
const DEFAULT_FREE_SPACE_MB: u64 = 1_000_000;

/// Mock response for a remote command.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,
}

impl MockResponse {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
        }
    }

    pub fn empty() -> Self {
        Self::ok("")
    }

    pub fn fail(exit_code: i32) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
        }
    }

    fn to_output(&self) -> CommandOutput {
        CommandOutput {
            stdout: self.stdout.clone(),
            stderr: String::new(),
            exit_code: self.exit_code,
        }
    }
}

/// One recorded command (copies are recorded as `copy <local> <remote>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub host: String,
    pub cmd: String,
}

type Handler = Arc<dyn Fn(&MockCall, &MockExecutor) -> Option<MockResponse> + Send + Sync>;

/// Shared reference to the in-memory filesystem, keyed by `host:path`.
pub type SharedFs = Arc<Mutex<HashMap<String, String>>>;

#[derive(Default)]
struct MockState {
    fs: SharedFs,
    handlers: Mutex<Vec<(String, Handler)>>,
    calls: Mutex<Vec<MockCall>>,
    free_space: Mutex<HashMap<String, u64>>,
    sessions: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    zip_tree: Mutex<Vec<String>>,
    corrupt_copies: Mutex<u32>,
}

/// Cloneable handle to the mock; clones share state.
#[derive(Clone, Default)]
pub struct MockExecutor {
    state: Arc<MockState>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(host: &str, path: &str) -> String {
    format!("{}:{}", host, path)
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a file.
    pub fn with_file(self, host: &str, path: &str, content: &str) -> Self {
        self.put_file(host, path, content);
        self
    }

    /// Free space `df` reports for a host.
    pub fn with_free_space(self, host: &str, mb: u64) -> Self {
        lock(&self.state.free_space).insert(host.to_string(), mb);
        self
    }

    /// Relative paths materialized under the target dir by `unzip`.
    pub fn with_zip_contents(self, paths: &[&str]) -> Self {
        *lock(&self.state.zip_tree) = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Corrupt the next `n` copies (any host).
    pub fn with_corrupt_copies(self, n: u32) -> Self {
        *lock(&self.state.corrupt_copies) = n;
        self
    }

    /// Register a handler for commands containing `pattern`. Returning `None`
    /// falls through to later handlers and the filesystem.
    pub fn on<F>(self, pattern: &str, f: F) -> Self
    where
        F: Fn(&MockCall, &MockExecutor) -> Option<MockResponse> + Send + Sync + 'static,
    {
        lock(&self.state.handlers).push((pattern.to_string(), Arc::new(f)));
        self
    }

    /// Make every command to `host` fail with a connection error.
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut set = lock(&self.state.unreachable);
        if unreachable {
            set.insert(host.to_string());
        } else {
            set.remove(host);
        }
    }

    /// Simulate a live patch tool process on `host`.
    pub fn set_session_running(&self, host: &str, running: bool) {
        let mut set = lock(&self.state.sessions);
        if running {
            set.insert(host.to_string());
        } else {
            set.remove(host);
        }
    }

    pub fn session_running(&self, host: &str) -> bool {
        lock(&self.state.sessions).contains(host)
    }

    pub fn fs(&self) -> SharedFs {
        self.state.fs.clone()
    }

    pub fn put_file(&self, host: &str, path: &str, content: &str) {
        lock(&self.state.fs).insert(key(host, path), content.to_string());
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        lock(&self.state.fs).get(&key(host, path)).cloned()
    }

    pub fn has_path(&self, host: &str, path: &str) -> bool {
        let fs = lock(&self.state.fs);
        let exact = key(host, path);
        let prefix = format!("{}/", exact);
        fs.keys().any(|k| *k == exact || k.starts_with(&prefix))
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state.calls).clone()
    }

    /// Number of recorded commands containing `needle`.
    pub fn count_calls(&self, needle: &str) -> usize {
        lock(&self.state.calls)
            .iter()
            .filter(|c| c.cmd.contains(needle))
            .count()
    }

    /// Hosts that received a command containing `needle`, in call order.
    pub fn hosts_for(&self, needle: &str) -> Vec<String> {
        lock(&self.state.calls)
            .iter()
            .filter(|c| c.cmd.contains(needle))
            .map(|c| c.host.clone())
            .collect()
    }

    fn record(&self, host: &str, cmd: &str) -> MockCall {
        let call = MockCall {
            host: host.to_string(),
            cmd: cmd.to_string(),
        };
        lock(&self.state.calls).push(call.clone());
        call
    }

    fn check_reachable(&self, host: &str) -> Result<()> {
        if lock(&self.state.unreachable).contains(host) {
            return Err(patch_error(
                ErrorCode::ConnectFailed,
                format!("Unable to connect to {}", host),
            ));
        }
        Ok(())
    }

    fn dispatch(&self, call: &MockCall) -> MockResponse {
        let handlers: Vec<(String, Handler)> = lock(&self.state.handlers).clone();
        for (pattern, handler) in handlers {
            if call.cmd.contains(&pattern)
                && let Some(resp) = handler(call, self)
            {
                return resp;
            }
        }
        self.fs_handler(&call.host, &call.cmd)
    }

    /// Handle a command against the in-memory filesystem.
    fn fs_handler(&self, host: &str, cmd: &str) -> MockResponse {
        let s = cmd.trim();

        // ── cat > path << 'EXAEOF'\ncontent\nEXAEOF ─────────────────────
        if s.contains("cat > ") && s.contains("<< 'EXAEOF'\n") {
            if let Some(path) = token_after(s, "cat > ")
                && let Some(start) = s.find("'EXAEOF'\n")
            {
                let body = &s[start + 9..];
                let content = body.rfind("\nEXAEOF").map(|end| &body[..end]).unwrap_or("");
                self.put_file(host, path, content);
            }
            return MockResponse::empty();
        }

        // ── session probe ───────────────────────────────────────────────
        if s.starts_with("ps -ef") {
            return if self.session_running(host) {
                MockResponse::ok("root 4242 1 0 00:00 ? 00:00:01 ./patchmgr --dbnodes")
            } else {
                MockResponse::fail(1)
            };
        }

        // ── sha256sum path | awk ────────────────────────────────────────
        if let Some(path) = token_after(s, "sha256sum ") {
            return match self.file(host, path) {
                Some(content) => MockResponse::ok(&sha256_hex(content.as_bytes())),
                None => MockResponse::empty(),
            };
        }

        // ── df -mP path | tail -n1 | awk ────────────────────────────────
        if s.starts_with("df -mP ") {
            let mb = lock(&self.state.free_space)
                .get(host)
                .copied()
                .unwrap_or(DEFAULT_FREE_SPACE_MB);
            return MockResponse::ok(&mb.to_string());
        }

        // ── printf '%s\n' a b > file ────────────────────────────────────
        if s.starts_with("printf ") && s.contains(" > ") {
            if let Some((lhs, path)) = s.rsplit_once(" > ") {
                let values: Vec<&str> = lhs.split_whitespace().skip(2).collect();
                let mut content = values.join("\n");
                content.push('\n');
                self.put_file(host, path.trim(), &content);
            }
            return MockResponse::empty();
        }

        // ── unzip -o -q zip -d dir ──────────────────────────────────────
        if s.starts_with("unzip ") {
            let zip = s.split_whitespace().nth(3).unwrap_or("");
            let Some(dir) = token_after(s, " -d ") else {
                return MockResponse::fail(9);
            };
            if self.file(host, zip).is_none() {
                return MockResponse::fail(9);
            }
            let tree = lock(&self.state.zip_tree).clone();
            for rel in tree {
                self.put_file(host, &format!("{}/{}", dir, rel), "");
            }
            return MockResponse::empty();
        }

        // ── tar -czf out -C dir . ───────────────────────────────────────
        if let Some(out) = token_after(s, "tar -czf ") {
            self.put_file(host, out, "tarball");
            return MockResponse::empty();
        }

        // ── grep -il succeeded dir/notification_patchmgr* | wc -l ───────
        if s.starts_with("grep -il ") && s.contains("notification_patchmgr") {
            let pattern = s.split_whitespace().nth(2).unwrap_or("").trim_matches('\'');
            let glob = s.split_whitespace().nth(3).unwrap_or("");
            let prefix = key(host, glob.trim_end_matches('*'));
            let count = lock(&self.state.fs)
                .iter()
                .filter(|(k, v)| {
                    k.starts_with(&prefix) && v.to_lowercase().contains(&pattern.to_lowercase())
                })
                .count();
            return MockResponse::ok(&count.to_string());
        }

        // ── tail -n N path ──────────────────────────────────────────────
        if s.starts_with("tail -n ") {
            let mut parts = s.split_whitespace().skip(2);
            let n: usize = parts.next().and_then(|v| v.parse().ok()).unwrap_or(10);
            let path = parts.next().unwrap_or("");
            return match self.file(host, path) {
                Some(content) => {
                    let lines: Vec<&str> = content.lines().collect();
                    let start = lines.len().saturating_sub(n);
                    MockResponse::ok(&lines[start..].join("\n"))
                }
                None => MockResponse::fail(1),
            };
        }

        // ── cat path (read file) ────────────────────────────────────────
        if s.starts_with("cat ") && !s.contains(" > ") && !s.contains("<<") {
            let path = s.split_whitespace().nth(1).unwrap_or("");
            return match self.file(host, path) {
                Some(content) => MockResponse::ok(&content),
                None => MockResponse::fail(1),
            };
        }

        // ── test -e path && echo yes || echo no ─────────────────────────
        if let Some(path) = token_after(s, "test -e ").or_else(|| token_after(s, "test -f "))
            && s.contains("echo yes")
        {
            return MockResponse::ok(if self.has_path(host, path) { "yes" } else { "no" });
        }

        // ── ls -1 path ──────────────────────────────────────────────────
        if let Some(path) = token_after(s, "ls -1 ") {
            let prefix = key(host, &format!("{}/", path.trim_end_matches('/')));
            let fs = lock(&self.state.fs);
            let mut entries: Vec<String> = Vec::new();
            for k in fs.keys() {
                if let Some(rest) = k.strip_prefix(&prefix)
                    && let Some(name) = rest.split('/').next()
                    && !entries.iter().any(|e| e == name)
                {
                    entries.push(name.to_string());
                }
            }
            entries.sort();
            return MockResponse::ok(&entries.join("\n"));
        }

        // ── mv -f src dst ───────────────────────────────────────────────
        if let Some(rest) = s.strip_prefix("mv -f ") {
            let mut parts = rest.split_whitespace();
            let (Some(src), Some(dst)) = (parts.next(), parts.next()) else {
                return MockResponse::fail(1);
            };
            if !self.has_path(host, src) {
                return MockResponse::fail(1);
            }
            self.rename(host, src, dst);
            return MockResponse::empty();
        }

        // ── rm -rf path ... ─────────────────────────────────────────────
        if s.contains("rm -rf ") {
            for segment in s.split("rm -rf ").skip(1) {
                for path in segment
                    .split(';')
                    .next()
                    .unwrap_or("")
                    .split_whitespace()
                    .take_while(|p| !p.starts_with('&') && !p.starts_with('|'))
                {
                    self.remove(host, path);
                }
            }
            return MockResponse::empty();
        }

        // ── Default: succeed silently ───────────────────────────────────
        // Covers: mkdir, cd, nohup, virsh, plugin scripts, etc.
        MockResponse::empty()
    }

    fn rename(&self, host: &str, src: &str, dst: &str) {
        let mut fs = lock(&self.state.fs);
        let src_key = key(host, src);
        let src_prefix = format!("{}/", src_key);
        let moved: Vec<String> = fs
            .keys()
            .filter(|k| **k == src_key || k.starts_with(&src_prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(content) = fs.remove(&old) {
                let suffix = &old[src_key.len()..];
                fs.insert(format!("{}{}", key(host, dst), suffix), content);
            }
        }
    }

    fn remove(&self, host: &str, path: &str) {
        let mut fs = lock(&self.state.fs);
        let exact = key(host, path);
        let prefix = format!("{}/", exact);
        fs.retain(|k, _| *k != exact && !k.starts_with(&prefix));
    }
}

fn token_after<'a>(s: &'a str, marker: &str) -> Option<&'a str> {
    let idx = s.find(marker)?;
    s[idx + marker.len()..].split_whitespace().next()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Value following `flag` in a command line.
pub fn flag_value<'a>(cmd: &'a str, flag: &str) -> Option<&'a str> {
    let mut parts = cmd.split_whitespace();
    while let Some(p) = parts.next() {
        if p == flag {
            return parts.next();
        }
    }
    None
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn run(&self, host: &str, cmd: &str) -> Result<CommandOutput> {
        self.check_reachable(host)?;
        let call = self.record(host, cmd);
        Ok(self.dispatch(&call).to_output())
    }

    async fn copy(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
        self.check_reachable(host)?;
        self.record(host, &format!("copy {} {}", local.display(), remote));
        let bytes = std::fs::read(local)?;
        let mut content = String::from_utf8_lossy(&bytes).into_owned();
        {
            let mut corrupt = lock(&self.state.corrupt_copies);
            if *corrupt > 0 {
                *corrupt -= 1;
                content.push_str("<corrupted>");
            }
        }
        self.put_file(host, remote, &content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heredoc_write_and_cat() {
        let mock = MockExecutor::new();
        crate::executor::write_file(&mock, "h1", "/tmp/a.json", "{\"k\":1}")
            .await
            .unwrap();
        let out = mock.run("h1", "cat /tmp/a.json 2>/dev/null").await.unwrap();
        assert_eq!(out.stdout, "{\"k\":1}");
        let other = mock.run("h2", "cat /tmp/a.json 2>/dev/null").await.unwrap();
        assert!(!other.success());
    }

    #[tokio::test]
    async fn test_exists_mv_rm() {
        let mock = MockExecutor::new().with_file("h1", "/logs/run/PatchmgrConsole.out", "x");
        assert!(mock.exists("h1", "/logs/run").await.unwrap());
        mock.run("h1", "mv -f /logs/run /logs/run_h1").await.unwrap();
        assert!(!mock.exists("h1", "/logs/run").await.unwrap());
        assert!(mock.file("h1", "/logs/run_h1/PatchmgrConsole.out").is_some());
        mock.run("h1", "rm -rf /logs/run_h1").await.unwrap();
        assert!(!mock.has_path("h1", "/logs/run_h1"));
    }

    #[tokio::test]
    async fn test_ls_and_sha() {
        let mock = MockExecutor::new()
            .with_file("h1", "/root/a/f", "1")
            .with_file("h1", "/root/b", "abc");
        let out = mock.run("h1", "ls -1 /root 2>/dev/null").await.unwrap();
        assert_eq!(out.stdout, "a\nb");
        let sha = mock
            .run("h1", "sha256sum /root/b 2>/dev/null | awk '{print $1}'")
            .await
            .unwrap();
        assert_eq!(
            sha.stdout,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_handler_precedence_and_recording() {
        let mock = MockExecutor::new().on("imageinfo -ver", |call, _| {
            Some(MockResponse::ok(if call.host == "a" { "22.1.0" } else { "21.2.0" }))
        });
        assert_eq!(mock.run("a", "imageinfo -ver").await.unwrap().stdout, "22.1.0");
        assert_eq!(mock.run("b", "imageinfo -ver").await.unwrap().stdout, "21.2.0");
        assert_eq!(mock.count_calls("imageinfo"), 2);
        assert_eq!(mock.hosts_for("imageinfo"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let mock = MockExecutor::new();
        mock.set_unreachable("down", true);
        let err = mock.run("down", "true").await.unwrap_err();
        assert!(err.to_string().contains("Unable to connect"));
    }

    #[test]
    fn test_flag_value() {
        let cmd = "./patchmgr --dbnodes /tmp/list --upgrade --log_dir /logs/x";
        assert_eq!(flag_value(cmd, "--log_dir"), Some("/logs/x"));
        assert_eq!(flag_value(cmd, "--dbnodes"), Some("/tmp/list"));
        assert_eq!(flag_value(cmd, "--rolling"), None);
    }
}
