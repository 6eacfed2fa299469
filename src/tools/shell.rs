//! 排障命令执行：执行前安全检查，执行时带超时
//!
//! 命中危险模式（递归删除、裸设备写入、fork bomb 等）时直接拒绝，不会先执行再补救。
//! 超时与拒绝都不是错误，分别以 ExecOutcome::TimedOut / Rejected 返回，会话继续。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::ExecutorSection;
use crate::core::ToolError;

/// 超时时写入执行结果的固定文本
pub const TIMEOUT_RESULT: &str = "commands execution timeout";

/// 禁止的子串（大小写不敏感）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "curl | sh",
    "wget | sh",
    ":(){ :|:& };:",
];

/// 需要正则才能识别的危险模式
const FORBIDDEN_PATTERNS: &[(&str, &str)] = &[
    (r"\brm\s+(-[a-zA-Z]*[rR][a-zA-Z]*\s+)*-[a-zA-Z]*[rR]", "recursive delete"),
    (r"\brm\b[^|;&\n]*\s--recursive\b", "recursive delete"),
    (r"\bmv\s+.*\s/dev/null\b", "move to /dev/null"),
    (r"\bdd\b", "raw copy with dd"),
    (
        r"(>\s*|\bof=|\btee\s+(-\S+\s+)*)/dev/(sd|hd|nvme|xvd|vd)[a-z0-9]*",
        "raw block device write",
    ),
    (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", "fork bomb"),
];

static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();

fn patterns() -> &'static [(Regex, &'static str)] {
    PATTERNS.get_or_init(|| {
        FORBIDDEN_PATTERNS
            .iter()
            .filter_map(|(p, label)| Regex::new(p).ok().map(|re| (re, *label)))
            .collect()
    })
}

/// 安全检查：返回拒绝原因
pub fn check_script(script: &str) -> Result<(), String> {
    let lower = script.to_lowercase();
    if let Some(hit) = FORBIDDEN_SUBSTR.iter().find(|s| lower.contains(*s)) {
        return Err(format!("forbidden pattern: {}", hit));
    }
    if let Some((_, label)) = patterns().iter().find(|(re, _)| re.is_match(script)) {
        return Err(format!("forbidden pattern: {}", label));
    }
    Ok(())
}

/// 一次执行的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut {
        after: Duration,
    },
    Rejected {
        reason: String,
    },
}

impl ExecOutcome {
    /// 写入会话 results 的文本
    pub fn summary(&self) -> String {
        match self {
            ExecOutcome::Completed {
                exit_code,
                stdout,
                stderr,
            } => {
                let mut text = stdout.trim_end().to_string();
                if !stderr.trim().is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&format!("stderr: {}", stderr.trim_end()));
                }
                if *exit_code != 0 {
                    text.push_str(&format!("\nexit code: {}", exit_code));
                }
                text
            }
            ExecOutcome::TimedOut { .. } => TIMEOUT_RESULT.to_string(),
            ExecOutcome::Rejected { reason } => format!("command rejected: {}", reason),
        }
    }
}

/// 命令的目标集群
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cluster {
    Hub,
    Spoke,
}

impl Cluster {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cluster::Hub => "hub",
            Cluster::Spoke => "spoke",
        }
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, script: &str, timeout: Duration) -> Result<ExecOutcome, ToolError>;

    /// 在指定集群的上下文中执行；默认与 execute 相同
    async fn execute_on(
        &self,
        _cluster: Cluster,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecOutcome, ToolError> {
        self.execute(script, timeout).await
    }

    /// 未指定超时时使用的默认值
    fn default_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }
}

/// 通过 sh -c 执行脚本
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    default_timeout: Duration,
    pause_after: Duration,
    working_dir: Option<PathBuf>,
    hub_dir: Option<PathBuf>,
    spoke_dir: Option<PathBuf>,
}

impl ShellExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            pause_after: Duration::ZERO,
            working_dir: None,
            hub_dir: None,
            spoke_dir: None,
        }
    }

    pub fn from_config(section: &ExecutorSection) -> Self {
        Self {
            default_timeout: Duration::from_secs(section.timeout_secs),
            pause_after: Duration::from_millis(section.pause_after_ms),
            working_dir: section.working_dir.clone(),
            hub_dir: section.hub_working_dir.clone(),
            spoke_dir: section.spoke_working_dir.clone(),
        }
    }

    /// 每次执行后额外等待（下游 API 有限流时使用）
    pub fn with_pause_after(mut self, pause: Duration) -> Self {
        self.pause_after = pause;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// 某个集群的命令在独立目录下执行（例如该集群的 must-gather 目录）
    pub fn with_cluster_dir(mut self, cluster: Cluster, dir: impl Into<PathBuf>) -> Self {
        match cluster {
            Cluster::Hub => self.hub_dir = Some(dir.into()),
            Cluster::Spoke => self.spoke_dir = Some(dir.into()),
        }
        self
    }

    fn dir_for(&self, cluster: Cluster) -> Option<&Path> {
        let dir = match cluster {
            Cluster::Hub => &self.hub_dir,
            Cluster::Spoke => &self.spoke_dir,
        };
        dir.as_deref().or(self.working_dir.as_deref())
    }

    fn command(&self, script: &str, dir: Option<&Path>) -> Command {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", script]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", script]);
            c
        };
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

impl ShellExecutor {
    async fn run(
        &self,
        script: &str,
        timeout: Duration,
        dir: Option<&Path>,
    ) -> Result<ExecOutcome, ToolError> {
        let script = script.trim();
        if script.is_empty() {
            return Err(ToolError::EmptyScript);
        }
        if let Err(reason) = check_script(script) {
            tracing::warn!(script = %script, reason = %reason, "command rejected");
            return Ok(ExecOutcome::Rejected { reason });
        }

        tracing::info!(script = %script, timeout_secs = timeout.as_secs(), "executing commands");
        let outcome = match tokio::time::timeout(timeout, self.command(script, dir).output()).await {
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "command execution timed out");
                ExecOutcome::TimedOut { after: timeout }
            }
            Ok(output) => {
                let output = output.map_err(|e| ToolError::Spawn(e.to_string()))?;
                ExecOutcome::Completed {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                }
            }
        };

        if !self.pause_after.is_zero() {
            tokio::time::sleep(self.pause_after).await;
        }
        Ok(outcome)
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, script: &str, timeout: Duration) -> Result<ExecOutcome, ToolError> {
        self.run(script, timeout, self.working_dir.as_deref()).await
    }

    async fn execute_on(
        &self,
        cluster: Cluster,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecOutcome, ToolError> {
        self.run(script, timeout, self.dir_for(cluster)).await
    }

    fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_check_rejects_destructive_patterns() {
        for script in [
            "rm -rf /var/lib/etcd",
            "rm -r -f /tmp/x",
            "rm -fR /data",
            "mv /etc/kubernetes/admin.conf /dev/null",
            "dd if=/dev/zero of=/dev/sda bs=1M",
            "echo boom > /dev/sdb",
            ":(){ :|:& };:",
            "mkfs.ext4 /dev/vdb",
            "chmod 777 /etc",
            "cat img.bin | dd of=/dev/sda bs=1M",
            "echo x | tee /dev/sda",
            "echo x | tee -a /dev/nvme0n1",
            "rm --recursive --force /var/lib/etcd",
            "rm --force --recursive /var/lib/etcd",
        ] {
            assert!(check_script(script).is_err(), "should reject: {}", script);
        }
    }

    #[test]
    fn test_all_forbidden_patterns_compile() {
        assert_eq!(patterns().len(), FORBIDDEN_PATTERNS.len());
    }

    #[test]
    fn test_safety_check_allows_read_only_commands() {
        for script in [
            "oc get managedclusters",
            "kubectl -n open-cluster-management get pods",
            "ls -l /tmp && grep -r error /var/log/app.log",
            "echo ok > /tmp/out.txt",
            "oc adm must-gather --dest-dir=/tmp/mg",
            "cat /dev/null | tee /tmp/empty.log",
            "rm /tmp/stale.lock",
        ] {
            assert!(check_script(script).is_ok(), "should allow: {}", script);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_captures_output() {
        let executor = ShellExecutor::new(Duration::from_secs(5));
        let outcome = executor
            .execute("echo hello; echo oops 1>&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        match &outcome {
            ExecOutcome::Completed {
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(*exit_code, 3);
                assert_eq!(stdout.trim(), "hello");
                assert_eq!(stderr.trim(), "oops");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(outcome.summary().contains("exit code: 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_named_outcome() {
        let executor = ShellExecutor::new(Duration::from_secs(5));
        let outcome = executor
            .execute("sleep 5", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecOutcome::TimedOut {
                after: Duration::from_millis(100)
            }
        );
        assert_eq!(outcome.summary(), TIMEOUT_RESULT);
    }

    #[tokio::test]
    async fn test_rejected_script_is_not_run() {
        let executor = ShellExecutor::new(Duration::from_secs(5));
        let outcome = executor
            .execute("rm -rf /", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(outcome, ExecOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_empty_script_is_error() {
        let executor = ShellExecutor::new(Duration::from_secs(5));
        assert_eq!(
            executor.execute("   ", Duration::from_secs(1)).await,
            Err(ToolError::EmptyScript)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let executor = ShellExecutor::new(Duration::from_secs(5)).with_working_dir(dir.path());
        let outcome = executor.execute("ls", Duration::from_secs(5)).await.unwrap();
        assert!(outcome.summary().contains("marker.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cluster_dirs_are_separate() {
        let hub = tempfile::tempdir().unwrap();
        let spoke = tempfile::tempdir().unwrap();
        std::fs::write(hub.path().join("hub-marker.txt"), "x").unwrap();
        std::fs::write(spoke.path().join("spoke-marker.txt"), "x").unwrap();
        let executor = ShellExecutor::new(Duration::from_secs(5))
            .with_cluster_dir(Cluster::Hub, hub.path())
            .with_cluster_dir(Cluster::Spoke, spoke.path());

        let on_hub = executor
            .execute_on(Cluster::Hub, "ls", Duration::from_secs(5))
            .await
            .unwrap()
            .summary();
        assert!(on_hub.contains("hub-marker.txt"));
        assert!(!on_hub.contains("spoke-marker.txt"));

        let on_spoke = executor
            .execute_on(Cluster::Spoke, "ls", Duration::from_secs(5))
            .await
            .unwrap()
            .summary();
        assert!(on_spoke.contains("spoke-marker.txt"));
        assert!(!on_spoke.contains("hub-marker.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cluster_without_dir_falls_back_to_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shared.txt"), "x").unwrap();
        let executor = ShellExecutor::new(Duration::from_secs(5)).with_working_dir(dir.path());
        let outcome = executor
            .execute_on(Cluster::Spoke, "ls", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.summary().contains("shared.txt"));
    }
}
