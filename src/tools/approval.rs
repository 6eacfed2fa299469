//! 命令执行审批
//!
//! Execute 节点在每段脚本执行前询问 Approver；未获批准的脚本不会执行，
//! 结果以 ExecOutcome::Rejected 写回会话，重规划时可以看到拒绝原因。

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ApprovalMode, ExecutorSection};
use crate::tools::shell::Cluster;

/// 审批结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Approval {
    Approved,
    Denied { reason: String },
}

impl Approval {
    pub fn denied(reason: impl Into<String>) -> Self {
        Approval::Denied {
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait Approver: Send + Sync {
    async fn review(&self, cluster: Cluster, script: &str) -> Approval;
}

/// 不审批
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl Approver for AutoApprove {
    async fn review(&self, _cluster: Cluster, _script: &str) -> Approval {
        Approval::Approved
    }
}

/// 终端确认：提示写到 stderr，从 stdin 读一行；超时或读取失败视为拒绝
#[derive(Debug, Clone)]
pub struct ConsoleApprover {
    timeout: Duration,
}

impl ConsoleApprover {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes" | "是")
}

#[async_trait]
impl Approver for ConsoleApprover {
    async fn review(&self, cluster: Cluster, script: &str) -> Approval {
        let mut stderr = io::stderr();
        let _ = write!(
            stderr,
            "\nApprove to execute the below commands on the {} cluster?\n{}\n(y/n) ",
            cluster.as_str(),
            script
        );
        let _ = stderr.flush();

        let read = tokio::task::spawn_blocking(|| {
            let mut input = String::new();
            io::stdin().read_line(&mut input).map(|_| input)
        });
        match tokio::time::timeout(self.timeout, read).await {
            Ok(Ok(Ok(answer))) if is_affirmative(&answer) => Approval::Approved,
            Ok(Ok(Ok(_))) => Approval::denied("not approved by operator"),
            Ok(Ok(Err(e))) => Approval::denied(format!("failed to read approval: {}", e)),
            Ok(Err(e)) => Approval::denied(format!("failed to read approval: {}", e)),
            Err(_) => Approval::denied(format!(
                "no approval within {}s",
                self.timeout.as_secs()
            )),
        }
    }
}

pub fn approver_from_config(section: &ExecutorSection) -> Arc<dyn Approver> {
    match section.approval {
        ApprovalMode::None => Arc::new(AutoApprove),
        ApprovalMode::Console => Arc::new(ConsoleApprover::new(Duration::from_secs(
            section.approval_timeout_secs,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affirmative_answers() {
        for answer in ["y\n", "YES", " yes ", "是"] {
            assert!(is_affirmative(answer), "{:?}", answer);
        }
        for answer in ["", "n", "no", "yep"] {
            assert!(!is_affirmative(answer), "{:?}", answer);
        }
    }

    #[tokio::test]
    async fn test_auto_approve() {
        assert_eq!(
            AutoApprove.review(Cluster::Hub, "oc get pods").await,
            Approval::Approved
        );
    }

    #[test]
    fn test_approver_from_config_defaults_to_console() {
        let section = ExecutorSection::default();
        assert_eq!(section.approval, ApprovalMode::Console);
        let _approver = approver_from_config(&section);
    }
}
