//! 外部命令执行：安全检查、审批与按集群执行

pub mod approval;
pub mod shell;

pub use approval::{approver_from_config, Approval, Approver, AutoApprove, ConsoleApprover};
pub use shell::{
    check_script, Cluster, CommandExecutor, ExecOutcome, ShellExecutor, TIMEOUT_RESULT,
};
