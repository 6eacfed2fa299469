//! 错误分类
//!
//! - 输入错误（缺少检索范围、缺少必填字段）：立即返回调用方，不重试
//! - 资源耗尽（检索次数、步数预算）：由编排器转为带兜底内容的终止结果
//! - 超时：作为独立的结果类型上报，会话降级继续
//! - 无证据：不是错误，是正常的终止状态

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;
use crate::workflow::NodeKind;

/// 检索链路错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("document sources are required")]
    MissingSources,

    #[error("embedding failed: {0}")]
    Embedding(#[from] LlmError),

    #[error("vector store error: {0}")]
    Store(String),

    #[error("rerank failed: {0}")]
    Rerank(String),
}

/// Generator 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeneratorError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("unparseable generator output: {0}")]
    Parse(String),

    #[error("generator call timed out after {0:?}")]
    Timeout(Duration),
}

/// 命令执行错误（安全拦截与超时不是错误，见 ExecOutcome）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("empty script")]
    EmptyScript,

    #[error("failed to spawn command: {0}")]
    Spawn(String),
}

/// 工作流错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("step budget of {limit} exhausted")]
    StepBudgetExceeded { limit: usize },

    #[error("invalid workflow configuration: {0}")]
    InvalidConfiguration(String),

    #[error("no handler registered for node {0:?}")]
    MissingHandler(NodeKind),

    #[error("node {node:?} failed: {reason}")]
    NodeFailed { node: NodeKind, reason: String },

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Generator(#[from] GeneratorError),

    #[error(transparent)]
    Tool(#[from] ToolError),
}
