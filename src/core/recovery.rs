//! 错误恢复与兜底内容
//!
//! 把节点错误分类为终止原因（输入错误快速失败，其余降级为节点失败），
//! 并为每种终止原因写入固定的兜底计划 / 回答，保证调用方总能拿到完整的会话状态。

use crate::core::{RetrievalError, SessionState, WorkflowError};
use crate::workflow::{NodeKind, Termination, WorkflowVariant};

/// RAG 回答的兜底文本
pub const NO_ANSWER: &str = "I have no idea for this issue.";
/// 排障计划的兜底文本
pub const NO_PLAN: &str = "There is no plan for this issue.";
pub const NO_DOCS_REASONING: &str = "No similar docs are found.";
pub const OFF_TOPIC_REASONING: &str = "The issue is not related to the supported product.";
pub const RETRIEVAL_LIMIT_REASONING: &str =
    "Retrieval limit reached before enough evidence was collected.";
pub const STEP_BUDGET_REASONING: &str = "Step budget exhausted before the workflow finished.";

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 节点错误对应的终止原因
    pub fn classify(&self, node: NodeKind, err: &WorkflowError) -> Termination {
        match err {
            WorkflowError::InvalidInput(reason) => Termination::InvalidInput {
                reason: reason.clone(),
            },
            WorkflowError::Retrieval(RetrievalError::MissingSources) => Termination::InvalidInput {
                reason: RetrievalError::MissingSources.to_string(),
            },
            WorkflowError::StepBudgetExceeded { limit } => {
                Termination::StepBudgetExceeded { limit: *limit }
            }
            WorkflowError::NodeFailed { node, reason } => Termination::NodeFailed {
                node: *node,
                reason: reason.clone(),
            },
            other => Termination::NodeFailed {
                node,
                reason: other.to_string(),
            },
        }
    }

    pub fn fallback_text(&self, variant: WorkflowVariant) -> &'static str {
        match variant {
            WorkflowVariant::Diagnosis => NO_PLAN,
            WorkflowVariant::Rag => NO_ANSWER,
        }
    }

    /// 按终止原因收尾：返回的状态一定是 terminated
    pub fn settle(
        &self,
        variant: WorkflowVariant,
        termination: &Termination,
        state: SessionState,
    ) -> SessionState {
        let fallback = self.fallback_text(variant);
        match termination {
            Termination::Completed => state.finish(),
            // 节点已经写入兜底内容时保留
            Termination::NoEvidence if state.is_terminated() => state,
            Termination::NoEvidence => state.terminate(fallback, NO_DOCS_REASONING),
            Termination::RetrievalLimit { .. } => {
                state.terminate(fallback, RETRIEVAL_LIMIT_REASONING)
            }
            // 已有计划时保留计划，只补充原因
            Termination::StepBudgetExceeded { .. } if state.has_plan() => {
                state.with_reasoning(STEP_BUDGET_REASONING).finish()
            }
            Termination::StepBudgetExceeded { .. } => state.terminate(fallback, STEP_BUDGET_REASONING),
            Termination::InvalidInput { reason } => state.terminate(fallback, reason.clone()),
            Termination::NodeFailed { node, reason } => {
                let reasoning = format!("{} failed: {}", node.as_str(), reason);
                if state.has_plan() {
                    state.with_reasoning(reasoning).finish()
                } else {
                    state.terminate(fallback, reasoning)
                }
            }
        }
    }
}
