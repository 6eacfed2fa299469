//! 工作流类型定义
//!
//! 节点、变体、守卫条件与转移表。转移表是静态数据：同一节点的多条转移按表中顺序
//! 依次检查守卫，第一条成立的生效。next_node 是纯函数，可以脱离编排器单独测试。

use serde::{Deserialize, Serialize};

use crate::config::WorkflowSection;
use crate::core::{SessionState, WorkflowError};

/// 状态机节点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// 生成检索查询
    Transform,
    /// 检索证据
    Retrieve,
    /// 生成回答
    Generate,
    /// 生成排障计划
    Plan,
    /// 执行计划中的命令
    Execute,
    /// 根据执行结果重规划
    Replan,
    Terminal,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Transform => "transform",
            NodeKind::Retrieve => "retrieve",
            NodeKind::Generate => "generate",
            NodeKind::Plan => "plan",
            NodeKind::Execute => "execute",
            NodeKind::Replan => "replan",
            NodeKind::Terminal => "terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeKind::Terminal)
    }
}

/// 工作流形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowVariant {
    /// plan -> execute -> replan 循环
    Diagnosis,
    /// transform -> retrieve -> generate 循环
    Rag,
}

impl WorkflowVariant {
    pub fn entry(&self) -> NodeKind {
        match self {
            WorkflowVariant::Diagnosis => NodeKind::Plan,
            WorkflowVariant::Rag => NodeKind::Transform,
        }
    }

    pub fn transitions(&self) -> &'static [Transition] {
        match self {
            WorkflowVariant::Diagnosis => DIAGNOSIS_TRANSITIONS,
            WorkflowVariant::Rag => RAG_TRANSITIONS,
        }
    }

    /// 需要注册处理器的节点
    pub fn nodes(&self) -> &'static [NodeKind] {
        match self {
            WorkflowVariant::Diagnosis => &[NodeKind::Plan, NodeKind::Execute, NodeKind::Replan],
            WorkflowVariant::Rag => &[NodeKind::Transform, NodeKind::Retrieve, NodeKind::Generate],
        }
    }
}

/// 检索次数上限与步数预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowPolicy {
    pub retrieval_limit: u32,
    pub recursion_limit: usize,
}

impl Default for WorkflowPolicy {
    fn default() -> Self {
        Self::from(&WorkflowSection::default())
    }
}

impl From<&WorkflowSection> for WorkflowPolicy {
    fn from(section: &WorkflowSection) -> Self {
        Self {
            retrieval_limit: section.retrieval_limit,
            recursion_limit: section.recursion_limit,
        }
    }
}

/// 转移守卫：只读会话状态与策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Always,
    Terminated,
    NotTerminated,
    RetrievalLimitExceeded,
    /// 最近一次检索的候选全部被相关性评分否决
    EvidenceUseless,
}

impl Guard {
    pub fn holds(&self, state: &SessionState, policy: &WorkflowPolicy) -> bool {
        match self {
            Guard::Always => true,
            Guard::Terminated => state.is_terminated(),
            Guard::NotTerminated => !state.is_terminated(),
            Guard::RetrievalLimitExceeded => state.retrieval_attempts() > policy.retrieval_limit,
            Guard::EvidenceUseless => !state.evidence_useful(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: NodeKind,
    pub guard: Guard,
    pub to: NodeKind,
}

const fn edge(from: NodeKind, guard: Guard, to: NodeKind) -> Transition {
    Transition { from, guard, to }
}

pub const DIAGNOSIS_TRANSITIONS: &[Transition] = &[
    edge(NodeKind::Plan, Guard::Terminated, NodeKind::Terminal),
    edge(NodeKind::Plan, Guard::Always, NodeKind::Execute),
    edge(NodeKind::Execute, Guard::Terminated, NodeKind::Terminal),
    edge(NodeKind::Execute, Guard::Always, NodeKind::Replan),
    edge(NodeKind::Replan, Guard::Terminated, NodeKind::Terminal),
    edge(NodeKind::Replan, Guard::RetrievalLimitExceeded, NodeKind::Terminal),
    edge(NodeKind::Replan, Guard::NotTerminated, NodeKind::Execute),
];

pub const RAG_TRANSITIONS: &[Transition] = &[
    edge(NodeKind::Transform, Guard::Terminated, NodeKind::Terminal),
    edge(NodeKind::Transform, Guard::Always, NodeKind::Retrieve),
    edge(NodeKind::Retrieve, Guard::Terminated, NodeKind::Terminal),
    edge(NodeKind::Retrieve, Guard::RetrievalLimitExceeded, NodeKind::Terminal),
    edge(NodeKind::Retrieve, Guard::EvidenceUseless, NodeKind::Transform),
    edge(NodeKind::Retrieve, Guard::Always, NodeKind::Generate),
    edge(NodeKind::Generate, Guard::Always, NodeKind::Terminal),
];

/// 计算下一个节点；没有匹配的转移时进入 Terminal
pub fn next_node(
    variant: WorkflowVariant,
    from: NodeKind,
    state: &SessionState,
    policy: &WorkflowPolicy,
) -> NodeKind {
    if from.is_terminal() {
        return NodeKind::Terminal;
    }
    variant
        .transitions()
        .iter()
        .filter(|t| t.from == from)
        .find(|t| t.guard.holds(state, policy))
        .map(|t| t.to)
        .unwrap_or(NodeKind::Terminal)
}

/// 会话结束的原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// 正常完成（回答已生成，或重规划宣告结束）
    Completed,
    /// 重写查询后仍无证据，或问题不在支持范围内
    NoEvidence,
    RetrievalLimit { limit: u32 },
    StepBudgetExceeded { limit: usize },
    InvalidInput { reason: String },
    NodeFailed { node: NodeKind, reason: String },
}

impl Termination {
    /// 是否属于正常的终止状态（含无证据与检索上限兜底）
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            Termination::Completed | Termination::NoEvidence | Termination::RetrievalLimit { .. }
        )
    }
}

/// 一次运行的结果；所有终止路径都返回完整的状态
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOutcome {
    pub state: SessionState,
    pub termination: Termination,
    /// 已执行的节点数
    pub steps: usize,
    pub trace: Vec<NodeKind>,
}

impl WorkflowOutcome {
    /// 步数预算耗尽、输入错误、节点失败映射为错误，其余返回最终状态
    pub fn into_result(self) -> Result<SessionState, WorkflowError> {
        match self.termination {
            Termination::Completed | Termination::NoEvidence | Termination::RetrievalLimit { .. } => {
                Ok(self.state)
            }
            Termination::StepBudgetExceeded { limit } => {
                Err(WorkflowError::StepBudgetExceeded { limit })
            }
            Termination::InvalidInput { reason } => Err(WorkflowError::InvalidInput(reason)),
            Termination::NodeFailed { node, reason } => {
                Err(WorkflowError::NodeFailed { node, reason })
            }
        }
    }

    pub fn executed(&self, node: NodeKind) -> usize {
        self.trace.iter().filter(|n| **n == node).count()
    }
}

/// 编排器单步执行的游标
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub node: NodeKind,
    pub state: SessionState,
    pub steps: usize,
    pub termination: Option<Termination>,
    pub trace: Vec<NodeKind>,
}

impl Cursor {
    pub fn new(node: NodeKind, state: SessionState) -> Self {
        Self {
            node,
            state,
            steps: 0,
            termination: None,
            trace: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.termination.is_some()
    }

    /// 结束后转为 WorkflowOutcome；未结束时返回 None
    pub fn into_outcome(self) -> Option<WorkflowOutcome> {
        let termination = self.termination?;
        Some(WorkflowOutcome {
            state: self.state,
            termination,
            steps: self.steps,
            trace: self.trace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new("the local-cluster is unknown", ["runbooks"])
    }

    fn policy() -> WorkflowPolicy {
        WorkflowPolicy::default()
    }

    #[test]
    fn test_diagnosis_transitions() {
        let v = WorkflowVariant::Diagnosis;
        let s = state();
        assert_eq!(v.entry(), NodeKind::Plan);
        assert_eq!(next_node(v, NodeKind::Plan, &s, &policy()), NodeKind::Execute);
        assert_eq!(next_node(v, NodeKind::Execute, &s, &policy()), NodeKind::Replan);
        assert_eq!(next_node(v, NodeKind::Replan, &s, &policy()), NodeKind::Execute);

        let done = s.finish();
        assert_eq!(next_node(v, NodeKind::Replan, &done, &policy()), NodeKind::Terminal);
        assert_eq!(next_node(v, NodeKind::Plan, &done, &policy()), NodeKind::Terminal);
    }

    #[test]
    fn test_rag_transitions() {
        let v = WorkflowVariant::Rag;
        let s = state();
        assert_eq!(v.entry(), NodeKind::Transform);
        assert_eq!(next_node(v, NodeKind::Transform, &s, &policy()), NodeKind::Retrieve);
        assert_eq!(next_node(v, NodeKind::Retrieve, &s, &policy()), NodeKind::Generate);
        assert_eq!(next_node(v, NodeKind::Generate, &s, &policy()), NodeKind::Terminal);

        let useless = s.clone().with_evidence_useful(false);
        assert_eq!(next_node(v, NodeKind::Retrieve, &useless, &policy()), NodeKind::Transform);

        let mut exhausted = s;
        for _ in 0..11 {
            exhausted = exhausted.record_retrieval();
        }
        assert_eq!(next_node(v, NodeKind::Retrieve, &exhausted, &policy()), NodeKind::Terminal);
    }

    #[test]
    fn test_terminal_is_absorbing() {
        for v in [WorkflowVariant::Diagnosis, WorkflowVariant::Rag] {
            assert_eq!(next_node(v, NodeKind::Terminal, &state(), &policy()), NodeKind::Terminal);
        }
    }

    #[test]
    fn test_nodes_outside_variant_go_terminal() {
        assert_eq!(
            next_node(WorkflowVariant::Rag, NodeKind::Plan, &state(), &policy()),
            NodeKind::Terminal
        );
    }

    #[test]
    fn test_every_variant_node_has_a_way_out() {
        for v in [WorkflowVariant::Diagnosis, WorkflowVariant::Rag] {
            for node in v.nodes() {
                let table = v.transitions();
                assert!(table
                    .iter()
                    .any(|t| t.from == *node && t.guard == Guard::Terminated
                        || t.from == *node && t.to == NodeKind::Terminal));
            }
        }
    }

    #[test]
    fn test_outcome_into_result() {
        let ok = WorkflowOutcome {
            state: state(),
            termination: Termination::NoEvidence,
            steps: 2,
            trace: vec![NodeKind::Transform, NodeKind::Retrieve],
        };
        assert!(ok.into_result().is_ok());

        let budget = WorkflowOutcome {
            state: state(),
            termination: Termination::StepBudgetExceeded { limit: 2 },
            steps: 2,
            trace: vec![NodeKind::Plan, NodeKind::Execute],
        };
        assert_eq!(
            budget.into_result(),
            Err(WorkflowError::StepBudgetExceeded { limit: 2 })
        );
    }
}
