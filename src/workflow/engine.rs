//! 工作流引擎
//!
//! 按转移表逐个执行节点。tick 最多执行一个节点，已结束的游标原样返回；
//! run 循环 tick 直到结束。步数预算在执行节点前检查：已执行步数等于预算时停止，
//! 结果为 StepBudgetExceeded，而不是静默截断。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::core::{RecoveryEngine, SessionState, WorkflowError};
use crate::generator::ModelConfig;
use crate::workflow::nodes::{NodeContext, NodeHandler};
use crate::workflow::types::*;

pub struct Orchestrator {
    variant: WorkflowVariant,
    policy: WorkflowPolicy,
    handlers: HashMap<NodeKind, Arc<dyn NodeHandler>>,
    recovery: RecoveryEngine,
}

impl Orchestrator {
    pub fn new(variant: WorkflowVariant, policy: WorkflowPolicy) -> Self {
        Self {
            variant,
            policy,
            handlers: HashMap::new(),
            recovery: RecoveryEngine::new(),
        }
    }

    /// 注册节点处理器；同一节点重复注册时后者覆盖前者
    pub fn with_handler(mut self, handler: Arc<dyn NodeHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    pub fn variant(&self) -> WorkflowVariant {
        self.variant
    }

    pub fn policy(&self) -> &WorkflowPolicy {
        &self.policy
    }

    /// 检查变体中的每个节点都有处理器
    pub fn validate(&self) -> Result<(), WorkflowError> {
        match self
            .variant
            .nodes()
            .iter()
            .find(|node| !self.handlers.contains_key(node))
        {
            Some(node) => Err(WorkflowError::MissingHandler(*node)),
            None => Ok(()),
        }
    }

    pub fn start(&self, state: SessionState) -> Cursor {
        Cursor::new(self.variant.entry(), state)
    }

    /// 执行至多一个节点
    pub async fn tick(&self, mut cursor: Cursor, model: &ModelConfig) -> Cursor {
        if cursor.is_finished() {
            return cursor;
        }
        if cursor.node.is_terminal() || cursor.state.is_terminated() {
            return self.finish(cursor, Termination::Completed);
        }
        if cursor.steps >= self.policy.recursion_limit {
            tracing::warn!(
                limit = self.policy.recursion_limit,
                node = cursor.node.as_str(),
                "step budget exhausted"
            );
            let limit = self.policy.recursion_limit;
            return self.finish(cursor, Termination::StepBudgetExceeded { limit });
        }

        let node = cursor.node;
        let Some(handler) = self.handlers.get(&node) else {
            let termination = self
                .recovery
                .classify(node, &WorkflowError::MissingHandler(node));
            tracing::warn!(node = node.as_str(), "no handler registered");
            return self.finish(cursor, termination);
        };

        let ctx = NodeContext {
            variant: self.variant,
            model,
            policy: &self.policy,
        };
        let started = Instant::now();
        cursor.steps += 1;
        cursor.trace.push(node);
        let result = handler.run(&cursor.state, &ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                tracing::info!(
                    node = node.as_str(),
                    step = cursor.steps,
                    elapsed_ms,
                    attempts = output.state.retrieval_attempts(),
                    "node finished"
                );
                cursor.state = output.state;
                if let Some(termination) = output.termination {
                    return self.finish(cursor, termination);
                }
                let next = next_node(self.variant, node, &cursor.state, &self.policy);
                if next.is_terminal() {
                    let termination = if Guard::RetrievalLimitExceeded.holds(&cursor.state, &self.policy) {
                        Termination::RetrievalLimit {
                            limit: self.policy.retrieval_limit,
                        }
                    } else {
                        Termination::Completed
                    };
                    return self.finish(cursor, termination);
                }
                cursor.node = next;
                cursor
            }
            Err(err) => {
                let termination = self.recovery.classify(node, &err);
                tracing::warn!(
                    node = node.as_str(),
                    step = cursor.steps,
                    elapsed_ms,
                    error = %err,
                    "node failed, terminating session"
                );
                self.finish(cursor, termination)
            }
        }
    }

    /// 从入口节点运行到结束
    pub async fn run(&self, state: SessionState, model: &ModelConfig) -> WorkflowOutcome {
        self.run_from(self.variant.entry(), state, model).await
    }

    /// 从指定节点开始运行（例如带着上一轮执行结果直接进入 Replan）
    pub async fn run_from(
        &self,
        node: NodeKind,
        state: SessionState,
        model: &ModelConfig,
    ) -> WorkflowOutcome {
        let mut cursor = Cursor::new(node, state);
        if let Err(reason) = check_input(&cursor.state) {
            tracing::warn!(reason = %reason, "rejecting workflow input");
            cursor = self.finish(cursor, Termination::InvalidInput { reason });
        }

        let started = Instant::now();
        while !cursor.is_finished() {
            cursor = self.tick(cursor, model).await;
        }
        let steps = cursor.steps;
        let trace = std::mem::take(&mut cursor.trace);
        let termination = cursor
            .termination
            .take()
            .unwrap_or(Termination::Completed);
        tracing::info!(
            variant = ?self.variant,
            steps,
            termination = ?termination,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "workflow finished"
        );
        WorkflowOutcome {
            state: cursor.state,
            termination,
            steps,
            trace,
        }
    }

    fn finish(&self, mut cursor: Cursor, termination: Termination) -> Cursor {
        if let Termination::RetrievalLimit { limit } = &termination {
            tracing::warn!(
                limit = *limit,
                attempts = cursor.state.retrieval_attempts(),
                "retrieval limit exceeded"
            );
        }
        cursor.state = self
            .recovery
            .settle(self.variant, &termination, cursor.state);
        cursor.node = NodeKind::Terminal;
        cursor.termination = Some(termination);
        cursor
    }
}

/// 必填字段检查：问题与检索范围
fn check_input(state: &SessionState) -> Result<(), String> {
    if state.issue().trim().is_empty() {
        return Err("issue is required".to_string());
    }
    if state.sources().is_empty() {
        return Err("document sources are required".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::workflow::nodes::NodeOutput;

    /// 每次执行都追加一段计划，从不终止
    struct Looping {
        kind: NodeKind,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeHandler for Looping {
        fn kind(&self) -> NodeKind {
            self.kind
        }

        async fn run(
            &self,
            state: &SessionState,
            _ctx: &NodeContext<'_>,
        ) -> Result<NodeOutput, WorkflowError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(NodeOutput::next(
                state.clone().with_plan(format!("{} {}", state.plan(), self.kind.as_str())),
            ))
        }
    }

    fn looping_diagnosis(limit: usize) -> (Orchestrator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = WorkflowPolicy {
            retrieval_limit: 10,
            recursion_limit: limit,
        };
        let mut orchestrator = Orchestrator::new(WorkflowVariant::Diagnosis, policy);
        for kind in [NodeKind::Plan, NodeKind::Execute, NodeKind::Replan] {
            orchestrator = orchestrator.with_handler(Arc::new(Looping {
                kind,
                calls: calls.clone(),
            }));
        }
        (orchestrator, calls)
    }

    #[tokio::test]
    async fn test_step_budget_stops_before_next_node() {
        let (orchestrator, calls) = looping_diagnosis(5);
        let outcome = orchestrator
            .run(SessionState::new("issue", ["runbooks"]), &ModelConfig::new("m"))
            .await;
        assert_eq!(outcome.steps, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(outcome.termination, Termination::StepBudgetExceeded { limit: 5 });
        assert!(outcome.state.is_terminated());
        assert!(outcome.into_result().is_err());
    }

    #[tokio::test]
    async fn test_finished_cursor_is_stable() {
        let (orchestrator, calls) = looping_diagnosis(3);
        let model = ModelConfig::new("m");
        let mut cursor = orchestrator.start(SessionState::new("issue", ["runbooks"]));
        while !cursor.is_finished() {
            cursor = orchestrator.tick(cursor, &model).await;
        }
        let before = cursor.clone();
        let executed = calls.load(Ordering::SeqCst);
        for _ in 0..3 {
            cursor = orchestrator.tick(cursor, &model).await;
        }
        assert_eq!(cursor, before);
        assert_eq!(calls.load(Ordering::SeqCst), executed);
    }

    #[tokio::test]
    async fn test_terminated_state_schedules_nothing() {
        let (orchestrator, calls) = looping_diagnosis(50);
        let state = SessionState::new("issue", ["runbooks"]).finish();
        let outcome = orchestrator.run(state, &ModelConfig::new("m")).await;
        assert_eq!(outcome.steps, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.termination, Termination::Completed);
    }

    #[tokio::test]
    async fn test_missing_sources_is_invalid_input() {
        let (orchestrator, calls) = looping_diagnosis(50);
        let state = SessionState::new("issue", Vec::<String>::new());
        let outcome = orchestrator.run(state, &ModelConfig::new("m")).await;
        assert!(matches!(outcome.termination, Termination::InvalidInput { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            outcome.into_result(),
            Err(WorkflowError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_validate_reports_missing_handler() {
        let orchestrator = Orchestrator::new(WorkflowVariant::Rag, WorkflowPolicy::default());
        assert_eq!(
            orchestrator.validate(),
            Err(WorkflowError::MissingHandler(NodeKind::Transform))
        );
    }
}
