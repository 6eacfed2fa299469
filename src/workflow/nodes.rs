//! 节点处理器
//!
//! 每个节点是一个注入到编排器的策略对象：读入 `&SessionState`，返回新的状态，
//! 需要提前结束时附带终止原因。Plan / Replan 与 Retrieve 共用同一条取证管线，
//! 因此两种工作流共享检索计数与零证据策略。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::recovery::{NO_DOCS_REASONING, OFF_TOPIC_REASONING};
use crate::core::{Candidate, RecoveryEngine, SessionState, WorkflowError};
use crate::generator::{AnswerRequest, Generator, ModelConfig, PlanRequest, ReplanRequest};
use crate::rag::{RelevanceGrader, Retriever};
use crate::tools::{Approval, Approver, AutoApprove, Cluster, CommandExecutor, ExecOutcome};
use crate::workflow::query::{Formulation, FormulationInput, QueryFormulator};
use crate::workflow::types::{NodeKind, Termination, WorkflowPolicy, WorkflowVariant};

/// 节点执行时可见的运行参数
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    pub variant: WorkflowVariant,
    pub model: &'a ModelConfig,
    pub policy: &'a WorkflowPolicy,
}

impl NodeContext<'_> {
    fn fallback_text(&self) -> &'static str {
        RecoveryEngine::new().fallback_text(self.variant)
    }
}

/// 节点输出：新状态，以及可选的终止原因
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    pub state: SessionState,
    pub termination: Option<Termination>,
}

impl NodeOutput {
    pub fn next(state: SessionState) -> Self {
        Self {
            state,
            termination: None,
        }
    }

    pub fn stop(state: SessionState, termination: Termination) -> Self {
        Self {
            state,
            termination: Some(termination),
        }
    }
}

#[async_trait]
pub trait NodeHandler: Send + Sync {
    fn kind(&self) -> NodeKind;

    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, WorkflowError>;
}

/// 一轮取证的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Evidence {
    Found {
        state: SessionState,
        candidates: Vec<Candidate>,
    },
    /// 有候选，但全部被相关性评分否决
    Useless(SessionState),
    /// 改写重试一次后仍然没有候选
    Missing(SessionState),
    LimitReached(SessionState),
}

/// 检索 -> （零结果时改写重试一次）-> 可选的相关性评分
pub struct EvidencePipeline {
    formulator: Arc<QueryFormulator>,
    retriever: Arc<Retriever>,
    grader: Option<Arc<RelevanceGrader>>,
}

impl EvidencePipeline {
    pub fn new(formulator: Arc<QueryFormulator>, retriever: Arc<Retriever>) -> Self {
        Self {
            formulator,
            retriever,
            grader: None,
        }
    }

    pub fn with_grader(mut self, grader: Arc<RelevanceGrader>) -> Self {
        self.grader = Some(grader);
        self
    }

    pub fn formulator(&self) -> &QueryFormulator {
        &self.formulator
    }

    /// 用 state.query() 检索；每次取证计数加一（含一次改写重试），超过上限立即返回
    pub async fn collect(
        &self,
        state: SessionState,
        ctx: &NodeContext<'_>,
    ) -> Result<Evidence, WorkflowError> {
        let state = state.record_retrieval();
        if state.retrieval_attempts() > ctx.policy.retrieval_limit {
            return Ok(Evidence::LimitReached(state));
        }
        let mut candidates = self.retriever.retrieve(state.query(), state.sources()).await?;
        let mut state = state;

        if candidates.is_empty() {
            tracing::info!(query = %state.query(), "no candidates, reformulating once");
            let retry = self
                .formulator
                .reformulate(state.issue(), state.query(), ctx.model)
                .await?;
            let Formulation::Query(query) = retry else {
                return Ok(Evidence::Missing(state));
            };
            state = state.with_query(query);
            candidates = self.retriever.retrieve(state.query(), state.sources()).await?;
            if candidates.is_empty() {
                return Ok(Evidence::Missing(state));
            }
        }

        if let Some(grader) = &self.grader {
            let kept = grader.filter(&candidates, state.query(), ctx.model).await?;
            if kept.is_empty() {
                tracing::info!(
                    query = %state.query(),
                    candidates = candidates.len(),
                    "all candidates judged irrelevant"
                );
                return Ok(Evidence::Useless(state));
            }
            candidates = kept;
        }

        Ok(Evidence::Found { state, candidates })
    }
}

fn texts(candidates: &[Candidate]) -> Vec<String> {
    candidates.iter().map(|c| c.text.clone()).collect()
}

/// 无证据时的统一收尾
fn no_evidence(state: SessionState, ctx: &NodeContext<'_>) -> NodeOutput {
    NodeOutput::stop(
        state
            .with_evidence(&[])
            .terminate(ctx.fallback_text(), NO_DOCS_REASONING),
        Termination::NoEvidence,
    )
}

fn off_topic(state: &SessionState, ctx: &NodeContext<'_>) -> NodeOutput {
    NodeOutput::stop(
        state
            .clone()
            .terminate(ctx.fallback_text(), OFF_TOPIC_REASONING),
        Termination::NoEvidence,
    )
}

/// 生成本轮检索查询
pub struct TransformNode {
    formulator: Arc<QueryFormulator>,
}

impl TransformNode {
    pub fn new(formulator: Arc<QueryFormulator>) -> Self {
        Self { formulator }
    }
}

#[async_trait]
impl NodeHandler for TransformNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Transform
    }

    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, WorkflowError> {
        match self
            .formulator
            .formulate(FormulationInput::from_state(state), ctx.model)
            .await?
        {
            Formulation::Query(query) => {
                tracing::info!(query = %query, "retrieval query formulated");
                Ok(NodeOutput::next(state.clone().with_query(query)))
            }
            Formulation::Exhausted => Ok(off_topic(state, ctx)),
        }
    }
}

/// 检索证据
pub struct RetrieveNode {
    pipeline: Arc<EvidencePipeline>,
}

impl RetrieveNode {
    pub fn new(pipeline: Arc<EvidencePipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl NodeHandler for RetrieveNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Retrieve
    }

    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, WorkflowError> {
        Ok(match self.pipeline.collect(state.clone(), ctx).await? {
            Evidence::Found { state, candidates } => {
                tracing::info!(
                    documents = candidates.len(),
                    attempts = state.retrieval_attempts(),
                    "evidence retrieved"
                );
                NodeOutput::next(state.with_evidence(&candidates).with_evidence_useful(true))
            }
            Evidence::Useless(state) => {
                NodeOutput::next(state.with_evidence(&[]).with_evidence_useful(false))
            }
            Evidence::Missing(state) => no_evidence(state, ctx),
            Evidence::LimitReached(state) => NodeOutput::stop(
                state,
                Termination::RetrievalLimit {
                    limit: ctx.policy.retrieval_limit,
                },
            ),
        })
    }
}

/// 基于证据生成回答
pub struct GenerateNode {
    generator: Arc<dyn Generator>,
}

impl GenerateNode {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl NodeHandler for GenerateNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Generate
    }

    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, WorkflowError> {
        let feedback = state.results().join("\n");
        let answer = self
            .generator
            .answer(
                ctx.model,
                AnswerRequest {
                    issue: state.issue(),
                    documents: state.documents(),
                    previous_answer: state.has_plan().then(|| state.plan()),
                    feedback: (!feedback.trim().is_empty()).then_some(feedback.as_str()),
                    history: state.history(),
                },
            )
            .await?;
        Ok(NodeOutput::next(
            state
                .clone()
                .with_plan(answer.response)
                .with_reasoning(answer.reasoning),
        ))
    }
}

/// 生成首个排障计划；查询为原始问题
pub struct PlanNode {
    pipeline: Arc<EvidencePipeline>,
    generator: Arc<dyn Generator>,
}

impl PlanNode {
    pub fn new(pipeline: Arc<EvidencePipeline>, generator: Arc<dyn Generator>) -> Self {
        Self {
            pipeline,
            generator,
        }
    }
}

#[async_trait]
impl NodeHandler for PlanNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Plan
    }

    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, WorkflowError> {
        let Formulation::Query(query) = self
            .pipeline
            .formulator()
            .formulate(FormulationInput::from_state(state), ctx.model)
            .await?
        else {
            return Ok(off_topic(state, ctx));
        };

        match self.pipeline.collect(state.clone().with_query(query), ctx).await? {
            Evidence::Found { state, candidates } => {
                let documents = texts(&candidates);
                let plan = self
                    .generator
                    .plan(
                        ctx.model,
                        PlanRequest {
                            issue: state.issue(),
                            documents: &documents,
                        },
                    )
                    .await?;
                tracing::info!(
                    documents = documents.len(),
                    hub_commands = plan.hub_commands.len(),
                    spoke_commands = plan.spoke_commands.len(),
                    "plan generated"
                );
                Ok(NodeOutput::next(
                    state
                        .with_evidence(&candidates)
                        .with_plan(plan.plan)
                        .with_reasoning(plan.reasoning)
                        .with_commands(plan.hub_commands, plan.spoke_commands),
                ))
            }
            Evidence::Useless(state) | Evidence::Missing(state) => Ok(no_evidence(state, ctx)),
            Evidence::LimitReached(state) => Ok(NodeOutput::stop(
                state,
                Termination::RetrievalLimit {
                    limit: ctx.policy.retrieval_limit,
                },
            )),
        }
    }
}

/// 执行计划中的 hub / spoke 命令，结果写入 results；每段脚本执行前先经过审批
pub struct ExecuteNode {
    executor: Arc<dyn CommandExecutor>,
    approver: Arc<dyn Approver>,
    timeout: Option<Duration>,
}

impl ExecuteNode {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            approver: Arc::new(AutoApprove),
            timeout: None,
        }
    }

    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl NodeHandler for ExecuteNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Execute
    }

    async fn run(
        &self,
        state: &SessionState,
        _ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, WorkflowError> {
        let timeout = self
            .timeout
            .unwrap_or_else(|| self.executor.default_timeout());
        let mut results = Vec::new();
        for (cluster, commands) in [
            (Cluster::Hub, state.hub_commands()),
            (Cluster::Spoke, state.spoke_commands()),
        ] {
            if commands.is_empty() {
                continue;
            }
            let script = commands.join("\n");
            let outcome = match self.approver.review(cluster, &script).await {
                Approval::Approved => self.executor.execute_on(cluster, &script, timeout).await,
                Approval::Denied { reason } => {
                    tracing::warn!(cluster = cluster.as_str(), reason = %reason, "commands not approved");
                    Ok(ExecOutcome::Rejected { reason })
                }
            };
            let output = match outcome {
                Ok(outcome) => outcome.summary(),
                Err(err) => {
                    tracing::warn!(cluster = cluster.as_str(), error = %err, "command execution failed");
                    format!("command failed: {}", err)
                }
            };
            results.push(format!("[{} cluster]\n$ {}\n{}", cluster.as_str(), script, output));
        }
        if results.is_empty() {
            results.push("no commands to execute".to_string());
        }
        Ok(NodeOutput::next(state.clone().with_results(results)))
    }
}

/// 根据上一轮计划与执行结果改写查询、重新取证并重规划
pub struct ReplanNode {
    pipeline: Arc<EvidencePipeline>,
    generator: Arc<dyn Generator>,
}

impl ReplanNode {
    pub fn new(pipeline: Arc<EvidencePipeline>, generator: Arc<dyn Generator>) -> Self {
        Self {
            pipeline,
            generator,
        }
    }
}

#[async_trait]
impl NodeHandler for ReplanNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Replan
    }

    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, WorkflowError> {
        let Formulation::Query(query) = self
            .pipeline
            .formulator()
            .formulate(FormulationInput::from_state(state), ctx.model)
            .await?
        else {
            return Ok(off_topic(state, ctx));
        };

        match self.pipeline.collect(state.clone().with_query(query), ctx).await? {
            Evidence::Found { state, candidates } => {
                let documents = texts(&candidates);
                let replan = self
                    .generator
                    .replan(
                        ctx.model,
                        ReplanRequest {
                            issue: state.issue(),
                            documents: &documents,
                            previous_plan: state.plan(),
                            previous_results: state.results(),
                        },
                    )
                    .await?;
                let terminate = replan.terminate;
                let next = state
                    .with_evidence(&candidates)
                    .with_plan(replan.plan)
                    .with_reasoning(replan.reasoning)
                    .with_commands(replan.hub_commands, replan.spoke_commands);
                tracing::info!(terminate, attempts = next.retrieval_attempts(), "replanned");
                Ok(if terminate {
                    NodeOutput::stop(next, Termination::Completed)
                } else {
                    NodeOutput::next(next)
                })
            }
            Evidence::Useless(state) | Evidence::Missing(state) => Ok(no_evidence(state, ctx)),
            Evidence::LimitReached(state) => Ok(NodeOutput::stop(
                state,
                Termination::RetrievalLimit {
                    limit: ctx.policy.retrieval_limit,
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::core::ToolError;

    /// 记录脚本；包含 sleep 的脚本视为超时
    #[derive(Default)]
    struct RecordingExecutor {
        scripts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(&self, script: &str, timeout: Duration) -> Result<ExecOutcome, ToolError> {
            self.scripts.lock().unwrap().push(script.to_string());
            if script.contains("sleep") {
                return Ok(ExecOutcome::TimedOut { after: timeout });
            }
            Ok(ExecOutcome::Completed {
                exit_code: 0,
                stdout: format!("ran {}", script.lines().count()),
                stderr: String::new(),
            })
        }
    }

    /// 记录每次执行的目标集群
    #[derive(Default)]
    struct ClusterExecutor {
        clusters: Mutex<Vec<Cluster>>,
    }

    #[async_trait]
    impl CommandExecutor for ClusterExecutor {
        async fn execute(&self, _script: &str, _timeout: Duration) -> Result<ExecOutcome, ToolError> {
            Err(ToolError::Spawn("cluster is required".to_string()))
        }

        async fn execute_on(
            &self,
            cluster: Cluster,
            _script: &str,
            _timeout: Duration,
        ) -> Result<ExecOutcome, ToolError> {
            self.clusters.lock().unwrap().push(cluster);
            Ok(ExecOutcome::Completed {
                exit_code: 0,
                stdout: format!("on {}", cluster.as_str()),
                stderr: String::new(),
            })
        }
    }

    /// 只批准 hub 上的命令
    struct HubOnly;

    #[async_trait]
    impl Approver for HubOnly {
        async fn review(&self, cluster: Cluster, _script: &str) -> Approval {
            match cluster {
                Cluster::Hub => Approval::Approved,
                Cluster::Spoke => Approval::denied("spoke changes need a change window"),
            }
        }
    }

    fn ctx<'a>(model: &'a ModelConfig, policy: &'a WorkflowPolicy) -> NodeContext<'a> {
        NodeContext {
            variant: WorkflowVariant::Diagnosis,
            model,
            policy,
        }
    }

    #[tokio::test]
    async fn test_execute_runs_hub_and_spoke_scripts() {
        let executor = Arc::new(RecordingExecutor::default());
        let node = ExecuteNode::new(executor.clone());
        let state = SessionState::new("issue", ["runbooks"]).with_commands(
            vec!["oc get mcl".to_string(), "oc get pods".to_string()],
            vec!["sleep 500".to_string()],
        );
        let model = ModelConfig::new("m");
        let policy = WorkflowPolicy::default();
        let out = node.run(&state, &ctx(&model, &policy)).await.unwrap();

        assert!(out.termination.is_none());
        assert_eq!(executor.scripts.lock().unwrap().len(), 2);
        let results = out.state.results();
        assert_eq!(results.len(), 2);
        assert!(results[0].contains("ran 2"));
        assert!(results[1].contains(crate::tools::TIMEOUT_RESULT));
        // 输入状态保持不变
        assert!(state.results().is_empty());
    }

    #[tokio::test]
    async fn test_execute_without_commands() {
        let node = ExecuteNode::new(Arc::new(RecordingExecutor::default()));
        let state = SessionState::new("issue", ["runbooks"]);
        let model = ModelConfig::new("m");
        let policy = WorkflowPolicy::default();
        let out = node.run(&state, &ctx(&model, &policy)).await.unwrap();
        assert_eq!(out.state.results(), &["no commands to execute".to_string()]);
    }

    #[tokio::test]
    async fn test_execute_targets_each_cluster() {
        let executor = Arc::new(ClusterExecutor::default());
        let node = ExecuteNode::new(executor.clone());
        let state = SessionState::new("issue", ["runbooks"])
            .with_commands(vec!["oc get mcl".to_string()], vec!["oc get pods".to_string()]);
        let model = ModelConfig::new("m");
        let policy = WorkflowPolicy::default();
        let out = node.run(&state, &ctx(&model, &policy)).await.unwrap();

        assert_eq!(*executor.clusters.lock().unwrap(), vec![Cluster::Hub, Cluster::Spoke]);
        assert!(out.state.results()[0].starts_with("[hub cluster]"));
        assert!(out.state.results()[0].ends_with("on hub"));
        assert!(out.state.results()[1].ends_with("on spoke"));
    }

    #[tokio::test]
    async fn test_denied_script_is_not_executed() {
        let executor = Arc::new(RecordingExecutor::default());
        let node = ExecuteNode::new(executor.clone()).with_approver(Arc::new(HubOnly));
        let state = SessionState::new("issue", ["runbooks"]).with_commands(
            vec!["oc get mcl".to_string()],
            vec!["oc delete pod klusterlet-0".to_string()],
        );
        let model = ModelConfig::new("m");
        let policy = WorkflowPolicy::default();
        let out = node.run(&state, &ctx(&model, &policy)).await.unwrap();

        assert_eq!(*executor.scripts.lock().unwrap(), vec!["oc get mcl".to_string()]);
        let results = out.state.results();
        assert_eq!(results.len(), 2);
        assert!(results[1].starts_with("[spoke cluster]"));
        assert!(results[1].contains("command rejected: spoke changes need a change window"));
        assert!(out.termination.is_none());
    }
}
