//! 工作流构建器
//!
//! 显式注入协作者（Generator、检索器、评分器、命令执行器），按变体组装节点处理器。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::WorkflowError;
use crate::generator::Generator;
use crate::rag::{RelevanceGrader, Retriever};
use crate::tools::{approver_from_config, Approver, CommandExecutor};
use crate::workflow::engine::Orchestrator;
use crate::workflow::nodes::{
    EvidencePipeline, ExecuteNode, GenerateNode, PlanNode, ReplanNode, RetrieveNode,
    TransformNode,
};
use crate::workflow::query::QueryFormulator;
use crate::workflow::types::{WorkflowPolicy, WorkflowVariant};

/// 工作流构建器
#[derive(Clone, Default)]
pub struct WorkflowBuilder {
    policy: WorkflowPolicy,
    generator: Option<Arc<dyn Generator>>,
    retriever: Option<Arc<Retriever>>,
    grader: Option<Arc<RelevanceGrader>>,
    executor: Option<Arc<dyn CommandExecutor>>,
    approver: Option<Arc<dyn Approver>>,
    command_timeout: Option<Duration>,
}

impl WorkflowBuilder {
    pub fn new(policy: WorkflowPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// 从配置读取策略、命令超时与审批方式
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(WorkflowPolicy::from(&config.workflow))
            .command_timeout(Duration::from_secs(config.executor.timeout_secs))
            .approver(approver_from_config(&config.executor))
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn retriever(mut self, retriever: Arc<Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// 设置后每轮检索结果都要经过相关性评分
    pub fn grader(mut self, grader: Arc<RelevanceGrader>) -> Self {
        self.grader = Some(grader);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// 未设置时命令不经审批直接执行
    pub fn approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn retrieval_limit(mut self, limit: u32) -> Self {
        self.policy.retrieval_limit = limit;
        self
    }

    pub fn recursion_limit(mut self, limit: usize) -> Self {
        self.policy.recursion_limit = limit;
        self
    }

    #[allow(clippy::type_complexity)]
    fn parts(
        &self,
    ) -> Result<(Arc<dyn Generator>, Arc<QueryFormulator>, Arc<EvidencePipeline>), WorkflowError> {
        let generator = self
            .generator
            .clone()
            .ok_or_else(|| WorkflowError::InvalidConfiguration("generator is required".to_string()))?;
        let retriever = self
            .retriever
            .clone()
            .ok_or_else(|| WorkflowError::InvalidConfiguration("retriever is required".to_string()))?;
        let formulator = Arc::new(QueryFormulator::new(generator.clone()));
        let mut pipeline = EvidencePipeline::new(formulator.clone(), retriever);
        if let Some(grader) = &self.grader {
            pipeline = pipeline.with_grader(grader.clone());
        }
        Ok((generator, formulator, Arc::new(pipeline)))
    }

    /// transform -> retrieve -> generate
    pub fn build_rag(&self) -> Result<Orchestrator, WorkflowError> {
        let (generator, formulator, pipeline) = self.parts()?;
        let orchestrator = Orchestrator::new(WorkflowVariant::Rag, self.policy)
            .with_handler(Arc::new(TransformNode::new(formulator)))
            .with_handler(Arc::new(RetrieveNode::new(pipeline)))
            .with_handler(Arc::new(GenerateNode::new(generator)));
        orchestrator.validate()?;
        Ok(orchestrator)
    }

    /// plan -> execute -> replan
    pub fn build_diagnosis(&self) -> Result<Orchestrator, WorkflowError> {
        let (generator, _, pipeline) = self.parts()?;
        let executor = self
            .executor
            .clone()
            .ok_or_else(|| WorkflowError::InvalidConfiguration("executor is required".to_string()))?;
        let mut execute = ExecuteNode::new(executor);
        if let Some(timeout) = self.command_timeout {
            execute = execute.with_timeout(timeout);
        }
        if let Some(approver) = &self.approver {
            execute = execute.with_approver(approver.clone());
        }
        let orchestrator = Orchestrator::new(WorkflowVariant::Diagnosis, self.policy)
            .with_handler(Arc::new(PlanNode::new(pipeline.clone(), generator.clone())))
            .with_handler(Arc::new(execute))
            .with_handler(Arc::new(ReplanNode::new(pipeline, generator)));
        orchestrator.validate()?;
        Ok(orchestrator)
    }

    pub fn build(&self, variant: WorkflowVariant) -> Result<Orchestrator, WorkflowError> {
        match variant {
            WorkflowVariant::Rag => self.build_rag(),
            WorkflowVariant::Diagnosis => self.build_diagnosis(),
        }
    }
}
