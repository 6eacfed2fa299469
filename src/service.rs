//! 问答 / 排障服务
//!
//! 把编排器与会话存储接起来：新会话落库，老会话从存储还原计划、执行结果与对话历史，
//! 每次运行后追加一个步骤。输入错误直接返回调用方，其余终止路径都返回完整响应。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AppConfig, RerankerKind};
use crate::core::{RetrievalError, SessionState, WorkflowError};
use crate::generator::{Generator, LlmGenerator, ModelConfig, Pacer};
use crate::llm::create_embedder_from_config;
use crate::memory::ConversationMemory;
use crate::rag::{
    Document, HttpReranker, IndexParams, InMemoryVectorStore, LexicalReranker, RelevanceGrader,
    Reranker, Retriever, RetrieverConfig, VectorStore,
};
use crate::storage::{
    NewStep, SessionContext, SessionKind, SessionRecord, SessionStore, StepRecord, StoreError,
};
use crate::tools::ShellExecutor;
use crate::workflow::{NodeKind, Orchestrator, Termination, WorkflowBuilder, WorkflowOutcome};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// 为空时新建会话
    #[serde(default)]
    pub session_id: Option<String>,
    pub query: String,
    /// 仅新会话使用；缺省时取服务默认值
    #[serde(default)]
    pub context: Option<SessionContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub step_id: String,
    pub response: String,
    pub reasoning: String,
    pub referenced_docs: Vec<String>,
    pub termination: Termination,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnoseRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    /// 新会话必填
    #[serde(default)]
    pub issue: String,
    /// 继续排障时，上一轮计划的执行结果
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default)]
    pub context: Option<SessionContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisResponse {
    pub session_id: String,
    pub step_id: String,
    pub plan: String,
    pub reasoning: String,
    pub hub_commands: Vec<String>,
    pub spoke_commands: Vec<String>,
    pub referenced_docs: Vec<String>,
    pub results: Vec<String>,
    pub termination: Termination,
    pub steps: usize,
}

pub struct TroubleshootService {
    store: Arc<dyn SessionStore>,
    rag: Orchestrator,
    diagnosis: Orchestrator,
    defaults: SessionContext,
    max_history_turns: usize,
}

impl TroubleshootService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        rag: Orchestrator,
        diagnosis: Orchestrator,
        defaults: SessionContext,
    ) -> Self {
        Self {
            store,
            rag,
            diagnosis,
            defaults,
            max_history_turns: 20,
        }
    }

    pub fn with_max_history_turns(mut self, turns: usize) -> Self {
        self.max_history_turns = turns;
        self
    }

    async fn open_session(
        &self,
        kind: SessionKind,
        session_id: Option<&str>,
        issue: &str,
        context: Option<SessionContext>,
    ) -> Result<(SessionRecord, Vec<StepRecord>), ServiceError> {
        match session_id.filter(|id| !id.trim().is_empty()) {
            None => {
                if issue.trim().is_empty() {
                    return Err(ServiceError::InvalidInput("the user inputs are required".to_string()));
                }
                let context = context.unwrap_or_else(|| self.defaults.clone());
                let session = self.store.create_session(kind, issue.trim(), &context).await?;
                Ok((session, Vec::new()))
            }
            Some(id) => {
                let session = self
                    .store
                    .get_session(id)
                    .await?
                    .ok_or_else(|| ServiceError::NotFound(format!("session {}", id)))?;
                if session.kind != kind {
                    return Err(ServiceError::InvalidInput(format!(
                        "session {} is a {} session",
                        id,
                        session.kind.as_str()
                    )));
                }
                let steps = self.store.list_steps(id).await?;
                Ok((session, steps))
            }
        }
    }

    /// 输入错误转为 ServiceError，其余终止原因照常返回
    fn check_outcome(outcome: &WorkflowOutcome) -> Result<(), ServiceError> {
        if let Termination::InvalidInput { reason } = &outcome.termination {
            return Err(ServiceError::InvalidInput(reason.clone()));
        }
        if !outcome.termination.is_graceful() {
            tracing::warn!(termination = ?outcome.termination, "workflow ended abnormally");
        }
        Ok(())
    }

    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ServiceError> {
        if request.query.trim().is_empty() {
            return Err(ServiceError::InvalidInput("the user inputs are required".to_string()));
        }
        let (session, steps) = self
            .open_session(
                SessionKind::Chat,
                request.session_id.as_deref(),
                &request.query,
                request.context,
            )
            .await?;

        let mut memory = ConversationMemory::new(self.max_history_turns);
        for step in &steps {
            memory.push_turn(step.query.clone(), step.plan.clone());
        }
        let state = SessionState::new(request.query.trim(), session.context.sources.clone())
            .with_history(memory.into_messages());

        let outcome = self.rag.run(state, &session.context.model).await;
        Self::check_outcome(&outcome)?;
        let state = &outcome.state;

        let step = self
            .store
            .append_step(
                &session.id,
                NewStep {
                    query: request.query.trim().to_string(),
                    plan: state.plan().to_string(),
                    reasoning: state.reasoning().to_string(),
                    referenced_docs: state.document_names().to_vec(),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(
            session_id = %session.id,
            step_id = %step.id,
            termination = ?outcome.termination,
            "chat step stored"
        );

        Ok(ChatResponse {
            session_id: session.id,
            step_id: step.id,
            response: step.plan,
            reasoning: step.reasoning,
            referenced_docs: step.referenced_docs,
            termination: outcome.termination,
        })
    }

    /// 新会话从 Plan 开始；继续排障时带上上一轮计划与用户提供的执行结果，从 Replan 开始
    pub async fn diagnose(&self, request: DiagnoseRequest) -> Result<DiagnosisResponse, ServiceError> {
        let (session, steps) = self
            .open_session(
                SessionKind::Diagnosis,
                request.session_id.as_deref(),
                &request.issue,
                request.context,
            )
            .await?;

        let base = SessionState::new(session.issue.clone(), session.context.sources.clone());
        let outcome = match steps.last() {
            None => self.diagnosis.run(base, &session.context.model).await,
            Some(previous) => {
                let results = if request.results.is_empty() {
                    previous.results.clone()
                } else {
                    request.results.clone()
                };
                let state = base
                    .with_plan(previous.plan.clone())
                    .with_results(results)
                    .with_commands(previous.hub_commands.clone(), previous.spoke_commands.clone());
                self.diagnosis
                    .run_from(NodeKind::Replan, state, &session.context.model)
                    .await
            }
        };
        Self::check_outcome(&outcome)?;
        let state = &outcome.state;

        let step = self
            .store
            .append_step(
                &session.id,
                NewStep {
                    query: request.results.join("\n"),
                    plan: state.plan().to_string(),
                    reasoning: state.reasoning().to_string(),
                    referenced_docs: state.document_names().to_vec(),
                    results: state.results().to_vec(),
                    hub_commands: state.hub_commands().to_vec(),
                    spoke_commands: state.spoke_commands().to_vec(),
                },
            )
            .await?;
        tracing::info!(
            session_id = %session.id,
            step_id = %step.id,
            steps = outcome.steps,
            termination = ?outcome.termination,
            "diagnosis step stored"
        );

        Ok(DiagnosisResponse {
            session_id: session.id,
            step_id: step.id,
            plan: step.plan,
            reasoning: step.reasoning,
            hub_commands: step.hub_commands,
            spoke_commands: step.spoke_commands,
            referenced_docs: step.referenced_docs,
            results: step.results,
            termination: outcome.termination,
            steps: outcome.steps,
        })
    }

    pub async fn evaluate(
        &self,
        session_id: &str,
        step_id: &str,
        score: i32,
        feedback: Option<&str>,
    ) -> Result<(), ServiceError> {
        if self.store.get_session(session_id).await?.is_none() {
            return Err(ServiceError::NotFound(format!("session {}", session_id)));
        }
        match self.store.evaluate(session_id, step_id, score, feedback).await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(what)) => Err(ServiceError::NotFound(what)),
            Err(e) => Err(e.into()),
        }
    }
}

/// 按配置组装检索链路、Generator、命令执行器与会话存储
pub async fn build_service(
    config: &AppConfig,
    store: Arc<dyn SessionStore>,
    documents: Vec<Document>,
) -> Result<TroubleshootService, ServiceError> {
    if config.embedding.dims == 0 {
        return Err(ServiceError::InvalidInput(
            "embedding.dims must be greater than zero".to_string(),
        ));
    }
    let embedder = create_embedder_from_config(
        &config.embedding.provider,
        config.embedding.base_url.as_deref(),
        &config.embedding.model,
        config.llm.api_key.as_deref(),
        config.embedding.dims,
    );
    let vectors = InMemoryVectorStore::new(
        embedder,
        IndexParams {
            m: config.retrieval.m,
            ef_construction: config.retrieval.ef_construction,
        },
    );
    let mut chunks = 0;
    for document in documents {
        chunks += vectors.upsert(document).await?;
    }
    tracing::info!(chunks, "corpus indexed");

    let mut retriever = Retriever::new(Arc::new(vectors), RetrieverConfig::from(&config.retrieval));
    let reranker: Option<Arc<dyn Reranker>> = match config.retrieval.reranker {
        RerankerKind::None => None,
        RerankerKind::Lexical => Some(Arc::new(LexicalReranker)),
        RerankerKind::Http => {
            let endpoint = config.retrieval.rerank_endpoint.as_deref().ok_or_else(|| {
                ServiceError::InvalidInput("retrieval.rerank_endpoint is required".to_string())
            })?;
            Some(Arc::new(HttpReranker::new(
                endpoint,
                Duration::from_secs(config.retrieval.rerank_timeout_secs),
            )?))
        }
    };
    if let Some(reranker) = reranker {
        retriever = retriever.with_reranker(reranker);
    }

    let generator: Arc<dyn Generator> = Arc::new(
        LlmGenerator::new(Duration::from_secs(config.llm.timeouts.request)).with_pacer(Pacer::new(
            Duration::from_millis(config.generator.call_interval_ms),
        )),
    );
    let mut builder = WorkflowBuilder::from_config(config)
        .generator(generator.clone())
        .retriever(Arc::new(retriever))
        .executor(Arc::new(ShellExecutor::from_config(&config.executor)));
    if config.grading.enabled {
        builder = builder.grader(Arc::new(RelevanceGrader::from_config(generator, &config.grading)));
    }

    let defaults = SessionContext {
        sources: config.app.doc_sources.clone(),
        model: ModelConfig {
            model: config.llm.model.clone(),
            api_base: config.llm.base_url.clone(),
            api_key: config.llm.api_key.clone(),
        },
    };
    Ok(TroubleshootService::new(
        store,
        builder.build_rag()?,
        builder.build_diagnosis()?,
        defaults,
    )
    .with_max_history_turns(config.app.max_context_turns))
}
