//! Generator 契约：计划 / 重规划 / 回答 / 查询改写 / 相关性评分
//!
//! 每次调用都显式传入 ModelConfig（模型、端点、密钥），核心不内置全局默认，
//! 不同会话可以并发使用不同的模型配置。
//!
//! 重规划返回的 terminate 由 Generator 自己判断（模型对自身输出的启发式判断），
//! 编排器只读取这个信号，不重新推导。

pub mod llm;
pub mod pacing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{GeneratorError, RelevanceScore};
use crate::memory::Message;
use crate::rag::GradingMode;

pub use llm::LlmGenerator;
pub use pacing::Pacer;

/// 单次调用使用的模型配置
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub issue: &'a str,
    pub documents: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlanResponse {
    pub plan: String,
    pub reasoning: String,
    pub hub_commands: Vec<String>,
    pub spoke_commands: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplanRequest<'a> {
    pub issue: &'a str,
    pub documents: &'a [String],
    pub previous_plan: &'a str,
    pub previous_results: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplanResponse {
    pub plan: String,
    pub reasoning: String,
    pub hub_commands: Vec<String>,
    pub spoke_commands: Vec<String>,
    /// 排障是否结束
    pub terminate: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AnswerRequest<'a> {
    pub issue: &'a str,
    pub documents: &'a [String],
    pub previous_answer: Option<&'a str>,
    pub feedback: Option<&'a str>,
    pub history: &'a [Message],
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnswerResponse {
    pub response: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy)]
pub struct QueryRewriteRequest<'a> {
    pub issue: &'a str,
    pub previous_plan: Option<&'a str>,
    pub previous_results: &'a [String],
    /// 上一轮没有检索到有效证据的查询
    pub rejected_query: Option<&'a str>,
}

#[derive(Debug, Clone, Copy)]
pub struct GradeRequest<'a> {
    pub query: &'a str,
    pub document: &'a str,
    pub mode: GradingMode,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn plan(
        &self,
        model: &ModelConfig,
        request: PlanRequest<'_>,
    ) -> Result<PlanResponse, GeneratorError>;

    async fn replan(
        &self,
        model: &ModelConfig,
        request: ReplanRequest<'_>,
    ) -> Result<ReplanResponse, GeneratorError>;

    async fn answer(
        &self,
        model: &ModelConfig,
        request: AnswerRequest<'_>,
    ) -> Result<AnswerResponse, GeneratorError>;

    /// 改写检索查询；问题与产品无关时返回空字符串
    async fn rewrite_query(
        &self,
        model: &ModelConfig,
        request: QueryRewriteRequest<'_>,
    ) -> Result<String, GeneratorError>;

    async fn grade(
        &self,
        model: &ModelConfig,
        request: GradeRequest<'_>,
    ) -> Result<RelevanceScore, GeneratorError>;
}
