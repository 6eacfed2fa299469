//! 会话与排障步骤持久化
//!
//! 编排器本身不持久化任何东西；服务层在每次运行后把步骤写入 SessionStore，
//! 下一轮再从存储中还原计划、执行结果与对话历史。

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::generator::ModelConfig;

pub use sqlite::SqliteSessionStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Chat,
    Diagnosis,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Chat => "chat",
            SessionKind::Diagnosis => "diagnosis",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "chat" => Some(SessionKind::Chat),
            "diagnosis" => Some(SessionKind::Diagnosis),
            _ => None,
        }
    }
}

/// 会话上下文：检索范围与模型配置，随会话保存
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub model: ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub kind: SessionKind,
    pub issue: String,
    pub context: SessionContext,
    pub created_at: DateTime<Utc>,
}

/// 待写入的步骤
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NewStep {
    /// 本轮的用户输入（追问、反馈或执行结果说明）
    pub query: String,
    /// 计划（排障）或回答（问答）
    pub plan: String,
    pub reasoning: String,
    pub referenced_docs: Vec<String>,
    pub results: Vec<String>,
    pub hub_commands: Vec<String>,
    pub spoke_commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub session_id: String,
    pub query: String,
    pub plan: String,
    pub reasoning: String,
    pub referenced_docs: Vec<String>,
    pub results: Vec<String>,
    pub hub_commands: Vec<String>,
    pub spoke_commands: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub session_id: String,
    pub step_id: String,
    pub score: i32,
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(
        &self,
        kind: SessionKind,
        issue: &str,
        context: &SessionContext,
    ) -> Result<SessionRecord, StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// 追加步骤；会话不存在时返回 NotFound
    async fn append_step(&self, session_id: &str, step: NewStep) -> Result<StepRecord, StoreError>;

    /// 覆盖已有步骤的内容（例如补写执行结果）
    async fn update_step(&self, step: &StepRecord) -> Result<(), StoreError>;

    /// 按写入顺序返回
    async fn list_steps(&self, session_id: &str) -> Result<Vec<StepRecord>, StoreError>;

    async fn evaluate(
        &self,
        session_id: &str,
        step_id: &str,
        score: i32,
        feedback: Option<&str>,
    ) -> Result<Evaluation, StoreError>;

    async fn list_evaluations(&self, session_id: &str) -> Result<Vec<Evaluation>, StoreError>;
}
