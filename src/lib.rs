//! Troubleshooter - 集群管理产品的运维问答与排障引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话状态、检索候选、错误分类与兜底
//! - **generator**: Generator 契约（计划 / 重规划 / 回答 / 查询改写 / 评分）与 LLM 实现
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 脚本化）、向量嵌入
//! - **memory**: 对话消息与有界对话历史
//! - **rag**: 分词、分块、图索引、文档存储、重排、检索器、相关性评分
//! - **workflow**: 迭代式检索-推理状态机（转移表、节点、编排器、构建器）
//! - **tools**: 排障命令执行（安全检查 + 超时）
//! - **storage**: 会话与步骤持久化（SQLite）
//! - **service**: 问答 / 排障 / 评价用例

pub mod config;
pub mod core;
pub mod generator;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod rag;
pub mod service;
pub mod storage;
pub mod tools;
pub mod workflow;

pub use service::{build_service, TroubleshootService};
pub use workflow::{Orchestrator, WorkflowBuilder, WorkflowOutcome};
