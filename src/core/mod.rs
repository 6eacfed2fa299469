//! 核心数据与错误：会话状态、检索候选、相关性判定、错误分类与兜底

pub mod error;
pub mod recovery;
pub mod state;

pub use error::{GeneratorError, RetrievalError, ToolError, WorkflowError};
pub use recovery::RecoveryEngine;
pub use state::{Candidate, CandidateMetadata, RelevanceScore, RelevanceVerdict, SessionState};
