//! 会话状态与检索数据模型
//!
//! SessionState 是状态机在节点间传递的不可变值：字段私有，只能通过消费 self 的 with_* 方法
//! 得到新值。节点拿到的是 `&SessionState`，因此同一个输入状态可以安全地重放。

use serde::{Deserialize, Serialize};

use crate::memory::Message;

/// 检索候选的来源信息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateMetadata {
    pub doc_id: String,
    /// 文档来源标识（如 runbooks-2.12）
    pub source: String,
    pub filename: String,
    pub content_hash: String,
}

/// 单次检索得到的候选文本块，不做持久化
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub text: String,
    /// 向量相似度
    pub similarity: f32,
    /// 当前排序分数：重排前等于 similarity，重排后为重排分数
    pub score: f32,
    pub metadata: CandidateMetadata,
}

impl Candidate {
    pub fn new(text: impl Into<String>, similarity: f32, metadata: CandidateMetadata) -> Self {
        Self {
            text: text.into(),
            similarity,
            score: similarity,
            metadata,
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }
}

/// 相关性分数：二元（yes/no）或 0–10 分级
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelevanceScore {
    Binary(bool),
    Graded(u8),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelevanceVerdict {
    pub candidate: Candidate,
    pub score: RelevanceScore,
    pub keep: bool,
}

/// 状态机在节点之间传递的会话状态
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionState {
    sources: Vec<String>,
    issue: String,
    query: String,
    plan: String,
    results: Vec<String>,
    history: Vec<Message>,
    documents: Vec<String>,
    document_names: Vec<String>,
    reasoning: String,
    hub_commands: Vec<String>,
    spoke_commands: Vec<String>,
    retrieval_attempts: u32,
    evidence_useful: bool,
    terminated: bool,
}

impl SessionState {
    /// 新会话：来源按首次出现顺序去重
    pub fn new<I, S>(issue: impl Into<String>, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for source in sources {
            let source = source.into();
            let source = source.trim().to_string();
            if !source.is_empty() && !unique.contains(&source) {
                unique.push(source);
            }
        }
        Self {
            sources: unique,
            issue: issue.into(),
            evidence_useful: true,
            ..Default::default()
        }
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn issue(&self) -> &str {
        &self.issue
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// 计划（诊断变体）或回答（RAG 变体）
    pub fn plan(&self) -> &str {
        &self.plan
    }

    pub fn results(&self) -> &[String] {
        &self.results
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn documents(&self) -> &[String] {
        &self.documents
    }

    pub fn document_names(&self) -> &[String] {
        &self.document_names
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn hub_commands(&self) -> &[String] {
        &self.hub_commands
    }

    pub fn spoke_commands(&self) -> &[String] {
        &self.spoke_commands
    }

    pub fn retrieval_attempts(&self) -> u32 {
        self.retrieval_attempts
    }

    pub fn evidence_useful(&self) -> bool {
        self.evidence_useful
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn has_plan(&self) -> bool {
        !self.plan.trim().is_empty()
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = plan.into();
        self
    }

    pub fn with_results(mut self, results: Vec<String>) -> Self {
        self.results = results;
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_commands(mut self, hub: Vec<String>, spoke: Vec<String>) -> Self {
        self.hub_commands = hub;
        self.spoke_commands = spoke;
        self
    }

    /// 写入一轮检索结果：文本与来源文件名一一对应
    pub fn with_evidence(mut self, candidates: &[Candidate]) -> Self {
        self.documents = candidates.iter().map(|c| c.text.clone()).collect();
        self.document_names = candidates
            .iter()
            .map(|c| c.metadata.filename.clone())
            .collect();
        self
    }

    pub fn with_evidence_useful(mut self, useful: bool) -> Self {
        self.evidence_useful = useful;
        self
    }

    /// 检索次数只增不减
    pub fn record_retrieval(mut self) -> Self {
        self.retrieval_attempts = self.retrieval_attempts.saturating_add(1);
        self
    }

    /// 终止会话并写入兜底内容；终止后不可恢复
    pub fn terminate(mut self, plan: impl Into<String>, reasoning: impl Into<String>) -> Self {
        self.plan = plan.into();
        self.reasoning = reasoning.into();
        self.terminated = true;
        self
    }

    /// 终止但保留当前计划与推理
    pub fn finish(mut self) -> Self {
        self.terminated = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(text: &str, file: &str) -> Candidate {
        Candidate::new(
            text,
            0.8,
            CandidateMetadata {
                doc_id: file.to_string(),
                source: "runbooks".to_string(),
                filename: file.to_string(),
                content_hash: "h".to_string(),
            },
        )
    }

    #[test]
    fn test_new_dedups_sources_in_order() {
        let state = SessionState::new("issue", ["b", "a", "b", " ", "a"]);
        assert_eq!(state.sources(), &["b".to_string(), "a".to_string()]);
        assert!(!state.is_terminated());
        assert_eq!(state.retrieval_attempts(), 0);
    }

    #[test]
    fn test_with_methods_leave_original_untouched() {
        let original = SessionState::new("cluster unknown", ["runbooks"]);
        let next = original
            .clone()
            .with_query("klusterlet lease")
            .with_evidence(&[candidate("doc text", "cluster.md")])
            .record_retrieval();

        assert_eq!(original.query(), "");
        assert!(original.documents().is_empty());
        assert_eq!(next.documents(), &["doc text".to_string()]);
        assert_eq!(next.document_names(), &["cluster.md".to_string()]);
        assert_eq!(next.retrieval_attempts(), 1);
    }

    #[test]
    fn test_terminate_sets_fallback() {
        let state = SessionState::new("q", ["s"]).terminate("none", "No similar docs are found.");
        assert!(state.is_terminated());
        assert_eq!(state.plan(), "none");
        assert_eq!(state.reasoning(), "No similar docs are found.");
    }
}
