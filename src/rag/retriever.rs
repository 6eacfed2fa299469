//! 检索器：向量初筛 -> 相似度阈值 -> 重排 -> 正分过滤 -> 截断
//!
//! 检索范围（sources）是必填的，不存在“全库搜索”。每个阶段单独计时并记录日志。

use std::sync::Arc;
use std::time::Instant;

use crate::config::RetrievalSection;
use crate::core::{Candidate, RetrievalError};
use crate::rag::rerank::Reranker;
use crate::rag::store::{SourceFilter, VectorStore};

/// 检索参数
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieverConfig {
    pub similarity_cutoff: f32,
    pub top_k: usize,
    pub top_n: usize,
    pub ef_search: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self::from(&RetrievalSection::default())
    }
}

impl From<&RetrievalSection> for RetrieverConfig {
    fn from(section: &RetrievalSection) -> Self {
        Self {
            similarity_cutoff: section.similarity_cutoff,
            top_k: section.top_k,
            top_n: section.top_n,
            ef_search: section.ef_search,
        }
    }
}

pub struct Retriever {
    store: Arc<dyn VectorStore>,
    reranker: Option<Arc<dyn Reranker>>,
    config: RetrieverConfig,
}

impl Retriever {
    pub fn new(store: Arc<dyn VectorStore>, config: RetrieverConfig) -> Self {
        Self {
            store,
            reranker: None,
            config,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    /// 检索与 query 相关的候选，按分数降序（同分保持相似度名次）
    pub async fn retrieve(
        &self,
        query: &str,
        sources: &[String],
    ) -> Result<Vec<Candidate>, RetrievalError> {
        if sources.is_empty() {
            return Err(RetrievalError::MissingSources);
        }
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let filter = SourceFilter::AnyOf(sources.to_vec());
        let started = Instant::now();
        let candidates = self
            .store
            .query(query, &filter, self.config.top_k, self.config.ef_search)
            .await?;
        tracing::info!(
            query,
            ?sources,
            total = candidates.len(),
            top_k = self.config.top_k,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "docs retrieved"
        );
        log_candidates(&candidates);

        let filtered: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| c.similarity >= self.config.similarity_cutoff)
            .collect();
        tracing::info!(
            total = filtered.len(),
            cutoff = self.config.similarity_cutoff,
            "filtered nodes"
        );
        if filtered.is_empty() {
            return Ok(Vec::new());
        }

        let Some(reranker) = &self.reranker else {
            let mut kept = filtered;
            kept.truncate(self.config.top_n);
            return Ok(kept);
        };

        let started = Instant::now();
        let reranked = reranker.rerank(query, filtered).await?;
        let mut kept: Vec<Candidate> = reranked.into_iter().filter(|c| c.score > 0.0).collect();
        // sort_by 是稳定排序，同分时保留相似度名次
        kept.sort_by(|a, b| b.score.total_cmp(&a.score));
        kept.truncate(self.config.top_n);
        tracing::info!(
            total = kept.len(),
            top_n = self.config.top_n,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "docs reranked"
        );
        log_candidates(&kept);

        Ok(kept)
    }
}

fn log_candidates(candidates: &[Candidate]) {
    if tracing::enabled!(tracing::Level::DEBUG) {
        for c in candidates {
            tracing::debug!(score = c.score, file = %c.metadata.filename, "-- doc");
        }
    }
}
