//! 向量库协作方
//!
//! VectorStore 是检索链路依赖的外部接口：upsert / delete / query，以及按来源列出、删除文档。
//! 来源过滤支持精确匹配与集合成员（in）两种语义，与向量检索是 AND 关系。
//!
//! InMemoryVectorStore 是进程内实现：upsert 时分块、嵌入并写入图索引。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::{Candidate, CandidateMetadata, RetrievalError};
use crate::llm::EmbeddingProvider;
use crate::rag::chunker::Chunker;
use crate::rag::index::{GraphIndex, IndexParams};

/// 待索引的文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source: String,
    pub filename: String,
    pub text: String,
    /// 未提供时按文本内容计算
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        filename: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            filename: filename.into(),
            text: text.into(),
            content_hash: None,
        }
    }

    pub fn hash(&self) -> String {
        self.content_hash
            .clone()
            .unwrap_or_else(|| content_hash(&self.text))
    }
}

/// 文本内容哈希（blake3，十六进制）
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// 已索引文档的摘要信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub id: String,
    pub name: String,
    pub hash: String,
}

/// 来源过滤
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceFilter {
    Exact(String),
    AnyOf(Vec<String>),
}

impl SourceFilter {
    pub fn matches(&self, source: &str) -> bool {
        match self {
            SourceFilter::Exact(s) => s == source,
            SourceFilter::AnyOf(list) => list.iter().any(|s| s == source),
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 写入（或替换同 id 的）文档，返回写入的块数
    async fn upsert(&self, document: Document) -> Result<usize, RetrievalError>;

    /// 删除文档的所有块，返回删除的块数
    async fn delete(&self, document_id: &str) -> Result<usize, RetrievalError>;

    /// 近似最近邻查询，结果按相似度降序；search_breadth 为查询时的候选宽度
    async fn query(
        &self,
        text: &str,
        filter: &SourceFilter,
        top_k: usize,
        search_breadth: usize,
    ) -> Result<Vec<Candidate>, RetrievalError>;

    /// 列出某来源下的文档（按文档 id 去重）
    async fn list_documents(&self, source: &str) -> Result<Vec<DocumentInfo>, RetrievalError>;

    /// 删除某来源下的全部文档，返回删除的文档数
    async fn delete_source(&self, source: &str) -> Result<usize, RetrievalError> {
        let docs = self.list_documents(source).await?;
        for doc in &docs {
            self.delete(&doc.id).await?;
            tracing::info!(doc = %doc.name, source, "doc deleted");
        }
        Ok(docs.len())
    }
}

#[derive(Debug, Clone)]
struct StoredChunk {
    text: String,
    metadata: CandidateMetadata,
}

#[derive(Debug, Default)]
struct Inner {
    index: GraphIndex,
    chunks: Vec<StoredChunk>,
    /// 文档 id -> 图节点 id
    by_doc: HashMap<String, Vec<usize>>,
}

pub struct InMemoryVectorStore {
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    inner: RwLock<Inner>,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, params: IndexParams) -> Self {
        Self {
            embedder,
            chunker: Chunker::default(),
            inner: RwLock::new(Inner {
                index: GraphIndex::new(params),
                ..Default::default()
            }),
        }
    }

    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    /// 存活块数
    pub async fn len(&self) -> usize {
        self.inner.read().await.index.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, document: Document) -> Result<usize, RetrievalError> {
        let hash = document.hash();
        let mut embedded = Vec::new();
        for chunk in self.chunker.chunk(&document.text) {
            let vector = self.embedder.embed(&chunk.text).await?;
            if vector.is_empty() {
                continue;
            }
            embedded.push((chunk.text, vector));
        }

        self.delete(&document.id).await?;

        let mut inner = self.inner.write().await;
        let mut ids = Vec::with_capacity(embedded.len());
        for (text, vector) in embedded {
            let id = inner.index.insert(vector);
            debug_assert_eq!(id, inner.chunks.len());
            inner.chunks.push(StoredChunk {
                text,
                metadata: CandidateMetadata {
                    doc_id: document.id.clone(),
                    source: document.source.clone(),
                    filename: document.filename.clone(),
                    content_hash: hash.clone(),
                },
            });
            ids.push(id);
        }
        let count = ids.len();
        inner.by_doc.insert(document.id.clone(), ids);
        tracing::debug!(doc = %document.filename, chunks = count, "doc indexed");
        Ok(count)
    }

    async fn delete(&self, document_id: &str) -> Result<usize, RetrievalError> {
        let mut inner = self.inner.write().await;
        let ids = inner.by_doc.remove(document_id).unwrap_or_default();
        for id in &ids {
            inner.index.remove(*id);
        }
        Ok(ids.len())
    }

    async fn query(
        &self,
        text: &str,
        filter: &SourceFilter,
        top_k: usize,
        search_breadth: usize,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let vector = self.embedder.embed(text).await?;
        if vector.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        let hits = inner.index.search(&vector, top_k, search_breadth, |id| {
            filter.matches(&inner.chunks[id].metadata.source)
        });
        Ok(hits
            .into_iter()
            .map(|(id, sim)| {
                let chunk = &inner.chunks[id];
                Candidate::new(chunk.text.clone(), sim, chunk.metadata.clone())
            })
            .collect())
    }

    async fn list_documents(&self, source: &str) -> Result<Vec<DocumentInfo>, RetrievalError> {
        let inner = self.inner.read().await;
        let mut docs: Vec<DocumentInfo> = Vec::new();
        for ids in inner.by_doc.values() {
            let Some(first) = ids.first() else {
                continue;
            };
            let meta = &inner.chunks[*first].metadata;
            if meta.source == source && !docs.iter().any(|d| d.id == meta.doc_id) {
                docs.push(DocumentInfo {
                    id: meta.doc_id.clone(),
                    name: meta.filename.clone(),
                    hash: meta.content_hash.clone(),
                });
            }
        }
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }
}
