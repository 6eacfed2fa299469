//! 检索链路：分词、分块、向量索引、文档存储、重排、检索器、相关性评分

pub mod chunker;
pub mod grader;
pub mod index;
pub mod rerank;
pub mod retriever;
pub mod store;
pub mod tokenizer;

pub use chunker::{Chunker, ChunkingConfig, TextChunk};
pub use grader::{GradingMode, RelevanceGrader};
pub use index::{GraphIndex, IndexParams};
pub use rerank::{HttpReranker, LexicalReranker, Reranker};
pub use retriever::{Retriever, RetrieverConfig};
pub use store::{Document, DocumentInfo, InMemoryVectorStore, SourceFilter, VectorStore};
