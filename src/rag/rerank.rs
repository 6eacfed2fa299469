//! 重排：对初筛候选按字面查询重新打分
//!
//! - LexicalReranker：按查询词覆盖率打分，不含任何查询词的候选得 0 分
//! - HttpReranker：调用交叉编码器服务的 /rerank 端点（text-embeddings-inference 格式），使用原始 logit 分数
//!
//! 重排只负责给候选写入 score，正分过滤、排序与截断由 Retriever 完成。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{Candidate, RetrievalError};
use crate::rag::tokenizer;

#[async_trait]
pub trait Reranker: Send + Sync {
    /// 返回与输入同序的候选，score 为重排分数
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>, RetrievalError>;
}

#[derive(Debug, Default, Clone)]
pub struct LexicalReranker;

#[async_trait]
impl Reranker for LexicalReranker {
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let query_terms = tokenizer::tokenize_to_set(query);
        Ok(candidates
            .into_iter()
            .map(|c| {
                let terms = tokenizer::tokenize_to_set(&c.text);
                let score = tokenizer::query_coverage(&query_terms, &terms);
                c.with_score(score)
            })
            .collect())
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: Vec<&'a str>,
    raw_scores: bool,
    truncate: bool,
}

#[derive(Deserialize)]
struct RerankHit {
    index: usize,
    score: f32,
}

pub struct HttpReranker {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReranker {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RetrievalError::Rerank(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let request = RerankRequest {
            query,
            texts: candidates.iter().map(|c| c.text.as_str()).collect(),
            raw_scores: true,
            truncate: true,
        };
        let hits: Vec<RerankHit> = self
            .client
            .post(format!("{}/rerank", self.endpoint))
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RetrievalError::Rerank(e.to_string()))?
            .json()
            .await
            .map_err(|e| RetrievalError::Rerank(e.to_string()))?;

        // 服务未返回的候选视为 0 分
        let mut scores = vec![0.0f32; candidates.len()];
        for hit in hits {
            if let Some(slot) = scores.get_mut(hit.index) {
                *slot = hit.score;
            }
        }
        Ok(candidates
            .into_iter()
            .zip(scores)
            .map(|(c, s)| c.with_score(s))
            .collect())
    }
}

/// 单次应答的本地 HTTP 服务，返回固定 JSON 与收到的原始请求
#[cfg(test)]
pub(crate) mod stub_server {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn content_length(head: &str) -> usize {
        head.lines()
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse().ok())
                    .flatten()
            })
            .next()
            .unwrap_or(0)
    }

    pub(crate) async fn serve_json_once(body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(end) = text.find("\r\n\r\n") {
                    if buf.len() >= end + 4 + content_length(&text[..end]) {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{}", addr), handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CandidateMetadata;

    fn candidate(text: &str) -> Candidate {
        Candidate::new(
            text,
            0.9,
            CandidateMetadata {
                doc_id: text.to_string(),
                source: "s".to_string(),
                filename: format!("{}.md", text.len()),
                content_hash: String::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_lexical_rerank_scores_by_query_coverage() {
        let reranked = LexicalReranker
            .rerank(
                "cluster unknown",
                vec![
                    candidate("the cluster status is unknown"),
                    candidate("addon is missing"),
                    candidate("cluster is ready"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(reranked.len(), 3);
        assert!((reranked[0].score - 1.0).abs() < f32::EPSILON);
        assert_eq!(reranked[1].score, 0.0);
        assert!((reranked[2].score - 0.5).abs() < f32::EPSILON);
        assert_eq!(reranked[0].similarity, 0.9);
    }

    #[tokio::test]
    async fn test_http_rerank_maps_scores_by_index() {
        let (endpoint, server) = stub_server::serve_json_once(
            r#"[{"index":2,"score":3.5},{"index":0,"score":-1.25},{"index":7,"score":9.0}]"#,
        )
        .await;
        let reranker = HttpReranker::new(format!("{}/", endpoint), Duration::from_secs(5)).unwrap();

        let reranked = reranker
            .rerank(
                "cluster unknown",
                vec![
                    candidate("first"),
                    candidate("second doc"),
                    candidate("third document"),
                ],
            )
            .await
            .unwrap();

        // 越界的 index 被忽略，未返回的候选为 0 分，顺序保持输入顺序
        let scores: Vec<f32> = reranked.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![-1.25, 0.0, 3.5]);
        assert_eq!(reranked[2].text, "third document");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /rerank "));
        assert!(request.contains(r#""texts":["first","second doc","third document"]"#));
        assert!(request.contains(r#""raw_scores":true"#));
    }

    #[tokio::test]
    async fn test_http_rerank_unreachable_endpoint_is_rerank_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let reranker = HttpReranker::new(format!("http://{}", addr), Duration::from_secs(2)).unwrap();
        let result = reranker.rerank("q", vec![candidate("a")]).await;
        assert!(matches!(result, Err(RetrievalError::Rerank(_))));
    }

    #[tokio::test]
    async fn test_http_rerank_skips_empty_input() {
        let reranker = HttpReranker::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        assert!(reranker.rerank("q", Vec::new()).await.unwrap().is_empty());
    }
}
