//! 脚本化 LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预置回复，并记录每次请求，便于断言 prompt 内容

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;

/// 脚本化客户端：回复队列耗尽后返回 ApiError
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 已收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        self.replies
            .lock()
            .map_err(|e| LlmError::ApiError(e.to_string()))?
            .pop_front()
            .ok_or_else(|| LlmError::ApiError("script exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_in_order_then_errors() {
        let client = ScriptedLlmClient::new(["one", "two"]);
        assert_eq!(client.complete(&[Message::user("a")]).await.unwrap(), "one");
        assert_eq!(client.complete(&[Message::user("b")]).await.unwrap(), "two");
        assert!(client.complete(&[Message::user("c")]).await.is_err());
        assert_eq!(client.requests().len(), 3);
    }
}
