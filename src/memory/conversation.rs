//! 会话历史：多轮问答记录
//!
//! RAG 变体的 Generate 节点会把之前的问答轮次交给 Generator；历史过长时只保留最近 N 轮。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 有界会话历史：最多保留 max_turns 轮（每轮 user + assistant 两条）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
        }
    }

    /// 追加一轮问答；问题或回答为空的轮次不计入历史
    pub fn push_turn(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        let (question, answer) = (question.into(), answer.into());
        if question.trim().is_empty() || answer.trim().is_empty() {
            return;
        }
        self.messages.push(Message::user(question));
        self.messages.push(Message::assistant(answer));
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 超出 max_turns*2 时丢弃最旧的消息
    fn prune(&mut self) {
        let keep = self.max_turns * 2;
        if self.messages.len() > keep {
            self.messages.drain(..self.messages.len() - keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_turn_prunes_oldest() {
        let mut memory = ConversationMemory::new(2);
        memory.push_turn("q1", "a1");
        memory.push_turn("q2", "a2");
        memory.push_turn("q3", "a3");

        assert_eq!(memory.len(), 4);
        assert_eq!(memory.messages()[0], Message::user("q2"));
        assert_eq!(memory.messages()[3], Message::assistant("a3"));
    }

    #[test]
    fn test_blank_turns_are_skipped() {
        let mut memory = ConversationMemory::new(5);
        memory.push_turn("", "a1");
        memory.push_turn("q2", "  ");
        assert!(memory.is_empty());

        memory.push_turn("q3", "a3");
        assert_eq!(memory.into_messages().len(), 2);
    }

    #[test]
    fn test_zero_turns_keeps_nothing() {
        let mut memory = ConversationMemory::new(0);
        memory.push_turn("q1", "a1");
        assert!(memory.is_empty());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::assistant("ok")).unwrap();
        assert!(json.contains("\"assistant\""));
    }
}
