//! 基于 LlmClient 的 Generator 实现
//!
//! 每种调用一个 system prompt，要求模型输出 JSON；解析时兼容 ```json 代码块与裸 JSON。
//! 所有调用先经过 Pacer 节流，再受 request_timeout 约束。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::core::{GeneratorError, RelevanceScore};
use crate::generator::{
    AnswerRequest, AnswerResponse, GradeRequest, Generator, ModelConfig, Pacer, PlanRequest,
    PlanResponse, QueryRewriteRequest, ReplanRequest, ReplanResponse,
};
use crate::llm::{LlmClient, OpenAiClient};
use crate::memory::Message;
use crate::rag::GradingMode;

/// 按 ModelConfig 构造 LLM 客户端
pub type ClientFactory = Arc<dyn Fn(&ModelConfig) -> Arc<dyn LlmClient> + Send + Sync>;

const PLAN_PROMPT: &str = "You are a senior operations engineer troubleshooting a cluster management product. \
Use the reference documents to analyse the issue and propose a step-by-step plan. \
Commands for the hub cluster go to hub_commands, commands for managed clusters go to spoke_commands. \
Only propose read-only commands. Reply with JSON: \
{\"plan\": \"...\", \"reasoning\": \"...\", \"hub_commands\": [\"...\"], \"spoke_commands\": [\"...\"]}";

const REPLAN_PROMPT: &str = "You are a senior operations engineer continuing a troubleshooting session. \
Given the previous plan and the outputs of the commands it ran, update the plan. \
Set termination to true when the root cause is found or nothing else can be checked. \
Reply with JSON: {\"plan\": \"...\", \"reasoning\": \"...\", \"hub_commands\": [\"...\"], \
\"spoke_commands\": [\"...\"], \"termination\": false}";

const ANSWER_PROMPT: &str = "You answer questions about a cluster management product. \
Ground the answer in the reference documents; say so when they do not cover the question. \
Reply with JSON: {\"response\": \"...\", \"reasoning\": \"...\"}";

const REWRITE_PROMPT: &str = "Rewrite the user's issue into a short search query for the product documentation. \
If the issue has nothing to do with the product, return an empty query. \
Reply with JSON: {\"query\": \"...\"}";

const BINARY_GRADE_PROMPT: &str = "Decide whether the document is relevant to the query. \
Reply with JSON: {\"score\": \"yes\"} or {\"score\": \"no\"}";

const GRADED_GRADE_PROMPT: &str = "Rate how relevant the document is to the query on a scale from 0 to 10. \
Reply with JSON: {\"score\": 7}";

/// LLM 驱动的 Generator
pub struct LlmGenerator {
    factory: ClientFactory,
    pacer: Pacer,
    request_timeout: Duration,
    /// 领域注意事项，拼到每个 system prompt 之后
    notices: String,
}

impl LlmGenerator {
    /// 默认使用 OpenAI 兼容客户端
    pub fn new(request_timeout: Duration) -> Self {
        let factory: ClientFactory = Arc::new(|model: &ModelConfig| {
            Arc::new(OpenAiClient::new(
                model.api_base.as_deref(),
                &model.model,
                model.api_key.as_deref(),
            )) as Arc<dyn LlmClient>
        });
        Self::with_factory(factory, request_timeout)
    }

    pub fn with_factory(factory: ClientFactory, request_timeout: Duration) -> Self {
        Self {
            factory,
            pacer: Pacer::disabled(),
            request_timeout,
            notices: String::new(),
        }
    }

    /// 所有调用共用一个客户端（测试、单模型部署）
    pub fn with_client(client: Arc<dyn LlmClient>, request_timeout: Duration) -> Self {
        Self::with_factory(Arc::new(move |_: &ModelConfig| client.clone()), request_timeout)
    }

    pub fn with_pacer(mut self, pacer: Pacer) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_notices(mut self, notices: impl Into<String>) -> Self {
        self.notices = notices.into();
        self
    }

    fn system_prompt(&self, base: &str) -> String {
        if self.notices.trim().is_empty() {
            base.to_string()
        } else {
            format!("{}\n\nNotices:\n{}", base, self.notices.trim())
        }
    }

    async fn call(
        &self,
        model: &ModelConfig,
        system: &str,
        history: &[Message],
        user: String,
    ) -> Result<String, GeneratorError> {
        let client = (self.factory)(model);
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(self.system_prompt(system)));
        messages.extend(history.iter().cloned());
        messages.push(Message::user(user));

        self.pacer.wait().await;
        let started = std::time::Instant::now();
        let reply = tokio::time::timeout(self.request_timeout, client.complete(&messages))
            .await
            .map_err(|_| GeneratorError::Timeout(self.request_timeout))??;
        tracing::debug!(
            model = %model.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            reply_len = reply.len(),
            "generator call finished"
        );
        Ok(reply)
    }
}

fn render_documents(documents: &[String]) -> String {
    if documents.is_empty() {
        return "(no reference documents)".to_string();
    }
    documents
        .iter()
        .enumerate()
        .map(|(i, d)| format!("[{}] {}", i + 1, d))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_results(results: &[String]) -> String {
    if results.is_empty() {
        "(no command output)".to_string()
    } else {
        results.join("\n")
    }
}

/// 从模型输出中截取 JSON 片段（```json 代码块或首尾花括号之间）
pub(crate) fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

fn parse_json<T: for<'de> Deserialize<'de>>(output: &str) -> Result<T, GeneratorError> {
    let json_str = extract_json(output)
        .ok_or_else(|| GeneratorError::Parse(format!("no JSON object in: {}", output.trim())))?;
    serde_json::from_str(json_str).map_err(|e| GeneratorError::Parse(format!("{}: {}", e, json_str)))
}

/// 字符串或字符串数组都接受；字符串按行拆分
fn flexible_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let items = match value {
        Value::Null => Vec::new(),
        Value::String(s) => s.lines().map(str::to_string).collect(),
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        other => vec![other.to_string()],
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// true / "true" / "yes" 都视为真
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "1"),
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

#[derive(Debug, Deserialize)]
struct PlanPayload {
    #[serde(default)]
    plan: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default, deserialize_with = "flexible_list")]
    hub_commands: Vec<String>,
    #[serde(default, deserialize_with = "flexible_list")]
    spoke_commands: Vec<String>,
    #[serde(default, alias = "terminate", deserialize_with = "flexible_bool")]
    termination: bool,
}

#[derive(Debug, Deserialize)]
struct AnswerPayload {
    #[serde(default)]
    response: String,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct QueryPayload {
    #[serde(default)]
    query: String,
}

#[derive(Debug, Deserialize)]
struct GradePayload {
    score: Value,
}

/// 评分输出解析：二元模式看是否以 yes 开头，分级模式取 0-10 的整数
fn parse_grade(output: &str, mode: GradingMode) -> Result<RelevanceScore, GeneratorError> {
    let raw = match parse_json::<GradePayload>(output) {
        Ok(payload) => payload.score,
        Err(_) => Value::String(output.trim().to_string()),
    };
    match mode {
        GradingMode::Binary => {
            let text = match &raw {
                Value::String(s) => s.trim().to_lowercase(),
                Value::Bool(b) => b.to_string(),
                other => other.to_string(),
            };
            Ok(RelevanceScore::Binary(
                text.starts_with("yes") || text == "true",
            ))
        }
        GradingMode::Graded { .. } => {
            let number = match &raw {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .ok_or_else(|| GeneratorError::Parse(format!("not a relevance score: {}", raw)))?;
            Ok(RelevanceScore::Graded(number.round().clamp(0.0, 10.0) as u8))
        }
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn plan(
        &self,
        model: &ModelConfig,
        request: PlanRequest<'_>,
    ) -> Result<PlanResponse, GeneratorError> {
        let user = format!(
            "Issue:\n{}\n\nReference documents:\n{}",
            request.issue,
            render_documents(request.documents)
        );
        let reply = self.call(model, PLAN_PROMPT, &[], user).await?;
        let payload: PlanPayload = parse_json(&reply)?;
        Ok(PlanResponse {
            plan: payload.plan,
            reasoning: payload.reasoning,
            hub_commands: payload.hub_commands,
            spoke_commands: payload.spoke_commands,
        })
    }

    async fn replan(
        &self,
        model: &ModelConfig,
        request: ReplanRequest<'_>,
    ) -> Result<ReplanResponse, GeneratorError> {
        let user = format!(
            "Issue:\n{}\n\nPrevious plan:\n{}\n\nCommand outputs:\n{}\n\nReference documents:\n{}",
            request.issue,
            request.previous_plan,
            render_results(request.previous_results),
            render_documents(request.documents)
        );
        let reply = self.call(model, REPLAN_PROMPT, &[], user).await?;
        let payload: PlanPayload = parse_json(&reply)?;
        Ok(ReplanResponse {
            plan: payload.plan,
            reasoning: payload.reasoning,
            hub_commands: payload.hub_commands,
            spoke_commands: payload.spoke_commands,
            terminate: payload.termination,
        })
    }

    async fn answer(
        &self,
        model: &ModelConfig,
        request: AnswerRequest<'_>,
    ) -> Result<AnswerResponse, GeneratorError> {
        let mut user = format!(
            "Question:\n{}\n\nReference documents:\n{}",
            request.issue,
            render_documents(request.documents)
        );
        if let Some(previous) = request.previous_answer {
            user.push_str(&format!("\n\nPrevious answer:\n{}", previous));
        }
        if let Some(feedback) = request.feedback {
            user.push_str(&format!("\n\nUser feedback:\n{}", feedback));
        }
        let reply = self.call(model, ANSWER_PROMPT, request.history, user).await?;
        match parse_json::<AnswerPayload>(&reply) {
            Ok(payload) => Ok(AnswerResponse {
                response: payload.response,
                reasoning: payload.reasoning,
            }),
            // 模型没按格式输出时，整段回复当作回答
            Err(_) => Ok(AnswerResponse {
                response: reply.trim().to_string(),
                reasoning: String::new(),
            }),
        }
    }

    async fn rewrite_query(
        &self,
        model: &ModelConfig,
        request: QueryRewriteRequest<'_>,
    ) -> Result<String, GeneratorError> {
        let mut user = format!("Issue:\n{}", request.issue);
        if let Some(plan) = request.previous_plan {
            user.push_str(&format!("\n\nPrevious plan:\n{}", plan));
        }
        if !request.previous_results.is_empty() {
            user.push_str(&format!(
                "\n\nCommand outputs:\n{}",
                render_results(request.previous_results)
            ));
        }
        if let Some(rejected) = request.rejected_query {
            user.push_str(&format!(
                "\n\nThe query \"{}\" found no useful documents, use different wording.",
                rejected
            ));
        }
        let reply = self.call(model, REWRITE_PROMPT, &[], user).await?;
        let query = match parse_json::<QueryPayload>(&reply) {
            Ok(payload) => payload.query,
            Err(_) => reply,
        };
        Ok(query.trim().to_string())
    }

    async fn grade(
        &self,
        model: &ModelConfig,
        request: GradeRequest<'_>,
    ) -> Result<RelevanceScore, GeneratorError> {
        let system = match request.mode {
            GradingMode::Binary => BINARY_GRADE_PROMPT,
            GradingMode::Graded { .. } => GRADED_GRADE_PROMPT,
        };
        let user = format!("Query:\n{}\n\nDocument:\n{}", request.query, request.document);
        let reply = self.call(model, system, &[], user).await?;
        parse_grade(&reply, request.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::memory::Role;

    fn generator(replies: Vec<&str>) -> (LlmGenerator, Arc<ScriptedLlmClient>) {
        let client = Arc::new(ScriptedLlmClient::new(replies));
        let generator = LlmGenerator::with_client(client.clone(), Duration::from_secs(5));
        (generator, client)
    }

    fn model() -> ModelConfig {
        ModelConfig::new("test-model")
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("sure: {\"a\":1} done"), Some("{\"a\":1}"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[tokio::test]
    async fn test_plan_parses_fenced_json() {
        let (generator, client) = generator(vec![
            "```json\n{\"plan\": \"check pods\", \"reasoning\": \"r\", \"hub_commands\": [\"oc get pods\"], \"spoke_commands\": \"kubectl get nodes\\nkubectl get ns\"}\n```",
        ]);
        let docs = vec!["doc one".to_string()];
        let out = generator
            .plan(&model(), PlanRequest { issue: "pods crash", documents: &docs })
            .await
            .unwrap();
        assert_eq!(out.plan, "check pods");
        assert_eq!(out.hub_commands, vec!["oc get pods"]);
        assert_eq!(out.spoke_commands, vec!["kubectl get nodes", "kubectl get ns"]);

        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0][0].role, Role::System);
        assert!(requests[0][1].content.contains("doc one"));
    }

    #[tokio::test]
    async fn test_replan_reads_termination_flag() {
        let (generator, _) = generator(vec![
            "{\"plan\": \"done\", \"reasoning\": \"root cause found\", \"termination\": \"true\"}",
        ]);
        let out = generator
            .replan(
                &model(),
                ReplanRequest {
                    issue: "i",
                    documents: &[],
                    previous_plan: "p",
                    previous_results: &[],
                },
            )
            .await
            .unwrap();
        assert!(out.terminate);
        assert!(out.hub_commands.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_plan_is_parse_error() {
        let (generator, _) = generator(vec!["I cannot help"]);
        let err = generator
            .plan(&model(), PlanRequest { issue: "i", documents: &[] })
            .await
            .unwrap_err();
        assert!(matches!(err, GeneratorError::Parse(_)));
    }

    #[tokio::test]
    async fn test_answer_falls_back_to_raw_reply() {
        let (generator, client) = generator(vec!["plain text answer"]);
        let history = vec![Message::user("earlier"), Message::assistant("reply")];
        let out = generator
            .answer(
                &model(),
                AnswerRequest {
                    issue: "q",
                    documents: &[],
                    previous_answer: None,
                    feedback: Some("be brief"),
                    history: &history,
                },
            )
            .await
            .unwrap();
        assert_eq!(out.response, "plain text answer");
        let sent = &client.requests()[0];
        assert_eq!(sent.len(), 4);
        assert!(sent[3].content.contains("be brief"));
    }

    #[tokio::test]
    async fn test_rewrite_query_mentions_rejected_query() {
        let (generator, client) = generator(vec!["{\"query\": \"  etcd backup  \"}"]);
        let query = generator
            .rewrite_query(
                &model(),
                QueryRewriteRequest {
                    issue: "i",
                    previous_plan: None,
                    previous_results: &[],
                    rejected_query: Some("old words"),
                },
            )
            .await
            .unwrap();
        assert_eq!(query, "etcd backup");
        assert!(client.requests()[0][1].content.contains("old words"));
    }

    #[tokio::test]
    async fn test_grade_modes() {
        let (generator, _) = generator(vec!["{\"score\": \"yes\"}", "{\"score\": 12}", "no"]);
        let binary = GradeRequest { query: "q", document: "d", mode: GradingMode::Binary };
        let graded = GradeRequest {
            query: "q",
            document: "d",
            mode: GradingMode::Graded { cutoff: 5 },
        };
        assert_eq!(
            generator.grade(&model(), binary).await.unwrap(),
            RelevanceScore::Binary(true)
        );
        assert_eq!(
            generator.grade(&model(), graded).await.unwrap(),
            RelevanceScore::Graded(10)
        );
        assert_eq!(
            generator.grade(&model(), binary).await.unwrap(),
            RelevanceScore::Binary(false)
        );
    }

    #[tokio::test]
    async fn test_llm_failure_propagates() {
        let (generator, _) = generator(vec![]);
        let err = generator
            .plan(&model(), PlanRequest { issue: "i", documents: &[] })
            .await
            .unwrap_err();
        assert!(matches!(err, GeneratorError::Llm(_)));
    }
}
