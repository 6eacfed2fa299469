//! 检索查询生成
//!
//! 第一轮（还没有计划 / 回答，也没有被否决的查询）直接用原始问题；之后由 Generator
//! 结合上一轮计划与执行结果改写，使后续检索针对执行暴露出的具体缺口。
//! 改写结果为空表示问题不在支持范围内，调用方应终止而不是拿空串去检索。

use std::sync::Arc;

use crate::core::{GeneratorError, SessionState};
use crate::generator::{Generator, ModelConfig, QueryRewriteRequest};

#[derive(Debug, Clone, Copy)]
pub struct FormulationInput<'a> {
    pub issue: &'a str,
    pub previous_plan: Option<&'a str>,
    pub previous_results: &'a [String],
    pub rejected_query: Option<&'a str>,
}

impl<'a> FormulationInput<'a> {
    pub fn from_state(state: &'a SessionState) -> Self {
        let rejected_query = (!state.evidence_useful() && !state.query().is_empty())
            .then(|| state.query());
        Self {
            issue: state.issue(),
            previous_plan: state.has_plan().then(|| state.plan()),
            previous_results: state.results(),
            rejected_query,
        }
    }

    fn is_first_round(&self) -> bool {
        self.previous_plan.is_none() && self.rejected_query.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Formulation {
    Query(String),
    /// 无法得到有效查询
    Exhausted,
}

pub struct QueryFormulator {
    generator: Arc<dyn Generator>,
}

impl QueryFormulator {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    pub async fn formulate(
        &self,
        input: FormulationInput<'_>,
        model: &ModelConfig,
    ) -> Result<Formulation, GeneratorError> {
        if input.is_first_round() {
            return Ok(normalize(input.issue));
        }
        let rewritten = self
            .generator
            .rewrite_query(
                model,
                QueryRewriteRequest {
                    issue: input.issue,
                    previous_plan: input.previous_plan,
                    previous_results: input.previous_results,
                    rejected_query: input.rejected_query,
                },
            )
            .await?;
        let formulation = normalize(&rewritten);
        tracing::debug!(issue = %input.issue, formulation = ?formulation, "query rewritten");
        Ok(formulation)
    }

    /// 检索零结果后的一次改写重试
    pub async fn reformulate(
        &self,
        issue: &str,
        query: &str,
        model: &ModelConfig,
    ) -> Result<Formulation, GeneratorError> {
        self.formulate(
            FormulationInput {
                issue,
                previous_plan: None,
                previous_results: &[],
                rejected_query: Some(query),
            },
            model,
        )
        .await
    }
}

/// 去掉首尾空白与引号；为空则视为无法检索
fn normalize(raw: &str) -> Formulation {
    let query = raw
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim();
    if query.is_empty() {
        Formulation::Exhausted
    } else {
        Formulation::Query(query.to_string())
    }
}
