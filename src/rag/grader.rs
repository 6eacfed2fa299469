//! 相关性评分：逐个候选调用 Generator 判断是否与查询相关
//!
//! 每个候选一次 Generator 调用，成本随候选数线性增长；设置 confident_score 后，
//! 重排分数不低于该值的候选直接保留，不再调用模型。
//! 评分与重排是两个独立阶段，可以单独使用，也可以串联。

use std::sync::Arc;

use crate::config::{GradingModeKind, GradingSection};
use crate::core::{Candidate, GeneratorError, RelevanceScore, RelevanceVerdict};
use crate::generator::{GradeRequest, Generator, ModelConfig};

/// 评分模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradingMode {
    /// yes / no，只保留 yes
    Binary,
    /// 0-10 分，保留 >= cutoff 的候选并按分数降序
    Graded { cutoff: u8 },
}

impl GradingMode {
    pub fn keeps(&self, score: RelevanceScore) -> bool {
        match (self, score) {
            (GradingMode::Binary, RelevanceScore::Binary(yes)) => yes,
            (GradingMode::Graded { cutoff }, RelevanceScore::Graded(grade)) => grade >= *cutoff,
            // 模式与分数类型不一致时按最严格处理
            _ => false,
        }
    }

    fn confident_score(&self) -> RelevanceScore {
        match self {
            GradingMode::Binary => RelevanceScore::Binary(true),
            GradingMode::Graded { .. } => RelevanceScore::Graded(10),
        }
    }
}

impl From<&GradingSection> for GradingMode {
    fn from(section: &GradingSection) -> Self {
        match section.mode {
            GradingModeKind::Binary => GradingMode::Binary,
            GradingModeKind::Graded => GradingMode::Graded {
                cutoff: section.cutoff.min(10),
            },
        }
    }
}

pub struct RelevanceGrader {
    generator: Arc<dyn Generator>,
    mode: GradingMode,
    confident_score: Option<f32>,
}

impl RelevanceGrader {
    pub fn new(generator: Arc<dyn Generator>, mode: GradingMode) -> Self {
        Self {
            generator,
            mode,
            confident_score: None,
        }
    }

    pub fn from_config(generator: Arc<dyn Generator>, section: &GradingSection) -> Self {
        let grader = Self::new(generator, GradingMode::from(section));
        match section.confident_score {
            Some(threshold) => grader.with_confident_score(threshold),
            None => grader,
        }
    }

    pub fn with_confident_score(mut self, threshold: f32) -> Self {
        self.confident_score = Some(threshold);
        self
    }

    pub fn mode(&self) -> GradingMode {
        self.mode
    }

    /// 对每个候选给出判定。分级模式下保留的判定按分数降序排在前面（同分保持输入顺序），
    /// 被丢弃的判定排在后面
    pub async fn grade(
        &self,
        candidates: &[Candidate],
        query: &str,
        model: &ModelConfig,
    ) -> Result<Vec<RelevanceVerdict>, GeneratorError> {
        let mut verdicts = Vec::with_capacity(candidates.len());
        let mut calls = 0usize;
        for candidate in candidates {
            let score = match self.confident_score {
                Some(threshold) if candidate.score >= threshold => self.mode.confident_score(),
                _ => {
                    calls += 1;
                    self.generator
                        .grade(
                            model,
                            GradeRequest {
                                query,
                                document: &candidate.text,
                                mode: self.mode,
                            },
                        )
                        .await?
                }
            };
            verdicts.push(RelevanceVerdict {
                candidate: candidate.clone(),
                score,
                keep: self.mode.keeps(score),
            });
        }

        if let GradingMode::Graded { .. } = self.mode {
            verdicts.sort_by(|a, b| b.keep.cmp(&a.keep).then_with(|| grade_of(b).cmp(&grade_of(a))));
        }

        tracing::debug!(
            candidates = candidates.len(),
            kept = verdicts.iter().filter(|v| v.keep).count(),
            generator_calls = calls,
            "relevance grading finished"
        );
        Ok(verdicts)
    }

    /// 只返回保留下来的候选
    pub async fn filter(
        &self,
        candidates: &[Candidate],
        query: &str,
        model: &ModelConfig,
    ) -> Result<Vec<Candidate>, GeneratorError> {
        Ok(self
            .grade(candidates, query, model)
            .await?
            .into_iter()
            .filter(|v| v.keep)
            .map(|v| v.candidate)
            .collect())
    }
}

fn grade_of(verdict: &RelevanceVerdict) -> u8 {
    match verdict.score {
        RelevanceScore::Graded(g) => g,
        RelevanceScore::Binary(true) => 10,
        RelevanceScore::Binary(false) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::core::CandidateMetadata;
    use crate::generator::{
        AnswerRequest, AnswerResponse, PlanRequest, PlanResponse, QueryRewriteRequest,
        ReplanRequest, ReplanResponse,
    };

    /// 文本里第一个数字就是分数；二元模式下包含 "good" 即相关
    #[derive(Default)]
    struct TextGrader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Generator for TextGrader {
        async fn plan(&self, _: &ModelConfig, _: PlanRequest<'_>) -> Result<PlanResponse, GeneratorError> {
            unreachable!()
        }
        async fn replan(&self, _: &ModelConfig, _: ReplanRequest<'_>) -> Result<ReplanResponse, GeneratorError> {
            unreachable!()
        }
        async fn answer(&self, _: &ModelConfig, _: AnswerRequest<'_>) -> Result<AnswerResponse, GeneratorError> {
            unreachable!()
        }
        async fn rewrite_query(&self, _: &ModelConfig, _: QueryRewriteRequest<'_>) -> Result<String, GeneratorError> {
            unreachable!()
        }
        async fn grade(&self, _: &ModelConfig, request: GradeRequest<'_>) -> Result<RelevanceScore, GeneratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(match request.mode {
                GradingMode::Binary => RelevanceScore::Binary(request.document.contains("good")),
                GradingMode::Graded { .. } => {
                    let digit = request
                        .document
                        .chars()
                        .find_map(|c| c.to_digit(10))
                        .unwrap_or(0);
                    RelevanceScore::Graded(digit as u8)
                }
            })
        }
    }

    fn candidate(text: &str, score: f32) -> Candidate {
        Candidate::new(
            text,
            score,
            CandidateMetadata {
                doc_id: text.to_string(),
                source: "runbooks".to_string(),
                filename: format!("{}.md", text),
                content_hash: String::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_binary_keeps_only_yes() {
        let grader = RelevanceGrader::new(Arc::new(TextGrader::default()), GradingMode::Binary);
        let kept = grader
            .filter(
                &[candidate("good a", 0.9), candidate("bad b", 0.8), candidate("good c", 0.7)],
                "q",
                &ModelConfig::new("m"),
            )
            .await
            .unwrap();
        let texts: Vec<_> = kept.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["good a", "good c"]);
    }

    #[tokio::test]
    async fn test_graded_respects_cutoff_and_sorts_descending() {
        let grader = RelevanceGrader::new(
            Arc::new(TextGrader::default()),
            GradingMode::Graded { cutoff: 5 },
        );
        let verdicts = grader
            .grade(
                &[
                    candidate("doc 5", 0.9),
                    candidate("doc 4", 0.9),
                    candidate("doc 9", 0.9),
                    candidate("doc 7", 0.9),
                ],
                "q",
                &ModelConfig::new("m"),
            )
            .await
            .unwrap();
        assert_eq!(verdicts.len(), 4);
        let kept: Vec<_> = verdicts.iter().filter(|v| v.keep).collect();
        assert_eq!(
            kept.iter().map(|v| v.score).collect::<Vec<_>>(),
            vec![
                RelevanceScore::Graded(9),
                RelevanceScore::Graded(7),
                RelevanceScore::Graded(5)
            ]
        );
        assert!(verdicts
            .iter()
            .filter(|v| v.keep)
            .all(|v| matches!(v.score, RelevanceScore::Graded(g) if g >= 5)));
        assert!(!verdicts[3].keep);
    }

    #[tokio::test]
    async fn test_confident_score_skips_generator() {
        let generator = Arc::new(TextGrader::default());
        let grader = RelevanceGrader::new(generator.clone(), GradingMode::Binary)
            .with_confident_score(0.95);
        let kept = grader
            .filter(
                &[candidate("bad but confident", 0.99), candidate("bad", 0.5)],
                "q",
                &ModelConfig::new("m"),
            )
            .await
            .unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].text, "bad but confident");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mode_from_config() {
        let section = GradingSection::default();
        assert_eq!(GradingMode::from(&section), GradingMode::Graded { cutoff: 5 });
    }
}
