//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TROUBLESHOOTER__*` 覆盖
//! （双下划线表示嵌套，如 `TROUBLESHOOTER__RETRIEVAL__TOP_N=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub retrieval: RetrievalSection,
    pub grading: GradingSection,
    pub workflow: WorkflowSection,
    pub generator: GeneratorSection,
    pub executor: ExecutorSection,
    pub storage: StorageSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话历史保留轮数
    pub max_context_turns: usize,
    /// 请求未指定检索范围时使用的文档来源
    pub doc_sources: Vec<String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_context_turns: 20,
            doc_sources: Vec::new(),
        }
    }
}

/// [llm] 段：默认模型配置（请求可覆盖）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次 Generator 调用超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [embedding] 段：provider 为 openai 时调用远端，否则使用本地哈希嵌入
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub dims: usize,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: "text-embedding-3-small".to_string(),
            base_url: None,
            dims: 384,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankerKind {
    None,
    Lexical,
    Http,
}

/// [retrieval] 段：图索引参数、相似度阈值、重排
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    pub similarity_cutoff: f32,
    /// 向量初筛数量
    pub top_k: usize,
    /// 重排后保留数量
    pub top_n: usize,
    /// 查询时图搜索宽度
    pub ef_search: usize,
    /// 每个节点的连接数
    pub m: usize,
    /// 构建时图搜索宽度
    pub ef_construction: usize,
    pub reranker: RerankerKind,
    pub rerank_endpoint: Option<String>,
    pub rerank_timeout_secs: u64,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            similarity_cutoff: 0.5,
            top_k: 10,
            top_n: 3,
            ef_search: 300,
            m: 16,
            ef_construction: 64,
            reranker: RerankerKind::Lexical,
            rerank_endpoint: None,
            rerank_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradingModeKind {
    Binary,
    Graded,
}

/// [grading] 段：相关性评分（每个候选一次 Generator 调用）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GradingSection {
    pub enabled: bool,
    pub mode: GradingModeKind,
    /// 分级模式的保留阈值（0–10）
    pub cutoff: u8,
    /// 重排分数不低于此值的候选免评直接保留
    pub confident_score: Option<f32>,
}

impl Default for GradingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: GradingModeKind::Graded,
            cutoff: 5,
            confident_score: None,
        }
    }
}

/// [workflow] 段：检索次数上限与步数预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub retrieval_limit: u32,
    pub recursion_limit: usize,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            retrieval_limit: 10,
            recursion_limit: 50,
        }
    }
}

/// [generator] 段：相邻两次调用的最小间隔（应对外部限流）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GeneratorSection {
    pub call_interval_ms: u64,
}

/// 命令执行前的审批方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// 不审批，直接执行
    None,
    /// 终端逐段确认
    #[default]
    Console,
}

/// [executor] 段：排障命令执行
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub timeout_secs: u64,
    /// 每次执行后的停顿（毫秒）
    pub pause_after_ms: u64,
    /// 未单独配置集群目录时的工作目录
    pub working_dir: Option<PathBuf>,
    /// hub 集群 must-gather 目录
    pub hub_working_dir: Option<PathBuf>,
    /// spoke 集群 must-gather 目录
    pub spoke_working_dir: Option<PathBuf>,
    pub approval: ApprovalMode,
    /// 等待终端确认的时长，超时视为拒绝
    pub approval_timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            pause_after_ms: 0,
            working_dir: None,
            hub_working_dir: None,
            spoke_working_dir: None,
            approval: ApprovalMode::default(),
            approval_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub database_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/troubleshooter.db"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 TROUBLESHOOTER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TROUBLESHOOTER")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("app.doc_sources")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.workflow.retrieval_limit, 10);
        assert_eq!(cfg.workflow.recursion_limit, 50);
        assert_eq!(cfg.retrieval.top_n, 3);
        assert_eq!(cfg.retrieval.similarity_cutoff, 0.5);
        assert_eq!(cfg.executor.timeout_secs, 120);
        assert_eq!(cfg.executor.approval, ApprovalMode::Console);
        assert_eq!(cfg.grading.cutoff, 5);
        assert!(!cfg.grading.enabled);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[retrieval]\ntop_n = 5\nreranker = \"none\"\n[workflow]\nretrieval_limit = 3\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.retrieval.top_n, 5);
        assert_eq!(cfg.retrieval.reranker, RerankerKind::None);
        assert_eq!(cfg.retrieval.top_k, 10);
        assert_eq!(cfg.workflow.retrieval_limit, 3);
        assert_eq!(cfg.workflow.recursion_limit, 50);
    }

    #[test]
    fn test_executor_cluster_dirs_and_approval() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[executor]\nhub_working_dir = \"/mg/hub\"\nspoke_working_dir = \"/mg/spoke\"\napproval = \"none\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.executor.hub_working_dir, Some(PathBuf::from("/mg/hub")));
        assert_eq!(cfg.executor.spoke_working_dir, Some(PathBuf::from("/mg/spoke")));
        assert_eq!(cfg.executor.approval, ApprovalMode::None);
        assert_eq!(cfg.executor.approval_timeout_secs, 300);
    }
}
