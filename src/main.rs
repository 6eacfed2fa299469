//! Troubleshooter 命令行
//!
//! 入口：加载配置与文档语料（JSON 数组），组装服务后执行 chat / diagnose / evaluate。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use troubleshooter::{
    config::{load_config, ApprovalMode},
    generator::ModelConfig,
    observability,
    rag::Document,
    service::{build_service, ChatRequest, DiagnoseRequest},
    storage::{SessionContext, SqliteSessionStore},
};

#[derive(Parser)]
#[command(name = "troubleshooter")]
#[command(about = "Answer operator questions and troubleshoot cluster issues from a runbook corpus")]
#[command(version)]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 文档语料：JSON 数组，每项含 id / source / filename / text
    #[arg(long, global = true)]
    corpus: Option<PathBuf>,

    /// 排障命令不经终端确认直接执行
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 问答（不带 --session 时新建会话）
    Chat {
        query: String,
        #[arg(long)]
        session: Option<String>,
        /// 检索范围，可重复；缺省取配置中的 app.doc_sources
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// 排障：新会话需要 issue；继续排障时用 --result 提交上一轮执行结果
    Diagnose {
        #[arg(default_value = "")]
        issue: String,
        #[arg(long)]
        session: Option<String>,
        #[arg(long = "result")]
        results: Vec<String>,
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// 对某一步的回答打分
    Evaluate {
        session: String,
        step: String,
        score: i32,
        feedback: Option<String>,
    },
}

fn load_corpus(path: Option<&PathBuf>) -> anyhow::Result<Vec<Document>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read corpus {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid corpus {}", path.display()))
}

fn context_override(sources: Vec<String>, model: &ModelConfig) -> Option<SessionContext> {
    (!sources.is_empty()).then(|| SessionContext {
        sources,
        model: model.clone(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init();

    let mut cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    if cli.yes {
        cfg.executor.approval = ApprovalMode::None;
    }
    let documents = load_corpus(cli.corpus.as_ref())?;
    let store = SqliteSessionStore::new(&cfg.storage.database_path)
        .context("Failed to open session store")?;
    let service = build_service(&cfg, Arc::new(store), documents)
        .await
        .context("Failed to build service")?;
    let default_model = ModelConfig {
        model: cfg.llm.model.clone(),
        api_base: cfg.llm.base_url.clone(),
        api_key: cfg.llm.api_key.clone(),
    };

    match cli.command {
        Commands::Chat {
            query,
            session,
            sources,
        } => {
            let response = service
                .chat(ChatRequest {
                    session_id: session,
                    query,
                    context: context_override(sources, &default_model),
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Diagnose {
            issue,
            session,
            results,
            sources,
        } => {
            let response = service
                .diagnose(DiagnoseRequest {
                    session_id: session,
                    issue,
                    results,
                    context: context_override(sources, &default_model),
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Evaluate {
            session,
            step,
            score,
            feedback,
        } => {
            service
                .evaluate(&session, &step, score, feedback.as_deref())
                .await?;
            println!("evaluation stored");
        }
    }

    Ok(())
}
