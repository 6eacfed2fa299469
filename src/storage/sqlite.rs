//! SQLite 会话存储
//!
//! 每次操作在 spawn_blocking 中打开连接；列表字段以 JSON 文本保存，时间为 UTC。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::storage::{
    Evaluation, NewStep, SessionContext, SessionKind, SessionRecord, SessionStore, StepRecord,
    StoreError,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    issue TEXT NOT NULL,
    context TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS steps (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    query TEXT NOT NULL,
    plan TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    referenced_docs TEXT NOT NULL,
    results TEXT NOT NULL,
    hub_commands TEXT NOT NULL,
    spoke_commands TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_steps_session ON steps(session_id, seq);
CREATE TABLE IF NOT EXISTS evaluations (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    step_id TEXT NOT NULL REFERENCES steps(id),
    score INTEGER NOT NULL,
    feedback TEXT,
    created_at TEXT NOT NULL
);
"#;

const STEP_COLUMNS: &str = "id, session_id, query, plan, reasoning, referenced_docs, results, \
                            hub_commands, spoke_commands, created_at";

fn storage_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// 在 query_map 闭包里解析 JSON 列
fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<StepRecord> {
    Ok(StepRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        query: row.get(2)?,
        plan: row.get(3)?,
        reasoning: row.get(4)?,
        referenced_docs: json_column(row, 5)?,
        results: json_column(row, 6)?,
        hub_commands: json_column(row, 7)?,
        spoke_commands: json_column(row, 8)?,
        created_at: row.get(9)?,
    })
}

fn session_exists(conn: &Connection, session_id: &str) -> Result<bool, StoreError> {
    conn.query_row(
        "SELECT 1 FROM sessions WHERE id = ?1",
        params![session_id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(storage_err)
}

pub struct SqliteSessionStore {
    db_path: PathBuf,
}

impl SqliteSessionStore {
    /// 打开（必要时创建）数据库并建表
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(storage_err)?;
        }
        let conn = Connection::open(&db_path).map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self { db_path })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&db_path).map_err(storage_err)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
                .map_err(storage_err)?;
            f(&mut conn)
        })
        .await
        .map_err(storage_err)?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(
        &self,
        kind: SessionKind,
        issue: &str,
        context: &SessionContext,
    ) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            issue: issue.to_string(),
            context: context.clone(),
            created_at: Utc::now(),
        };
        let context_json = to_json(&record.context)?;
        let row = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, kind, issue, context, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![row.id, row.kind.as_str(), row.issue, context_json, row.created_at],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await?;
        tracing::debug!(session_id = %record.id, kind = record.kind.as_str(), "session created");
        Ok(record)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let session_id = session_id.to_string();
        let row = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, kind, issue, context, created_at FROM sessions WHERE id = ?1",
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, DateTime<Utc>>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(storage_err)
            })
            .await?;

        let Some((id, kind, issue, context, created_at)) = row else {
            return Ok(None);
        };
        let kind = SessionKind::parse(&kind)
            .ok_or_else(|| StoreError::Serialization(format!("unknown session kind: {}", kind)))?;
        let context: SessionContext =
            serde_json::from_str(&context).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(SessionRecord {
            id,
            kind,
            issue,
            context,
            created_at,
        }))
    }

    async fn append_step(&self, session_id: &str, step: NewStep) -> Result<StepRecord, StoreError> {
        let record = StepRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            query: step.query,
            plan: step.plan,
            reasoning: step.reasoning,
            referenced_docs: step.referenced_docs,
            results: step.results,
            hub_commands: step.hub_commands,
            spoke_commands: step.spoke_commands,
            created_at: Utc::now(),
        };
        let docs = to_json(&record.referenced_docs)?;
        let results = to_json(&record.results)?;
        let hub = to_json(&record.hub_commands)?;
        let spoke = to_json(&record.spoke_commands)?;
        let row = record.clone();
        self.with_conn(move |conn| {
            if !session_exists(conn, &row.session_id)? {
                return Err(StoreError::NotFound(format!("session {}", row.session_id)));
            }
            conn.execute(
                &format!(
                    "INSERT INTO steps ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    STEP_COLUMNS
                ),
                params![
                    row.id,
                    row.session_id,
                    row.query,
                    row.plan,
                    row.reasoning,
                    docs,
                    results,
                    hub,
                    spoke,
                    row.created_at
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await?;
        Ok(record)
    }

    async fn update_step(&self, step: &StepRecord) -> Result<(), StoreError> {
        let docs = to_json(&step.referenced_docs)?;
        let results = to_json(&step.results)?;
        let hub = to_json(&step.hub_commands)?;
        let spoke = to_json(&step.spoke_commands)?;
        let row = step.clone();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE steps SET query = ?1, plan = ?2, reasoning = ?3, referenced_docs = ?4, \
                     results = ?5, hub_commands = ?6, spoke_commands = ?7 \
                     WHERE id = ?8 AND session_id = ?9",
                    params![
                        row.query,
                        row.plan,
                        row.reasoning,
                        docs,
                        results,
                        hub,
                        spoke,
                        row.id,
                        row.session_id
                    ],
                )
                .map_err(storage_err)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("step {}", row.id)));
            }
            Ok(())
        })
        .await
    }

    async fn list_steps(&self, session_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM steps WHERE session_id = ?1 ORDER BY seq",
                    STEP_COLUMNS
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![session_id], step_from_row)
                .map_err(storage_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
        })
        .await
    }

    async fn evaluate(
        &self,
        session_id: &str,
        step_id: &str,
        score: i32,
        feedback: Option<&str>,
    ) -> Result<Evaluation, StoreError> {
        let evaluation = Evaluation {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            step_id: step_id.to_string(),
            score,
            feedback: feedback.map(str::to_string),
            created_at: Utc::now(),
        };
        let row = evaluation.clone();
        self.with_conn(move |conn| {
            let step_found = conn
                .query_row(
                    "SELECT 1 FROM steps WHERE id = ?1 AND session_id = ?2",
                    params![row.step_id, row.session_id],
                    |_| Ok(()),
                )
                .optional()
                .map_err(storage_err)?;
            if step_found.is_none() {
                return Err(StoreError::NotFound(format!(
                    "step {} in session {}",
                    row.step_id, row.session_id
                )));
            }
            conn.execute(
                "INSERT INTO evaluations (id, session_id, step_id, score, feedback, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![row.id, row.session_id, row.step_id, row.score, row.feedback, row.created_at],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await?;
        Ok(evaluation)
    }

    async fn list_evaluations(&self, session_id: &str) -> Result<Vec<Evaluation>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, session_id, step_id, score, feedback, created_at \
                     FROM evaluations WHERE session_id = ?1 ORDER BY created_at",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![session_id], |row| {
                    Ok(Evaluation {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        step_id: row.get(2)?,
                        score: row.get(3)?,
                        feedback: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })
                .map_err(storage_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
        })
        .await
    }
}
