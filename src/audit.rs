//! # Audit 模块
//!
//! 审计日志：每个变更操作（创建 / 更新 / 删除 / 登录 / 备份 / 恢复）
//! 追加一行到 `audit_logs`，记录操作者、时间、前后数据。
//!
//! 审计写入是尽力而为的：失败只记录 `warn` 日志并吞掉，
//! 不影响主操作的结果，也不在主操作的事务边界之内。
//! 行只追加，从不更新或删除。

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::Clock;
use crate::database::Database;
use crate::models::Actor;

/// 审计动作名称
pub mod actions {
    pub const BACKUP_CREATED: &str = "backup_created";
    pub const RESTORE_PERFORMED: &str = "restore_performed";
    pub const BACKUP_DELETED: &str = "backup_deleted";
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const LOGIN_SUCCESS: &str = "login_success";
    pub const LOGIN_FAILED: &str = "login_failed";
}

/// 审计日志条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<i64>,
    /// 操作者显示名（`username#id` 或 `system`）
    pub actor: String,
    pub action: String,
    /// 目标实体，例如 `homologations:12`、`backup:backup_20260101_000000`
    pub target_entity: Option<String>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
}

/// 审计记录端口
///
/// 备份服务与仓库只依赖这个 trait，测试中可替换为内存实现。
pub trait AuditRecorder: Send + Sync {
    /// 追加一条审计记录（尽力而为，不返回错误）
    fn record(
        &self,
        actor: &Actor,
        action: &str,
        target_entity: Option<&str>,
        before: Option<&serde_json::Value>,
        after: Option<&serde_json::Value>,
    );
}

/// 基于记录存储的审计日志
pub struct AuditLogger {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl AuditLogger {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, AuditError> {
        self.db
            .conn()
            .map_err(|e| AuditError::Database(e.to_string()))
    }

    /// 写入一条记录，返回行 ID
    pub fn try_record(
        &self,
        actor: &Actor,
        action: &str,
        target_entity: Option<&str>,
        before: Option<&serde_json::Value>,
        after: Option<&serde_json::Value>,
    ) -> Result<i64, AuditError> {
        let conn = self.conn()?;
        AuditRepository::insert(
            &conn,
            self.clock.now(),
            actor,
            action,
            target_entity,
            before,
            after,
        )
    }

    /// 查询审计日志（按时间倒序）
    pub fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let conn = self.conn()?;
        AuditRepository::query(&conn, &filter)
    }

    pub fn count_all(&self) -> Result<u64, AuditError> {
        let conn = self.conn()?;
        AuditRepository::count_all(&conn)
    }

    pub fn count_by_action(&self, action: &str) -> Result<u64, AuditError> {
        let conn = self.conn()?;
        AuditRepository::count_by_action(&conn, action)
    }
}

impl AuditRecorder for AuditLogger {
    fn record(
        &self,
        actor: &Actor,
        action: &str,
        target_entity: Option<&str>,
        before: Option<&serde_json::Value>,
        after: Option<&serde_json::Value>,
    ) {
        match self.try_record(actor, action, target_entity, before, after) {
            Ok(id) => {
                tracing::debug!(
                    "[Audit] {} {} {} (id={})",
                    actor,
                    action,
                    target_entity.unwrap_or("-"),
                    id
                );
            }
            Err(e) => {
                tracing::warn!(
                    "[Audit] 审计日志写入失败（已忽略）: actor={}, action={}, error={}",
                    actor,
                    action,
                    e
                );
            }
        }
    }
}

/// 审计日志仓库
pub struct AuditRepository;

impl AuditRepository {
    const INSERT_SQL: &'static str = r#"
        INSERT INTO audit_logs (
            timestamp, user_id, actor, action, target_entity, old_values, new_values
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    "#;

    const SELECT_SQL: &'static str = "SELECT id, timestamp, user_id, actor, action, \
        target_entity, old_values, new_values FROM audit_logs";

    /// 插入审计日志
    pub fn insert(
        conn: &Connection,
        timestamp: DateTime<Utc>,
        actor: &Actor,
        action: &str,
        target_entity: Option<&str>,
        before: Option<&serde_json::Value>,
        after: Option<&serde_json::Value>,
    ) -> Result<i64, AuditError> {
        let old_values = before.map(serde_json::to_string).transpose()?;
        let new_values = after.map(serde_json::to_string).transpose()?;

        conn.execute(
            Self::INSERT_SQL,
            params![
                format_timestamp(&timestamp),
                actor.user_id,
                actor.to_string(),
                action,
                target_entity,
                old_values,
                new_values,
            ],
        )
        .map_err(|e| AuditError::Database(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    /// 查询审计日志
    pub fn query(conn: &Connection, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let mut sql = format!("{} WHERE 1=1", Self::SELECT_SQL);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(user_id) = filter.user_id {
            params_vec.push(Box::new(user_id));
            sql.push_str(&format!(" AND user_id = ?{}", params_vec.len()));
        }

        if let Some(ref action) = filter.action {
            params_vec.push(Box::new(action.clone()));
            sql.push_str(&format!(" AND action = ?{}", params_vec.len()));
        }

        if let Some(ref from_time) = filter.from_time {
            params_vec.push(Box::new(format_timestamp(from_time)));
            sql.push_str(&format!(" AND timestamp >= ?{}", params_vec.len()));
        }

        if let Some(ref to_time) = filter.to_time {
            params_vec.push(Box::new(format_timestamp(to_time)));
            sql.push_str(&format!(" AND timestamp <= ?{}", params_vec.len()));
        }

        sql.push_str(" ORDER BY timestamp DESC, id DESC");

        match (filter.limit, filter.offset) {
            (Some(limit), offset) => {
                sql.push_str(&format!(" LIMIT {}", limit));
                if let Some(offset) = offset.filter(|o| *o > 0) {
                    sql.push_str(&format!(" OFFSET {}", offset));
                }
            }
            (None, Some(offset)) if offset > 0 => {
                sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset));
            }
            _ => {}
        }

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AuditError::Database(e.to_string()))?;

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|b| b.as_ref()).collect();

        let rows = stmt
            .query_map(params_refs.as_slice(), Self::row_to_entry)
            .map_err(|e| AuditError::Database(e.to_string()))?;

        let mut entries = Vec::new();
        for row_result in rows {
            let entry = row_result.map_err(|e| AuditError::Database(e.to_string()))?;
            entries.push(entry?);
        }
        Ok(entries)
    }

    /// 获取审计日志总数
    pub fn count_all(conn: &Connection) -> Result<u64, AuditError> {
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_logs", [], |row| row.get(0))
            .map_err(|e| AuditError::Database(e.to_string()))?;
        Ok(count as u64)
    }

    /// 统计指定动作的数量
    pub fn count_by_action(conn: &Connection, action: &str) -> Result<u64, AuditError> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM audit_logs WHERE action = ?1",
                params![action],
                |row| row.get(0),
            )
            .map_err(|e| AuditError::Database(e.to_string()))?;
        Ok(count as u64)
    }

    fn row_to_entry(row: &Row) -> rusqlite::Result<Result<AuditEntry, AuditError>> {
        let id: i64 = row.get(0)?;
        let timestamp_str: String = row.get(1)?;
        let user_id: Option<i64> = row.get(2)?;
        let actor: String = row.get(3)?;
        let action: String = row.get(4)?;
        let target_entity: Option<String> = row.get(5)?;
        let old_values: Option<String> = row.get(6)?;
        let new_values: Option<String> = row.get(7)?;

        let timestamp = match DateTime::parse_from_rfc3339(&timestamp_str) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                return Ok(Err(AuditError::Database(format!(
                    "Invalid timestamp: {}",
                    e
                ))))
            }
        };

        Ok(Ok(AuditEntry {
            id,
            timestamp,
            user_id,
            actor,
            action,
            target_entity,
            old_values: parse_json_column(old_values),
            new_values: parse_json_column(new_values),
        }))
    }
}

/// 固定精度的 RFC3339，保证按字符串排序等于按时间排序
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json_column(value: Option<String>) -> Option<serde_json::Value> {
    match value {
        Some(ref s) if !s.is_empty() => serde_json::from_str(s).ok(),
        _ => None,
    }
}

/// 审计日志查询过滤器
#[derive(Debug, Default, Clone)]
pub struct AuditFilter {
    /// 操作者用户 ID
    pub user_id: Option<i64>,
    /// 动作名称（见 [`actions`]）
    pub action: Option<String>,
    pub from_time: Option<DateTime<Utc>>,
    pub to_time: Option<DateTime<Utc>>,
    /// 最大返回数量
    pub limit: Option<usize>,
    /// 偏移量（用于分页）
    pub offset: Option<usize>,
}

/// 审计错误
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
