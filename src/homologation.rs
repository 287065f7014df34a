//! 认证记录与用户仓库
//!
//! 每个变更都通过 [`AuditRecorder`] 记录前后数据。
//! 审计写入在释放连接锁之后进行（审计日志与业务数据共用同一个连接）。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{actions, AuditRecorder};
use crate::clock::Clock;
use crate::database::Database;
use crate::models::{
    Actor, AppError, Homologation, HomologationInput, User, UserRole,
};

pub type AppResult<T> = Result<T, AppError>;

const HOMOLOGATION_COLUMNS: &str = "id, real_name, logical_name, url, homologation_date, \
    has_previous_versions, repository_location, details, created_by, created_at, updated_at";

const USER_COLUMNS: &str = "id, username, full_name, role, is_active, created_at, last_login";

fn homologation_target(id: i64) -> String {
    format!("homologations:{}", id)
}

fn user_target(id: i64) -> String {
    format!("users:{}", id)
}

fn to_json<T: serde::Serialize>(value: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("[Audit] 序列化审计数据失败: {}", e);
            None
        }
    }
}

// ============================================================================
// 认证记录
// ============================================================================

pub struct HomologationRepository {
    db: Arc<Database>,
    audit: Arc<dyn AuditRecorder>,
    clock: Arc<dyn Clock>,
}

impl HomologationRepository {
    pub fn new(db: Arc<Database>, audit: Arc<dyn AuditRecorder>, clock: Arc<dyn Clock>) -> Self {
        Self { db, audit, clock }
    }

    fn validate(input: &HomologationInput) -> AppResult<()> {
        if input.real_name.trim().is_empty() {
            return Err(AppError::validation("应用名称不能为空"));
        }
        if let Some(url) = input.url.as_deref().filter(|u| !u.is_empty()) {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(AppError::validation(format!("URL 格式无效: {}", url)));
            }
        }
        Ok(())
    }

    fn ensure_can_edit(user: &User) -> AppResult<()> {
        if !user.is_active || !user.role.can_edit() {
            return Err(AppError::permission_denied(format!(
                "用户 {} ({}) 无权修改认证记录",
                user.username,
                user.role.as_str()
            )));
        }
        Ok(())
    }

    pub fn create(&self, user: &User, input: &HomologationInput) -> AppResult<Homologation> {
        Self::ensure_can_edit(user)?;
        Self::validate(input)?;
        let now = self.clock.now();

        let created = {
            let conn = self.db.conn()?;
            conn.execute(
                "INSERT INTO homologations (real_name, logical_name, url, homologation_date,
                     has_previous_versions, repository_location, details, created_by,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    input.real_name.trim(),
                    input.logical_name,
                    input.url,
                    input.homologation_date,
                    input.has_previous_versions,
                    input.repository_location,
                    input.details,
                    user.id,
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();
            Self::fetch(&conn, id)?
                .ok_or_else(|| AppError::database(format!("新建记录 {} 读取失败", id)))?
        };

        self.audit.record(
            &Actor::user(user),
            actions::CREATE,
            Some(&homologation_target(created.id)),
            None,
            to_json(&created).as_ref(),
        );
        info!("[Homologation] {} 创建记录 {}", user.username, created.id);
        Ok(created)
    }

    pub fn update(
        &self,
        user: &User,
        id: i64,
        input: &HomologationInput,
    ) -> AppResult<Homologation> {
        Self::ensure_can_edit(user)?;
        Self::validate(input)?;
        let now = self.clock.now();

        let (before, after) = {
            let conn = self.db.conn()?;
            let before = Self::fetch(&conn, id)?
                .ok_or_else(|| AppError::not_found(format!("认证记录不存在: {}", id)))?;
            conn.execute(
                "UPDATE homologations SET real_name = ?1, logical_name = ?2, url = ?3,
                 homologation_date = ?4, has_previous_versions = ?5, repository_location = ?6,
                 details = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    input.real_name.trim(),
                    input.logical_name,
                    input.url,
                    input.homologation_date,
                    input.has_previous_versions,
                    input.repository_location,
                    input.details,
                    now,
                    id,
                ],
            )?;
            let after = Self::fetch(&conn, id)?
                .ok_or_else(|| AppError::not_found(format!("认证记录不存在: {}", id)))?;
            (before, after)
        };

        self.audit.record(
            &Actor::user(user),
            actions::UPDATE,
            Some(&homologation_target(id)),
            to_json(&before).as_ref(),
            to_json(&after).as_ref(),
        );
        Ok(after)
    }

    /// 删除记录（仅管理员）
    pub fn delete(&self, user: &User, id: i64) -> AppResult<Homologation> {
        if !user.is_active || !user.role.can_administer() {
            return Err(AppError::permission_denied(format!(
                "用户 {} 无权删除认证记录",
                user.username
            )));
        }

        let before = {
            let conn = self.db.conn()?;
            let before = Self::fetch(&conn, id)?
                .ok_or_else(|| AppError::not_found(format!("认证记录不存在: {}", id)))?;
            conn.execute("DELETE FROM homologations WHERE id = ?1", params![id])?;
            before
        };

        self.audit.record(
            &Actor::user(user),
            actions::DELETE,
            Some(&homologation_target(id)),
            to_json(&before).as_ref(),
            None,
        );
        info!("[Homologation] {} 删除记录 {}", user.username, id);
        Ok(before)
    }

    pub fn get(&self, id: i64) -> AppResult<Option<Homologation>> {
        let conn = self.db.conn()?;
        Self::fetch(&conn, id)
    }

    /// 列出记录，可按名称（真实名称或逻辑名称）模糊过滤
    pub fn list(&self, name_filter: Option<&str>) -> AppResult<Vec<Homologation>> {
        let conn = self.db.conn()?;
        let mut items = Vec::new();
        match name_filter.map(str::trim).filter(|s| !s.is_empty()) {
            Some(filter) => {
                let pattern = format!("%{}%", filter);
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM homologations
                     WHERE real_name LIKE ?1 OR logical_name LIKE ?1
                     ORDER BY updated_at DESC, id DESC",
                    HOMOLOGATION_COLUMNS
                ))?;
                let rows = stmt.query_map(params![pattern], Self::row_to_homologation)?;
                for row in rows {
                    items.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM homologations ORDER BY updated_at DESC, id DESC",
                    HOMOLOGATION_COLUMNS
                ))?;
                let rows = stmt.query_map([], Self::row_to_homologation)?;
                for row in rows {
                    items.push(row?);
                }
            }
        }
        Ok(items)
    }

    fn fetch(conn: &Connection, id: i64) -> AppResult<Option<Homologation>> {
        let item = conn
            .query_row(
                &format!("SELECT {} FROM homologations WHERE id = ?1", HOMOLOGATION_COLUMNS),
                params![id],
                Self::row_to_homologation,
            )
            .optional()?;
        Ok(item)
    }

    fn row_to_homologation(row: &Row) -> rusqlite::Result<Homologation> {
        Ok(Homologation {
            id: row.get(0)?,
            real_name: row.get(1)?,
            logical_name: row.get(2)?,
            url: row.get(3)?,
            homologation_date: row.get(4)?,
            has_previous_versions: row.get(5)?,
            repository_location: row.get(6)?,
            details: row.get(7)?,
            created_by: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

// ============================================================================
// 用户
// ============================================================================

pub struct UserRepository {
    db: Arc<Database>,
    audit: Arc<dyn AuditRecorder>,
    clock: Arc<dyn Clock>,
}

impl UserRepository {
    pub fn new(db: Arc<Database>, audit: Arc<dyn AuditRecorder>, clock: Arc<dyn Clock>) -> Self {
        Self { db, audit, clock }
    }

    pub fn create(
        &self,
        actor: &Actor,
        username: &str,
        full_name: Option<&str>,
        role: UserRole,
    ) -> AppResult<User> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AppError::validation("用户名不能为空"));
        }
        let now = self.clock.now();

        let user = {
            let conn = self.db.conn()?;
            if Self::fetch_by_username(&conn, username)?.is_some() {
                return Err(AppError::validation(format!("用户名已存在: {}", username)));
            }
            conn.execute(
                "INSERT INTO users (username, full_name, role, is_active, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![username, full_name, role.as_str(), now],
            )?;
            Self::fetch_by_username(&conn, username)?
                .ok_or_else(|| AppError::database(format!("新建用户 {} 读取失败", username)))?
        };

        self.audit.record(
            actor,
            actions::CREATE,
            Some(&user_target(user.id)),
            None,
            Some(&json!({
                "username": user.username,
                "full_name": user.full_name,
                "role": user.role.as_str(),
            })),
        );
        Ok(user)
    }

    pub fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let conn = self.db.conn()?;
        Self::fetch_by_username(&conn, username.trim())
    }

    /// 记录一次登录尝试
    ///
    /// 凭据校验由调用方完成；这里只更新 `last_login` 并写审计。
    /// 成功时返回用户；用户不存在或已停用时视为失败。
    pub fn record_login_attempt(&self, username: &str, success: bool) -> AppResult<Option<User>> {
        let now = self.clock.now();
        let user = {
            let conn = self.db.conn()?;
            match Self::fetch_by_username(&conn, username.trim())? {
                Some(user) if success && user.is_active => {
                    conn.execute(
                        "UPDATE users SET last_login = ?1 WHERE id = ?2",
                        params![now, user.id],
                    )?;
                    Some(User {
                        last_login: Some(now),
                        ..user
                    })
                }
                _ => None,
            }
        };

        match &user {
            Some(user) => {
                self.audit.record(
                    &Actor::user(user),
                    actions::LOGIN_SUCCESS,
                    Some(&user_target(user.id)),
                    None,
                    None,
                );
            }
            None => {
                let actor = Actor {
                    user_id: None,
                    username: username.trim().to_string(),
                };
                self.audit.record(&actor, actions::LOGIN_FAILED, None, None, None);
                warn!("[Auth] 登录失败: {}", username.trim());
            }
        }
        Ok(user)
    }

    fn fetch_by_username(conn: &Connection, username: &str) -> AppResult<Option<User>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
                params![username],
                Self::row_to_user,
            )
            .optional()?;
        row.transpose()
    }

    fn row_to_user(row: &Row) -> rusqlite::Result<AppResult<User>> {
        let role: String = row.get(3)?;
        let created_at: DateTime<Utc> = row.get(5)?;
        let user = UserRole::parse(&role)
            .map(|role| -> rusqlite::Result<User> {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    full_name: row.get(2)?,
                    role,
                    is_active: row.get(4)?,
                    created_at,
                    last_login: row.get(6)?,
                })
            })
            .transpose()?
            .ok_or_else(|| AppError::database(format!("未知的用户角色: {}", role)));
        Ok(user)
    }
}
