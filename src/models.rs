use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// 记录存储中的业务实体
// ============================================================================

/// 应用认证（homologación）记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Homologation {
    pub id: i64,
    pub real_name: String,
    pub logical_name: Option<String>,
    pub url: Option<String>,
    pub homologation_date: Option<String>,
    pub has_previous_versions: bool,
    pub repository_location: Option<String>,
    pub details: Option<String>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 新建 / 更新认证记录时的输入
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomologationInput {
    pub real_name: String,
    #[serde(default)]
    pub logical_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub homologation_date: Option<String>,
    #[serde(default)]
    pub has_previous_versions: bool,
    #[serde(default)]
    pub repository_location: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

/// 用户角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Editor,
    Viewer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Editor => "editor",
            UserRole::Viewer => "viewer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(UserRole::Admin),
            "editor" => Some(UserRole::Editor),
            "viewer" => Some(UserRole::Viewer),
            _ => None,
        }
    }

    /// 是否允许修改认证记录
    pub fn can_edit(&self) -> bool {
        matches!(self, UserRole::Admin | UserRole::Editor)
    }

    /// 是否允许执行恢复、删除备份等管理操作
    pub fn can_administer(&self) -> bool {
        matches!(self, UserRole::Admin)
    }
}

/// 用户账号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub full_name: Option<String>,
    pub role: UserRole,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// 执行操作的主体，写入审计日志
///
/// 调度器触发的操作使用 [`Actor::system`]。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Option<i64>,
    pub username: String,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            user_id: None,
            username: "system".to_string(),
        }
    }

    pub fn user(user: &User) -> Self {
        Self {
            user_id: Some(user.id),
            username: user.username.clone(),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.user_id {
            Some(id) => write!(f, "{}#{}", self.username, id),
            None => write!(f, "{}", self.username),
        }
    }
}

// ============================================================================
// 结构化错误处理
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorType {
    Validation,
    Database,
    FileSystem,
    NotFound,
    Configuration,
    PermissionDenied,
    Busy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub error_type: AppErrorType,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(error_type: AppErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error_type: AppErrorType,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Validation, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Database, message)
    }

    pub fn file_system(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::FileSystem, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::NotFound, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Configuration, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::PermissionDenied, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Unknown, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::validation(message)
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::validation(message.to_string())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        AppError::file_system(format!("ZIP操作错误: {}", err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::unknown(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::validation(format!("JSON序列化错误: {}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::file_system(format!("文件系统错误: {}", err))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::database(format!("数据库错误: {}", err))
    }
}

impl From<crate::backup::BackupFailure> for AppError {
    fn from(err: crate::backup::BackupFailure) -> Self {
        use crate::backup::BackupFailure;

        let error_type = match err.root() {
            BackupFailure::NotFound(_) => AppErrorType::NotFound,
            BackupFailure::PermissionDenied(_) => AppErrorType::PermissionDenied,
            BackupFailure::Busy => AppErrorType::Busy,
            BackupFailure::ArchiveInvalid(_) => AppErrorType::Validation,
            _ => AppErrorType::FileSystem,
        };
        let details = err
            .safety_copy_path()
            .map(|p| serde_json::json!({ "safety_copy_path": p.to_string_lossy() }));
        AppError {
            error_type,
            message: err.to_string(),
            details,
        }
    }
}

impl From<crate::audit::AuditError> for AppError {
    fn from(err: crate::audit::AuditError) -> Self {
        AppError::database(err.to_string())
    }
}

impl From<crate::config::ConfigError> for AppError {
    fn from(err: crate::config::ConfigError) -> Self {
        AppError::configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_role_parse() {
        assert_eq!(UserRole::parse("ADMIN"), Some(UserRole::Admin));
        assert_eq!(UserRole::parse(" editor "), Some(UserRole::Editor));
        assert_eq!(UserRole::parse("viewer"), Some(UserRole::Viewer));
        assert_eq!(UserRole::parse("root"), None);
    }

    #[test]
    fn test_user_role_permissions() {
        assert!(UserRole::Admin.can_administer());
        assert!(!UserRole::Editor.can_administer());
        assert!(UserRole::Editor.can_edit());
        assert!(!UserRole::Viewer.can_edit());
    }

    #[test]
    fn test_actor_display() {
        assert_eq!(Actor::system().to_string(), "system");
        let actor = Actor {
            user_id: Some(7),
            username: "ana".to_string(),
        };
        assert_eq!(actor.to_string(), "ana#7");
    }

    #[test]
    fn test_app_error_from_io() {
        let err: AppError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err.error_type, AppErrorType::FileSystem);
        assert!(err.message.contains("boom"));
    }
}
