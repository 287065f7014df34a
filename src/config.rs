//! 配置模块
//!
//! 分层加载应用配置：
//! - 内置默认值
//! - `homologador.toml`（可通过 `HOMOLOGADOR_CONFIG` 指定路径）
//! - `HOMOLOGADOR__*` 环境变量（支持 `.env`）
//!
//! 备份设置（保留策略、间隔、目录）只在启动时读取一次；
//! 运行期通过 `BackupService::update_settings` 修改，下一次调度时生效。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// 指定配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "HOMOLOGADOR_CONFIG";

/// 覆盖配置项的环境变量前缀，例如 `HOMOLOGADOR__BACKUP__RETENTION_DAYS=14`
pub const ENV_PREFIX: &str = "HOMOLOGADOR";

/// 默认配置文件名（相对当前工作目录）
pub const DEFAULT_CONFIG_FILE: &str = "homologador.toml";

/// 默认数据目录名
const APP_DIR_NAME: &str = "homologador";

/// 默认数据库文件名
const DEFAULT_DATABASE_FILE: &str = "homologador.db";

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 活动数据库文件路径
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// 备份设置
    #[serde(default)]
    pub backup: BackupSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            backup: BackupSettings::default(),
        }
    }
}

/// 备份设置（保留策略）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSettings {
    /// 自定义备份目录（None 表示使用数据库所在目录下的 `backups`）
    #[serde(default)]
    pub backup_directory: Option<PathBuf>,

    /// 是否启用自动备份
    #[serde(default = "default_true")]
    pub auto_backup_enabled: bool,

    /// 自动备份间隔（小时），默认 24 小时
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u32,

    /// 备份保留天数，默认 30 天
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// 日志目录（None 表示不收集日志）
    #[serde(default)]
    pub log_directory: Option<PathBuf>,

    /// 只收集最近 N 天修改过的日志
    #[serde(default = "default_log_window_days")]
    pub log_window_days: u32,

    /// 纳入备份的原始配置文件（加载时自动填充为实际读取的文件）
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    /// 单次备份/恢复的超时（秒）
    #[serde(default = "default_copy_timeout_secs")]
    pub copy_timeout_secs: u64,

    /// 恢复前是否对数据库做 `PRAGMA integrity_check`
    #[serde(default = "default_true")]
    pub verify_sqlite_integrity: bool,
}

fn default_true() -> bool {
    true
}

fn default_interval_hours() -> u32 {
    24
}

fn default_retention_days() -> u32 {
    30
}

fn default_log_window_days() -> u32 {
    7
}

fn default_copy_timeout_secs() -> u64 {
    5 * 60
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join(DEFAULT_DATABASE_FILE)
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            backup_directory: None,
            auto_backup_enabled: true,
            interval_hours: default_interval_hours(),
            retention_days: default_retention_days(),
            log_directory: None,
            log_window_days: default_log_window_days(),
            config_file: None,
            copy_timeout_secs: default_copy_timeout_secs(),
            verify_sqlite_integrity: true,
        }
    }
}

impl BackupSettings {
    /// 校验取值范围
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_hours < 1 {
            return Err(ConfigError::Invalid(
                "backup.interval_hours 必须 >= 1".to_string(),
            ));
        }
        if self.retention_days < 1 {
            return Err(ConfigError::Invalid(
                "backup.retention_days 必须 >= 1".to_string(),
            ));
        }
        if self.copy_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "backup.copy_timeout_secs 必须 > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 获取有效的备份目录
    ///
    /// 设置了自定义目录时使用自定义目录，否则使用数据库旁边的 `backups` 目录。
    pub fn effective_backup_directory(&self, database_path: &Path) -> PathBuf {
        match &self.backup_directory {
            Some(dir) => dir.clone(),
            None => database_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."))
                .join("backups"),
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.interval_hours) * 3600)
    }

    pub fn copy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.copy_timeout_secs)
    }
}

impl AppConfig {
    /// 从默认位置加载配置（读取 `.env`、配置文件与环境变量）
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let explicit = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let env = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true);
        Self::load_with(&path, explicit.is_some(), env)
    }

    /// 使用给定的文件与环境变量源加载配置
    ///
    /// `required` 为 true 时配置文件不存在会报错；否则跳过文件，只使用默认值与环境变量。
    pub fn load_with(
        path: &Path,
        required: bool,
        env: config::Environment,
    ) -> Result<Self, ConfigError> {
        let file_exists = path.is_file();
        let mut builder = config::Config::builder();
        if file_exists || required {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(required),
            );
        }
        let loaded = builder.add_source(env).build()?;
        let mut cfg: AppConfig = loaded.try_deserialize()?;

        if cfg.backup.config_file.is_none() && file_exists {
            cfg.backup.config_file = Some(path.to_path_buf());
        }
        cfg.backup.validate()?;

        tracing::info!(
            "[Config] 配置已加载: db={}, file={}, auto={}, interval={}h, retention={}d",
            cfg.database_path.display(),
            if file_exists {
                path.display().to_string()
            } else {
                "<none>".to_string()
            },
            cfg.backup.auto_backup_enabled,
            cfg.backup.interval_hours,
            cfg.backup.retention_days
        );
        Ok(cfg)
    }

    /// 便于测试：用显式键值构造环境变量源
    pub fn env_from_map(vars: HashMap<String, String>) -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .source(Some(vars))
    }

    pub fn backup_directory(&self) -> PathBuf {
        self.backup.effective_backup_directory(&self.database_path)
    }
}
