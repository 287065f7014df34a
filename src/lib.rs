// Homologador library entry
// 数据安全核心：记录存储、备份 / 恢复、自动备份调度与审计日志。
// bin 目标（src/main.rs）只负责组装组件并启动调度器。

pub mod audit;
pub mod backup;
pub mod backup_common;
pub mod clock;
pub mod config;
pub mod database;
pub mod features;
pub mod homologation;
pub mod logging;
pub mod models;
pub mod restore;
pub mod scheduler;
pub mod service;

pub use audit::{AuditEntry, AuditFilter, AuditLogger, AuditRecorder};
pub use backup::{
    BackupArchive, BackupFailure, BackupKind, BackupManager, BackupMetadata, BackupStatistics,
    RetentionReport,
};
pub use clock::{Clock, SystemClock};
pub use config::{AppConfig, BackupSettings, ConfigError};
pub use database::Database;
pub use features::AvailableFeatures;
pub use models::{Actor, AppError, AppErrorType};
pub use restore::RestoreResult;
pub use scheduler::{AutoBackupScheduler, SchedulerHandle};
pub use service::BackupService;
