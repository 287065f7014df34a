//! 备份服务
//!
//! 显式持有所有协作组件（不使用进程级单例）：
//! - `BackupManager`：归档读写
//! - `Database`：恢复期间进入维护模式
//! - `AuditRecorder`：记录 `backup_created` / `restore_performed` / `backup_deleted`
//! - 操作锁：单许可的 `Semaphore`，同一时间只允许一个备份/恢复/删除
//!
//! 手动操作等待锁；调度器使用 `try_acquire`，锁被占用时直接跳过。
//! 阻塞的文件操作放到 `spawn_blocking` 中执行，许可随闭包移动，
//! 超时只影响调用方的等待，许可直到阻塞任务真正结束才释放。

use serde_json::json;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

use crate::audit::{actions, AuditRecorder};
use crate::backup::{
    BackupArchive, BackupFailure, BackupKind, BackupManager, BackupStatistics,
};
use crate::config::{BackupSettings, ConfigError};
use crate::database::Database;
use crate::features::AvailableFeatures;
use crate::models::Actor;
use crate::restore::RestoreResult;

/// 备份/恢复操作锁
#[derive(Debug, Clone)]
pub struct OperationLock {
    semaphore: Arc<Semaphore>,
}

impl Default for OperationLock {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLock {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// 等待获取许可
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BackupFailure> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackupFailure::Unknown("备份信号量已关闭".to_string()))
    }

    /// 立即尝试获取许可；被占用时返回 `Busy`
    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit, BackupFailure> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                tokio::sync::TryAcquireError::NoPermits => BackupFailure::Busy,
                tokio::sync::TryAcquireError::Closed => {
                    BackupFailure::Unknown("备份信号量已关闭".to_string())
                }
            })
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

pub struct BackupService {
    manager: Arc<BackupManager>,
    database: Arc<Database>,
    audit: Arc<dyn AuditRecorder>,
    lock: OperationLock,
    features: AvailableFeatures,
}

impl BackupService {
    pub fn new(
        manager: Arc<BackupManager>,
        database: Arc<Database>,
        audit: Arc<dyn AuditRecorder>,
        features: AvailableFeatures,
    ) -> Self {
        Self {
            manager,
            database,
            audit,
            lock: OperationLock::new(),
            features,
        }
    }

    pub fn manager(&self) -> &Arc<BackupManager> {
        &self.manager
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn features(&self) -> &AvailableFeatures {
        &self.features
    }

    pub fn operation_lock(&self) -> &OperationLock {
        &self.lock
    }

    pub fn is_busy(&self) -> bool {
        self.lock.is_busy()
    }

    pub fn settings(&self) -> BackupSettings {
        self.manager.settings()
    }

    /// 更新备份设置；调度器在下一次触发时读取新值
    pub fn update_settings(&self, settings: BackupSettings) -> Result<(), ConfigError> {
        self.manager.update_settings(settings)
    }

    // ========================================================================
    // 写操作（持有操作锁）
    // ========================================================================

    /// 手动备份：等待正在进行的操作结束后执行
    pub async fn create_backup(
        &self,
        actor: &Actor,
        description: Option<String>,
    ) -> Result<BackupArchive, BackupFailure> {
        let permit = self.lock.acquire().await?;
        self.create_backup_with_permit(permit, actor, BackupKind::Manual, description)
            .await
    }

    /// 调度触发的备份：锁被占用时返回 `Busy`，不排队
    pub async fn try_create_scheduled_backup(&self) -> Result<BackupArchive, BackupFailure> {
        let permit = self.lock.try_acquire()?;
        self.create_backup_with_permit(permit, &Actor::system(), BackupKind::Auto, None)
            .await
    }

    async fn create_backup_with_permit(
        &self,
        permit: OwnedSemaphorePermit,
        actor: &Actor,
        kind: BackupKind,
        description: Option<String>,
    ) -> Result<BackupArchive, BackupFailure> {
        let manager = self.manager.clone();
        let database = self.database.clone();

        let archive = self
            .run_blocking(permit, move || {
                if let Err(e) = database.checkpoint() {
                    warn!("[Backup] 备份前 checkpoint 失败（继续备份）: {}", e);
                }
                manager.create_backup(kind, description.as_deref())
            })
            .await
            .map_err(|e| {
                error!("[Backup] 创建备份失败 ({}): {}", kind.as_str(), e);
                e
            })?;

        let details = json!({
            "archive_id": archive.archive_id,
            "kind": kind.as_str(),
            "size_bytes": archive.size_bytes,
            "description": archive.metadata.as_ref().and_then(|m| m.description.clone()),
        });
        self.audit.record(
            actor,
            actions::BACKUP_CREATED,
            Some(&format!("backup:{}", archive.archive_id)),
            None,
            Some(&details),
        );
        Ok(archive)
    }

    /// 从归档恢复：等待锁，数据库进入维护模式，恢复后重新打开
    ///
    /// 无论成功失败都会记录 `restore_performed`。
    pub async fn restore(
        &self,
        actor: &Actor,
        archive_id: &str,
    ) -> Result<RestoreResult, BackupFailure> {
        let permit = self.lock.acquire().await?;
        let manager = self.manager.clone();
        let database = self.database.clone();
        let id = archive_id.to_string();

        let result = self
            .run_blocking(permit, move || {
                database
                    .detach()
                    .map_err(|e| BackupFailure::Unknown(format!("无法释放数据库连接: {}", e)))?;
                let restored = manager.restore(&id);
                if let Err(e) = database.reattach() {
                    error!("[Restore] 重新打开数据库失败: {}", e);
                    if restored.is_ok() {
                        return Err(BackupFailure::Unknown(format!(
                            "恢复完成但重新打开数据库失败: {}",
                            e
                        )));
                    }
                }
                restored
            })
            .await;

        let details = match &result {
            Ok(r) => json!({
                "archive_id": r.archive_id,
                "success": true,
                "safety_copy_path": r.safety_copy_path.to_string_lossy(),
                "restored_bytes": r.restored_bytes,
            }),
            Err(e) => json!({
                "archive_id": archive_id,
                "success": false,
                "error": e.to_string(),
                "safety_copy_path": e.safety_copy_path().map(|p| p.to_string_lossy().to_string()),
            }),
        };
        self.audit.record(
            actor,
            actions::RESTORE_PERFORMED,
            Some(&format!("backup:{}", archive_id)),
            None,
            Some(&details),
        );

        match &result {
            Ok(r) => info!("[Restore] {} 已恢复备份 {}", actor, r.archive_id),
            Err(e) => error!("[Restore] {} 恢复备份 {} 失败: {}", actor, archive_id, e),
        }
        result
    }

    /// 手动删除归档（需要管理员权限由调用方判断）
    pub async fn delete_backup(
        &self,
        actor: &Actor,
        archive_id: &str,
    ) -> Result<BackupArchive, BackupFailure> {
        let permit = self.lock.acquire().await?;
        let manager = self.manager.clone();
        let id = archive_id.to_string();

        let deleted = self
            .run_blocking(permit, move || manager.delete_backup(&id))
            .await?;

        let before = json!({
            "archive_id": deleted.archive_id,
            "created_at": deleted.created_at.to_rfc3339(),
            "size_bytes": deleted.size_bytes,
            "kind": deleted.kind().map(|k| k.as_str()),
        });
        self.audit.record(
            actor,
            actions::BACKUP_DELETED,
            Some(&format!("backup:{}", archive_id)),
            Some(&before),
            None,
        );
        Ok(deleted)
    }

    // ========================================================================
    // 只读操作
    // ========================================================================

    pub async fn list_backups(&self) -> Result<Vec<BackupArchive>, BackupFailure> {
        let manager = self.manager.clone();
        run_unlocked(move || manager.list_backups()).await
    }

    pub async fn verify_backup(&self, archive_id: &str) -> bool {
        let manager = self.manager.clone();
        let id = archive_id.to_string();
        run_unlocked(move || Ok(manager.verify_backup(&id)))
            .await
            .unwrap_or(false)
    }

    pub async fn statistics(&self) -> Result<BackupStatistics, BackupFailure> {
        let manager = self.manager.clone();
        run_unlocked(move || manager.statistics()).await
    }

    /// 在阻塞线程池中执行，许可随闭包移动
    async fn run_blocking<T, F>(
        &self,
        permit: OwnedSemaphorePermit,
        f: F,
    ) -> Result<T, BackupFailure>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BackupFailure> + Send + 'static,
    {
        let timeout = self.manager.settings().copy_timeout();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(BackupFailure::Unknown(format!(
                "后台任务异常: {}",
                join_err
            ))),
            Err(_) => {
                warn!(
                    "[Backup] 操作超过 {} 秒未完成，后台任务仍在运行",
                    timeout.as_secs()
                );
                Err(BackupFailure::Unknown("timed out".to_string()))
            }
        }
    }
}

async fn run_unlocked<T, F>(f: F) -> Result<T, BackupFailure>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BackupFailure> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupFailure::Unknown(format!("后台任务异常: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditFilter, AuditLogger};
    use crate::clock::{Clock, ManualClock};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        clock: ManualClock,
        audit: Arc<AuditLogger>,
        service: BackupService,
    }

    fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("homologador.db");
        let database = Arc::new(Database::new(&db_path).unwrap());
        let clock = ManualClock::at_ymd_hms(2026, 8, 10, 9, 30, 0);
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let settings = BackupSettings::default();
        let manager = Arc::new(BackupManager::new(db_path, settings.clone(), shared_clock.clone()));
        let audit = Arc::new(AuditLogger::new(database.clone(), shared_clock));
        let features = AvailableFeatures::detect(&settings, &manager.backup_dir());
        let service = BackupService::new(manager, database, audit.clone(), features);
        Fixture {
            _dir: dir,
            clock,
            audit,
            service,
        }
    }

    fn admin() -> Actor {
        Actor {
            user_id: Some(1),
            username: "admin".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_backup_is_audited() {
        let fx = setup();
        let archive = fx
            .service
            .create_backup(&admin(), Some("manual".to_string()))
            .await
            .unwrap();

        assert!(fx.service.verify_backup(&archive.archive_id).await);
        let entries = fx
            .audit
            .query(AuditFilter {
                action: Some(actions::BACKUP_CREATED.to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor, "admin#1");
        assert_eq!(
            entries[0].target_entity.as_deref(),
            Some(format!("backup:{}", archive.archive_id).as_str())
        );
        assert!(!fx.service.is_busy(), "操作结束后应释放锁");
    }

    #[tokio::test]
    async fn test_scheduled_backup_skipped_while_busy() {
        let fx = setup();
        let permit = fx.service.operation_lock().try_acquire().unwrap();

        assert_matches!(
            fx.service.try_create_scheduled_backup().await,
            Err(BackupFailure::Busy)
        );
        assert!(fx.service.list_backups().await.unwrap().is_empty());

        drop(permit);
        let archive = fx.service.try_create_scheduled_backup().await.unwrap();
        assert_eq!(archive.kind(), Some(BackupKind::Auto));
    }

    #[tokio::test]
    async fn test_restore_is_audited_on_success_and_failure() {
        let fx = setup();
        let archive = fx.service.create_backup(&admin(), None).await.unwrap();
        fx.clock.advance(chrono::Duration::minutes(5));

        let result = fx
            .service
            .restore(&admin(), &archive.archive_id)
            .await
            .unwrap();
        assert_eq!(result.archive_id, archive.archive_id);
        assert!(!fx.service.database().is_in_maintenance(), "恢复后应退出维护模式");

        let missing = fx
            .service
            .restore(&admin(), "backup_20000101_000000")
            .await;
        assert_matches!(missing, Err(BackupFailure::ArchiveInvalid(_)));

        let restores = fx
            .audit
            .query(AuditFilter {
                action: Some(actions::RESTORE_PERFORMED.to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(restores.len(), 2);
        assert_eq!(restores[0].new_values.as_ref().unwrap()["success"], false);
        assert_eq!(restores[1].new_values.as_ref().unwrap()["success"], true);
    }

    #[tokio::test]
    async fn test_delete_backup_is_audited() {
        let fx = setup();
        let archive = fx.service.create_backup(&admin(), None).await.unwrap();

        fx.service
            .delete_backup(&admin(), &archive.archive_id)
            .await
            .unwrap();
        assert_eq!(fx.service.statistics().await.unwrap().total_backups, 0);
        assert_eq!(fx.audit.count_by_action(actions::BACKUP_DELETED).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_settings_rejects_invalid() {
        let fx = setup();
        let mut settings = fx.service.settings();
        settings.interval_hours = 0;
        assert!(fx.service.update_settings(settings).is_err());
        assert_eq!(fx.service.settings().interval_hours, 24);
    }
}
