//! 备份管理器
//!
//! 把活动数据库、生效设置、原始配置文件和最近的日志打包成带时间戳的归档，
//! 并按保留期清理旧归档。
//!
//! ## 写入顺序
//!
//! 1. 通过 SQLite Backup API 把活动数据库复制为备份目录下的快照临时文件
//!    （其他连接可以继续写入，快照是某一时刻已提交的一致状态）
//! 2. 归档与元数据先写到备份目录下的 `*.tmp` 并 fsync
//! 3. 先 rename 元数据，再 rename 归档（可见的归档一定有元数据）
//! 4. 任一步失败都会删除全部临时/半成品文件；快照临时文件无论成败都会删除
//! 5. 成功后执行一次保留期清理（清理失败不影响备份结果）
//!
//! 管理器本身不加锁；同一时间只允许一个写操作由 `BackupService` 保证。

pub mod archive;
mod error;
mod metadata;
pub mod snapshot;

pub use error::BackupFailure;
pub use metadata::{ArchiveFileEntry, BackupKind, BackupMetadata, EntryKind, METADATA_VERSION};

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::backup_common::{
    calculate_file_hash, check_disk_space, log_and_skip_entry_err, remove_temp_file,
    sync_parent_dir,
};
use crate::clock::Clock;
use crate::config::{BackupSettings, ConfigError};
use archive::{
    archive_file_name, archive_id_from_file_name, archive_id_from_sidecar_name, archive_suffix,
    format_archive_id_with_suffix, is_backup_temp_file, is_valid_archive_id, parse_archive_id,
    restore_temp_path, sidecar_file_name, snapshot_file_name, temp_path_for, with_name_suffix,
    ArchivePlan, PRE_RESTORE_DIR,
};

/// 备份目录中的一个归档
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupArchive {
    pub archive_id: String,
    /// 由归档 ID 解析出的创建时间
    pub created_at: DateTime<Utc>,
    pub archive_path: PathBuf,
    pub size_bytes: u64,
    /// sidecar 可读时附带
    pub metadata: Option<BackupMetadata>,
}

impl BackupArchive {
    pub fn kind(&self) -> Option<BackupKind> {
        self.metadata.as_ref().map(|m| m.kind)
    }
}

/// 保留期清理中单个文件的失败（不会中断清理）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionSweepPartialFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// 保留期清理结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionReport {
    /// 早于此时间的归档被删除
    pub cutoff: DateTime<Utc>,
    pub deleted: Vec<String>,
    pub retained: usize,
    pub removed_orphans: Vec<PathBuf>,
    pub removed_temp_files: Vec<PathBuf>,
    pub failures: Vec<RetentionSweepPartialFailure>,
}

impl RetentionReport {
    fn new(cutoff: DateTime<Utc>) -> Self {
        Self {
            cutoff,
            deleted: Vec::new(),
            retained: 0,
            removed_orphans: Vec::new(),
            removed_temp_files: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, path: &Path, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("[Backup] 保留期清理失败（已跳过） {:?}: {}", path, reason);
        self.failures.push(RetentionSweepPartialFailure {
            path: path.to_path_buf(),
            reason,
        });
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// 备份统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupStatistics {
    pub total_backups: usize,
    pub total_size_bytes: u64,
    pub average_size_bytes: u64,
    pub newest: Option<DateTime<Utc>>,
    pub oldest: Option<DateTime<Utc>>,
    pub manual_count: usize,
    pub auto_count: usize,
    /// 元数据缺失或不可读的归档
    pub without_metadata: usize,
}

/// 删除临时文件的守卫；`disarm` 之前 drop 会清理全部路径
struct TempFileGuard {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl TempFileGuard {
    fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            for path in &self.paths {
                remove_temp_file(path);
            }
        }
    }
}

/// 备份管理器
pub struct BackupManager {
    database_path: PathBuf,
    settings: RwLock<BackupSettings>,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    /// 创建管理器，并清理上次异常退出留下的临时文件
    pub fn new(database_path: PathBuf, settings: BackupSettings, clock: Arc<dyn Clock>) -> Self {
        let manager = Self {
            database_path,
            settings: RwLock::new(settings),
            clock,
        };
        let removed = manager.cleanup_stale_temp_files();
        if removed > 0 {
            info!("[Backup] 启动时清理了 {} 个残留临时文件", removed);
        }
        manager
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 当前设置的快照
    pub fn settings(&self) -> BackupSettings {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 更新设置；下一次操作（或下一次调度）生效
    pub fn update_settings(&self, settings: BackupSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        info!(
            "[AutoBackup] 配置已更新: auto={}, interval={}h, retention={}d",
            settings.auto_backup_enabled, settings.interval_hours, settings.retention_days
        );
        match self.settings.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
        Ok(())
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.settings()
            .effective_backup_directory(&self.database_path)
    }

    pub fn archive_path(&self, archive_id: &str) -> PathBuf {
        self.backup_dir().join(archive_file_name(archive_id))
    }

    pub fn sidecar_path(&self, archive_id: &str) -> PathBuf {
        self.backup_dir().join(sidecar_file_name(archive_id))
    }

    /// 恢复前安全副本的位置
    pub fn safety_copy_path(&self) -> PathBuf {
        let name = self
            .database_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "database.db".into());
        self.backup_dir().join(PRE_RESTORE_DIR).join(name)
    }

    // ========================================================================
    // 创建
    // ========================================================================

    /// 创建一个新归档
    pub fn create_backup(
        &self,
        kind: BackupKind,
        description: Option<&str>,
    ) -> Result<BackupArchive, BackupFailure> {
        let settings = self.settings();
        let backup_dir = settings.effective_backup_directory(&self.database_path);
        let now = self.clock.now();
        let now = now.with_nanosecond(0).unwrap_or(now);

        info!(
            "[Backup] 开始创建备份: kind={}, db={:?}, dir={:?}",
            kind.as_str(),
            self.database_path,
            backup_dir
        );

        let live_size = fs::metadata(&self.database_path)
            .map_err(|e| {
                BackupFailure::read_source(format!("活动数据库 {:?}", self.database_path), e)
            })?
            .len();
        fs::create_dir_all(&backup_dir)
            .map_err(|e| BackupFailure::io(format!("创建备份目录 {:?}", backup_dir), e))?;
        check_disk_space(&backup_dir, live_size)?;

        let archive_id = next_archive_id(&backup_dir, &now);
        let created = {
            let snapshot_path = backup_dir.join(snapshot_file_name(&archive_id));
            // 快照只是中间产物，成功与否都删除
            let _snapshot_guard = TempFileGuard::new(vec![
                snapshot_path.clone(),
                with_name_suffix(&snapshot_path, "-journal"),
            ]);
            snapshot::snapshot_database(&self.database_path, &snapshot_path)?;

            let plan = archive::build_plan(&self.database_path, &snapshot_path, &settings, now)?;
            check_disk_space(&backup_dir, plan.total_size)?;

            self.write_backup_files(&backup_dir, &archive_id, &plan, kind, description, now)?
        };

        let report = self.apply_retention();
        if !report.is_complete() {
            warn!(
                "[Backup] 保留期清理部分失败: {} 个文件未能删除",
                report.failures.len()
            );
        }

        Ok(created)
    }

    /// 按计划写入归档与元数据（临时文件 + fsync + rename），失败时不留下任何文件
    fn write_backup_files(
        &self,
        backup_dir: &Path,
        archive_id: &str,
        plan: &ArchivePlan,
        kind: BackupKind,
        description: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<BackupArchive, BackupFailure> {
        let archive_path = backup_dir.join(archive_file_name(archive_id));
        let sidecar_path = backup_dir.join(sidecar_file_name(archive_id));
        let archive_tmp = temp_path_for(&archive_path);
        let sidecar_tmp = temp_path_for(&sidecar_path);
        let mut guard = TempFileGuard::new(vec![archive_tmp.clone(), sidecar_tmp.clone()]);

        let files = archive::write_archive(plan, &archive_tmp)?;
        let archive_sha256 = calculate_file_hash(&archive_tmp)
            .map_err(|e| BackupFailure::io("计算归档校验和", e))?;
        let archive_size = fs::metadata(&archive_tmp)
            .map_err(|e| BackupFailure::io("读取归档大小", e))?
            .len();

        let database_file = self
            .database_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let metadata = BackupMetadata {
            version: METADATA_VERSION,
            archive_id: archive_id.to_string(),
            created_at: now,
            kind,
            description: description
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: BackupMetadata::current_platform(),
            database_file,
            files,
            total_source_bytes: plan.total_size,
            archive_sha256,
            archive_size,
        };
        metadata.save_to_file(&sidecar_tmp)?;

        fs::rename(&sidecar_tmp, &sidecar_path)
            .map_err(|e| BackupFailure::io(format!("重命名元数据 {:?}", sidecar_path), e))?;
        if let Err(e) = fs::rename(&archive_tmp, &archive_path) {
            remove_temp_file(&sidecar_path);
            return Err(BackupFailure::io(
                format!("重命名归档 {:?}", archive_path),
                e,
            ));
        }
        guard.disarm();
        sync_parent_dir(&archive_path);

        info!(
            "[Backup] 备份完成: {} ({} 个文件, 源 {} 字节, 归档 {} 字节)",
            archive_id,
            metadata.files.len(),
            metadata.total_source_bytes,
            metadata.archive_size
        );

        Ok(BackupArchive {
            archive_id: archive_id.to_string(),
            created_at: now,
            archive_path,
            size_bytes: archive_size,
            metadata: Some(metadata),
        })
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 列出所有归档（最新的在前），不修改任何文件
    pub fn list_backups(&self) -> Result<Vec<BackupArchive>, BackupFailure> {
        let backup_dir = self.backup_dir();
        let mut backups = Vec::new();

        if !backup_dir.exists() {
            return Ok(backups);
        }

        let entries = fs::read_dir(&backup_dir)
            .map_err(|e| BackupFailure::io(format!("读取备份目录 {:?}", backup_dir), e))?;

        for entry in entries.filter_map(log_and_skip_entry_err) {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(archive_id) = archive_id_from_file_name(&name) else {
                continue;
            };
            let Some(created_at) = parse_archive_id(archive_id) else {
                continue;
            };
            let path = entry.path();
            let size_bytes = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => continue,
                Err(e) => {
                    warn!("[Backup] 读取归档元数据失败 {:?}: {}", path, e);
                    continue;
                }
            };

            let metadata = match BackupMetadata::load_from_file(
                &backup_dir.join(sidecar_file_name(archive_id)),
            ) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    debug!("[Backup] 归档 {} 的元数据不可用: {}", archive_id, e);
                    None
                }
            };

            backups.push(BackupArchive {
                archive_id: archive_id.to_string(),
                created_at,
                archive_path: path,
                size_bytes,
                metadata,
            });
        }

        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| archive_suffix(&b.archive_id).cmp(&archive_suffix(&a.archive_id)))
        });

        Ok(backups)
    }

    /// 读取归档元数据
    pub fn read_metadata(&self, archive_id: &str) -> Result<BackupMetadata, BackupFailure> {
        if !is_valid_archive_id(archive_id) {
            return Err(BackupFailure::NotFound(format!("无效的备份 ID: {}", archive_id)));
        }
        BackupMetadata::load_from_file(&self.sidecar_path(archive_id))
    }

    /// 备份统计
    pub fn statistics(&self) -> Result<BackupStatistics, BackupFailure> {
        let backups = self.list_backups()?;
        let total_size_bytes: u64 = backups.iter().map(|b| b.size_bytes).sum();
        let count_kind =
            |kind: BackupKind| backups.iter().filter(|b| b.kind() == Some(kind)).count();

        Ok(BackupStatistics {
            total_backups: backups.len(),
            total_size_bytes,
            average_size_bytes: if backups.is_empty() {
                0
            } else {
                total_size_bytes / backups.len() as u64
            },
            newest: backups.first().map(|b| b.created_at),
            oldest: backups.last().map(|b| b.created_at),
            manual_count: count_kind(BackupKind::Manual),
            auto_count: count_kind(BackupKind::Auto),
            without_metadata: backups.iter().filter(|b| b.metadata.is_none()).count(),
        })
    }

    // ========================================================================
    // 校验
    // ========================================================================

    /// 校验归档完整性；任何不一致都返回 false，不会报错
    pub fn verify_backup(&self, archive_id: &str) -> bool {
        match self.check_backup(archive_id) {
            Ok(_) => {
                debug!("[Backup] 备份校验通过: {}", archive_id);
                true
            }
            Err(e) => {
                warn!("[Backup] 备份校验失败 {}: {}", archive_id, e);
                false
            }
        }
    }

    /// 校验归档并返回其元数据
    pub fn check_backup(&self, archive_id: &str) -> Result<BackupMetadata, BackupFailure> {
        if !is_valid_archive_id(archive_id) {
            return Err(BackupFailure::NotFound(format!("无效的备份 ID: {}", archive_id)));
        }
        let archive_path = self.archive_path(archive_id);
        if !archive_path.is_file() {
            return Err(BackupFailure::NotFound(format!("备份不存在: {}", archive_id)));
        }

        let metadata = match BackupMetadata::load_from_file(&self.sidecar_path(archive_id)) {
            Ok(m) => m,
            Err(BackupFailure::NotFound(msg)) => return Err(BackupFailure::ArchiveInvalid(msg)),
            Err(e) => return Err(e),
        };
        if metadata.archive_id != archive_id {
            return Err(BackupFailure::ArchiveInvalid(format!(
                "元数据中的归档 ID 不一致: expected={}, actual={}",
                archive_id, metadata.archive_id
            )));
        }

        archive::verify_archive_contents(&archive_path, &metadata)?;
        Ok(metadata)
    }

    // ========================================================================
    // 删除与清理
    // ========================================================================

    /// 手动删除一个归档及其元数据
    pub fn delete_backup(&self, archive_id: &str) -> Result<BackupArchive, BackupFailure> {
        if !is_valid_archive_id(archive_id) {
            return Err(BackupFailure::NotFound(format!("无效的备份 ID: {}", archive_id)));
        }
        let archive_path = self.archive_path(archive_id);
        let sidecar_path = self.sidecar_path(archive_id);
        let size_bytes = match fs::metadata(&archive_path) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Err(BackupFailure::NotFound(format!("备份不存在: {}", archive_id))),
        };
        let metadata = BackupMetadata::load_from_file(&sidecar_path).ok();

        fs::remove_file(&archive_path)
            .map_err(|e| BackupFailure::io(format!("删除归档 {:?}", archive_path), e))?;
        if sidecar_path.exists() {
            if let Err(e) = fs::remove_file(&sidecar_path) {
                warn!("[Backup] 删除元数据失败 {:?}: {}", sidecar_path, e);
            }
        }
        info!("[Backup] 已删除备份: {}", archive_id);

        Ok(BackupArchive {
            archive_id: archive_id.to_string(),
            created_at: parse_archive_id(archive_id).unwrap_or_else(|| self.clock.now()),
            archive_path,
            size_bytes,
            metadata,
        })
    }

    /// 保留期清理
    ///
    /// 删除 `created_at` 严格早于 `now - retention_days` 的归档及其元数据，
    /// 同时删除孤立的元数据和早于截止时间的临时文件。
    /// 尽力而为：单个文件失败记入报告，不中断清理；重复执行结果相同。
    pub fn apply_retention(&self) -> RetentionReport {
        let settings = self.settings();
        let backup_dir = settings.effective_backup_directory(&self.database_path);
        let cutoff = self.clock.now() - Duration::days(i64::from(settings.retention_days));
        let mut report = RetentionReport::new(cutoff);

        if !backup_dir.exists() {
            return report;
        }

        let entries = match fs::read_dir(&backup_dir) {
            Ok(entries) => entries,
            Err(e) => {
                report.fail(&backup_dir, format!("读取备份目录失败: {}", e));
                return report;
            }
        };

        let mut archives = Vec::new();
        let mut sidecars = Vec::new();
        let mut temps = Vec::new();
        for entry in entries.filter_map(log_and_skip_entry_err) {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = archive_id_from_file_name(&name) {
                if let Some(created_at) = parse_archive_id(id) {
                    archives.push((id.to_string(), created_at, entry.path()));
                }
            } else if let Some(id) = archive_id_from_sidecar_name(&name) {
                sidecars.push((id.to_string(), entry.path()));
            } else if is_backup_temp_file(&name) {
                temps.push(entry.path());
            }
        }

        let mut live_ids = HashSet::new();
        for (archive_id, created_at, path) in archives {
            if created_at >= cutoff {
                report.retained += 1;
                live_ids.insert(archive_id);
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    let sidecar = backup_dir.join(sidecar_file_name(&archive_id));
                    if sidecar.exists() {
                        if let Err(e) = fs::remove_file(&sidecar) {
                            report.fail(&sidecar, e.to_string());
                        }
                    }
                    info!("[Backup] 删除过期备份: {}", archive_id);
                    report.deleted.push(archive_id);
                }
                Err(e) => {
                    report.fail(&path, e.to_string());
                    live_ids.insert(archive_id);
                }
            }
        }

        for (archive_id, path) in sidecars {
            if live_ids.contains(&archive_id) || !path.exists() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("[Backup] 删除孤立的元数据: {:?}", path);
                    report.removed_orphans.push(path);
                }
                Err(e) => report.fail(&path, e.to_string()),
            }
        }

        for path in temps {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from);
            match modified {
                Ok(modified) if modified < cutoff => match fs::remove_file(&path) {
                    Ok(()) => report.removed_temp_files.push(path),
                    Err(e) => report.fail(&path, e.to_string()),
                },
                Ok(_) => {}
                Err(e) => report.fail(&path, e.to_string()),
            }
        }

        info!(
            "[Backup] 保留期清理完成: 删除 {} 个，保留 {} 个，截止 {}",
            report.deleted.len(),
            report.retained,
            cutoff.to_rfc3339()
        );
        report
    }

    /// 清理残留的临时文件（备份目录中的 `backup_*.tmp`、安全副本临时文件、恢复临时文件）
    ///
    /// 只在没有写操作进行时调用（启动时）。返回删除的文件数。
    pub fn cleanup_stale_temp_files(&self) -> usize {
        let backup_dir = self.backup_dir();
        let mut candidates = Vec::new();

        for dir in [backup_dir.clone(), backup_dir.join(PRE_RESTORE_DIR)] {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.filter_map(log_and_skip_entry_err) {
                let name = entry.file_name().to_string_lossy().to_string();
                let is_temp = if dir == backup_dir {
                    is_backup_temp_file(&name)
                } else {
                    name.ends_with(archive::TEMP_SUFFIX)
                };
                if is_temp {
                    candidates.push(entry.path());
                }
            }
        }

        let restore_tmp = restore_temp_path(&self.database_path);
        if restore_tmp.exists() {
            candidates.push(restore_tmp);
        }

        let mut removed = 0;
        for path in candidates {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("[Backup] 删除残留临时文件: {:?}", path);
                    removed += 1;
                }
                Err(e) => warn!("[Backup] 删除残留临时文件失败 {:?}: {}", path, e),
            }
        }
        removed
    }
}

/// 生成未被占用的归档 ID（同一秒内的第二个归档追加 `_2`，依此类推）
fn next_archive_id(backup_dir: &Path, created_at: &DateTime<Utc>) -> String {
    let mut suffix = 1;
    loop {
        let id = format_archive_id_with_suffix(created_at, suffix);
        let archive = backup_dir.join(archive_file_name(&id));
        let sidecar = backup_dir.join(sidecar_file_name(&id));
        let taken = [
            archive.clone(),
            sidecar.clone(),
            temp_path_for(&archive),
            temp_path_for(&sidecar),
            backup_dir.join(snapshot_file_name(&id)),
        ]
        .iter()
        .any(|p| p.exists());
        if !taken {
            return id;
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use super::archive::{EntrySource, PlanEntry};
    use assert_matches::assert_matches;
    use rusqlite::Connection;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        clock: ManualClock,
        manager: BackupManager,
    }

    impl Fixture {
        fn db_path(&self) -> PathBuf {
            self.dir.path().join("homologador.db")
        }
    }

    fn seed_database(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS apps (id INTEGER PRIMARY KEY, payload BLOB NOT NULL);
             INSERT INTO apps (payload)
             WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 16)
             SELECT randomblob(512) FROM c;",
        )
        .unwrap();
    }

    /// 备份目录中以 `backup_` 开头或以 `.tmp` 结尾的文件
    fn backup_artifacts(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("backup_") || n.ends_with(".tmp"))
            .collect()
    }

    fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("homologador.db");
        seed_database(&db_path);
        let clock = ManualClock::at_ymd_hms(2026, 6, 1, 12, 0, 0);
        let manager =
            BackupManager::new(db_path, BackupSettings::default(), Arc::new(clock.clone()));
        Fixture {
            dir,
            clock,
            manager,
        }
    }

    #[test]
    fn test_create_backup_writes_archive_and_sidecar() {
        let fx = setup();
        let archive = fx
            .manager
            .create_backup(BackupKind::Manual, Some("  antes de migrar  "))
            .unwrap();

        assert_eq!(archive.archive_id, "backup_20260601_120000");
        assert!(archive.archive_path.exists());
        assert!(fx.manager.sidecar_path(&archive.archive_id).exists());
        assert_eq!(
            archive.archive_path.parent().unwrap(),
            fx.dir.path().join("backups"),
            "默认备份目录应在数据库旁边"
        );

        let meta = archive.metadata.as_ref().unwrap();
        assert_eq!(meta.kind, BackupKind::Manual);
        assert_eq!(meta.description.as_deref(), Some("antes de migrar"));
        assert_eq!(meta.database_file, "homologador.db");
        let db_entry = meta.database_entry().unwrap();
        assert_eq!(db_entry.size, fs::metadata(fx.db_path()).unwrap().len());
        assert_eq!(db_entry.source_path.as_deref(), Some(fx.db_path().as_path()));

        // 没有残留的临时文件（包括数据库快照）
        let leftovers: Vec<_> = backup_artifacts(&fx.manager.backup_dir())
            .into_iter()
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "不应残留临时文件: {:?}", leftovers);
    }

    #[test]
    fn test_plan_failure_removes_database_snapshot() {
        let fx = setup();
        let mut settings = fx.manager.settings();
        settings.config_file = Some(fx.dir.path().join("gone.toml"));
        fx.manager.update_settings(settings).unwrap();

        assert_matches!(
            fx.manager.create_backup(BackupKind::Manual, None),
            Err(BackupFailure::SourceUnreadable(_))
        );
        assert!(
            backup_artifacts(&fx.manager.backup_dir()).is_empty(),
            "快照临时文件应被删除"
        );
    }

    #[test]
    fn test_failed_archive_write_leaves_nothing_behind() {
        let fx = setup();
        let backup_dir = fx.manager.backup_dir();
        fs::create_dir_all(&backup_dir).unwrap();

        // 第一个条目已写入 ZIP，第二个条目的源文件不存在
        let plan = ArchivePlan {
            entries: vec![
                PlanEntry {
                    source: EntrySource::Bytes(vec![9u8; 64 * 1024]),
                    origin: None,
                    archive_path: "config/settings.json".to_string(),
                    kind: EntryKind::Settings,
                    size: 64 * 1024,
                },
                PlanEntry {
                    source: EntrySource::File(fx.dir.path().join("vanished.db")),
                    origin: None,
                    archive_path: "database/homologador.db".to_string(),
                    kind: EntryKind::Database,
                    size: 4096,
                },
            ],
            total_size: 64 * 1024 + 4096,
        };

        let result = fx.manager.write_backup_files(
            &backup_dir,
            "backup_20260601_120000",
            &plan,
            BackupKind::Manual,
            None,
            fx.clock.now(),
        );
        assert_matches!(result, Err(BackupFailure::SourceUnreadable(_)));
        assert!(
            backup_artifacts(&backup_dir).is_empty(),
            "写入失败后不应留下半成品: {:?}",
            backup_artifacts(&backup_dir)
        );
        assert!(fx.manager.list_backups().unwrap().is_empty());
    }

    #[test]
    fn test_create_then_verify_is_true() {
        let fx = setup();
        let archive = fx.manager.create_backup(BackupKind::Auto, None).unwrap();
        assert!(fx.manager.verify_backup(&archive.archive_id));
    }

    #[test]
    fn test_same_second_backups_get_suffix() {
        let fx = setup();
        let first = fx.manager.create_backup(BackupKind::Manual, None).unwrap();
        let second = fx.manager.create_backup(BackupKind::Manual, None).unwrap();
        let third = fx.manager.create_backup(BackupKind::Manual, None).unwrap();

        assert_eq!(first.archive_id, "backup_20260601_120000");
        assert_eq!(second.archive_id, "backup_20260601_120000_2");
        assert_eq!(third.archive_id, "backup_20260601_120000_3");
        assert_eq!(second.created_at, first.created_at);

        let listed: Vec<_> = fx
            .manager
            .list_backups()
            .unwrap()
            .into_iter()
            .map(|b| b.archive_id)
            .collect();
        assert_eq!(listed[0], third.archive_id, "同一秒内后创建的排在前面");
    }

    #[test]
    fn test_missing_database_fails_without_leftovers() {
        let fx = setup();
        fs::remove_file(fx.db_path()).unwrap();

        assert_matches!(
            fx.manager.create_backup(BackupKind::Manual, None),
            Err(BackupFailure::SourceUnreadable(_))
        );
        assert!(fx.manager.list_backups().unwrap().is_empty());
    }

    #[test]
    fn test_list_backups_newest_first_with_metadata() {
        let fx = setup();
        fx.manager.create_backup(BackupKind::Auto, None).unwrap();
        fx.clock.advance(Duration::hours(1));
        fx.manager.create_backup(BackupKind::Manual, None).unwrap();

        // 外来文件不应出现在列表中
        fs::write(fx.manager.backup_dir().join("notes.txt"), b"x").unwrap();

        let backups = fx.manager.list_backups().unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].archive_id, "backup_20260601_130000");
        assert_eq!(backups[0].kind(), Some(BackupKind::Manual));
        assert_eq!(backups[1].kind(), Some(BackupKind::Auto));
    }

    #[test]
    fn test_verify_false_on_tampered_or_missing() {
        let fx = setup();
        let archive = fx.manager.create_backup(BackupKind::Auto, None).unwrap();

        assert!(!fx.manager.verify_backup("backup_20990101_000000"));
        assert!(!fx.manager.verify_backup("../../etc/passwd"));

        let mut bytes = fs::read(&archive.archive_path).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xFF;
        fs::write(&archive.archive_path, bytes).unwrap();
        assert!(!fx.manager.verify_backup(&archive.archive_id));
    }

    #[test]
    fn test_verify_false_without_sidecar() {
        let fx = setup();
        let archive = fx.manager.create_backup(BackupKind::Auto, None).unwrap();
        fs::remove_file(fx.manager.sidecar_path(&archive.archive_id)).unwrap();

        assert!(!fx.manager.verify_backup(&archive.archive_id));
        assert_matches!(
            fx.manager.check_backup(&archive.archive_id),
            Err(BackupFailure::ArchiveInvalid(_))
        );
    }

    #[test]
    fn test_retention_strict_cutoff_and_idempotent() {
        let fx = setup();
        let now = fx.clock.now();

        for days in [29, 30, 31] {
            fx.clock.set(now - Duration::days(days));
            fx.manager.create_backup(BackupKind::Auto, None).unwrap();
        }
        fx.clock.set(now);

        let report = fx.manager.apply_retention();
        assert_eq!(report.deleted, vec!["backup_20260501_120000".to_string()]);
        assert_eq!(report.retained, 2, "正好 30 天的归档应保留");
        assert!(report.is_complete());

        let again = fx.manager.apply_retention();
        assert!(again.deleted.is_empty(), "重复清理不应再删除");
        assert_eq!(again.retained, 2);
    }

    #[test]
    fn test_retention_continues_past_undeletable_archive() {
        let fx = setup();
        let now = fx.clock.now();

        // 先创建新归档：之后在更早的时刻创建时，随创建执行的清理不会删到它
        fx.manager.create_backup(BackupKind::Auto, None).unwrap();
        for days in [40, 41, 42] {
            fx.clock.set(now - Duration::days(days));
            fx.manager.create_backup(BackupKind::Auto, None).unwrap();
        }
        fx.clock.set(now);

        // 把其中一个过期归档换成非空目录，remove_file 必然失败
        let stuck_id = "backup_20260421_120000";
        let stuck = fx.manager.archive_path(stuck_id);
        fs::remove_file(&stuck).unwrap();
        fs::create_dir(&stuck).unwrap();
        fs::write(stuck.join("inner"), b"x").unwrap();

        let report = fx.manager.apply_retention();
        assert_eq!(report.failures.len(), 1, "只有一个文件删除失败");
        assert_eq!(report.failures[0].path, stuck);
        let mut deleted = report.deleted.clone();
        deleted.sort();
        assert_eq!(
            deleted,
            vec![
                "backup_20260420_120000".to_string(),
                "backup_20260422_120000".to_string()
            ]
        );
        assert!(!fx.manager.archive_path("backup_20260420_120000").exists());
        assert!(!fx.manager.archive_path("backup_20260422_120000").exists());
        assert!(fx.manager.archive_path("backup_20260601_120000").exists());
        assert!(
            fx.manager.sidecar_path(stuck_id).exists(),
            "删除失败的归档应保留其元数据"
        );
    }

    #[test]
    fn test_retention_removes_orphan_sidecars_and_old_temps() {
        let fx = setup();
        let archive = fx.manager.create_backup(BackupKind::Auto, None).unwrap();
        fs::remove_file(&archive.archive_path).unwrap();

        // 时钟推进到很久以后，临时文件的修改时间早于截止时间
        let stale_tmp = fx.manager.backup_dir().join("backup_20200101_000000.archive.tmp");
        fs::write(&stale_tmp, b"partial").unwrap();
        fx.clock.advance(Duration::days(4000));

        let report = fx.manager.apply_retention();
        assert_eq!(report.removed_orphans.len(), 1);
        assert_eq!(report.removed_temp_files, vec![stale_tmp.clone()]);
        assert!(!fx.manager.sidecar_path(&archive.archive_id).exists());
        assert!(!stale_tmp.exists());
    }

    #[test]
    fn test_delete_backup() {
        let fx = setup();
        let archive = fx.manager.create_backup(BackupKind::Manual, None).unwrap();

        let deleted = fx.manager.delete_backup(&archive.archive_id).unwrap();
        assert_eq!(deleted.archive_id, archive.archive_id);
        assert!(deleted.metadata.is_some());
        assert!(!archive.archive_path.exists());
        assert!(!fx.manager.sidecar_path(&archive.archive_id).exists());

        assert_matches!(
            fx.manager.delete_backup(&archive.archive_id),
            Err(BackupFailure::NotFound(_))
        );
    }

    #[test]
    fn test_statistics() {
        let fx = setup();
        assert_eq!(fx.manager.statistics().unwrap().total_backups, 0);

        fx.manager.create_backup(BackupKind::Auto, None).unwrap();
        fx.clock.advance(Duration::days(1));
        fx.manager.create_backup(BackupKind::Manual, None).unwrap();
        fx.clock.advance(Duration::days(1));
        fx.manager.create_backup(BackupKind::Auto, None).unwrap();

        let stats = fx.manager.statistics().unwrap();
        assert_eq!(stats.total_backups, 3);
        assert_eq!(stats.auto_count, 2);
        assert_eq!(stats.manual_count, 1);
        assert_eq!(stats.without_metadata, 0);
        assert!(stats.newest > stats.oldest);
        assert_eq!(stats.average_size_bytes, stats.total_size_bytes / 3);
    }

    #[test]
    fn test_startup_cleanup_removes_leftover_temp_files() {
        let fx = setup();
        let backup_dir = fx.manager.backup_dir();
        fs::create_dir_all(backup_dir.join(PRE_RESTORE_DIR)).unwrap();
        fs::write(backup_dir.join("backup_20260601_120000.archive.tmp"), b"x").unwrap();
        fs::write(backup_dir.join(PRE_RESTORE_DIR).join("homologador.db.tmp"), b"x").unwrap();
        fs::write(restore_temp_path(&fx.db_path()), b"x").unwrap();
        fs::write(backup_dir.join("keep.tmp"), b"not ours").unwrap();

        let manager = BackupManager::new(
            fx.db_path(),
            BackupSettings::default(),
            Arc::new(fx.clock.clone()),
        );
        assert_eq!(manager.cleanup_stale_temp_files(), 0, "构造时已清理");
        assert!(backup_dir.join("keep.tmp").exists(), "非备份临时文件不应删除");
        assert!(!restore_temp_path(&fx.db_path()).exists());
    }

    #[test]
    fn test_update_settings_validates() {
        let fx = setup();
        let mut settings = fx.manager.settings();
        settings.retention_days = 0;
        assert!(fx.manager.update_settings(settings).is_err());

        let mut settings = fx.manager.settings();
        settings.retention_days = 7;
        fx.manager.update_settings(settings).unwrap();
        assert_eq!(fx.manager.settings().retention_days, 7);
    }
}
