//! 恢复操作
//!
//! 用归档中的数据库替换活动数据库。严格按以下顺序执行：
//!
//! 1. 校验归档；不通过（包括归档不存在）返回 `ArchiveInvalid`，不做任何改动
//! 2. 写入安全副本 `<backup_dir>/.pre_restore/<db file name>`（覆盖上一次的），fsync
//! 3. 确认安全副本存在、非空且与活动文件大小一致，否则 `SafetyCopyFailed`
//! 4. 把归档中的数据库解压到活动数据库旁的临时文件，校验 SHA256
//!    （可选 `PRAGMA integrity_check`），再原子 rename 覆盖活动文件，删除旧的 `-wal`/`-shm`
//! 5. 返回 [`RestoreResult`]
//!
//! rename 之前的任何失败都不会改动活动文件；第 2 步之后的错误都带上安全副本路径。
//! 调用方负责在恢复期间释放数据库连接（见 `Database::detach`）。

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::backup::archive::{extract_entry, restore_temp_path, temp_path_for, with_name_suffix};
use crate::backup::{BackupFailure, BackupManager, BackupMetadata};
use crate::backup_common::{remove_temp_file, sync_parent_dir};

/// 恢复结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreResult {
    pub archive_id: String,
    pub archive_created_at: DateTime<Utc>,
    pub safety_copy_path: PathBuf,
    pub restored_bytes: u64,
}

impl BackupManager {
    /// 从归档恢复活动数据库
    pub fn restore(&self, archive_id: &str) -> Result<RestoreResult, BackupFailure> {
        info!("[Restore] 开始恢复备份: {}", archive_id);

        // 1. 校验；归档缺失与损坏同样视为不可用
        let metadata = self.check_backup(archive_id).map_err(|e| {
            warn!("[Restore] 归档校验未通过，放弃恢复: {}", e);
            match e {
                BackupFailure::ArchiveInvalid(msg) | BackupFailure::NotFound(msg) => {
                    BackupFailure::ArchiveInvalid(msg)
                }
                other => BackupFailure::ArchiveInvalid(other.to_string()),
            }
        })?;
        let db_entry = metadata.database_entry().cloned().ok_or_else(|| {
            BackupFailure::ArchiveInvalid(format!("归档 {} 中没有数据库条目", archive_id))
        })?;

        let live_db = self.database_path().to_path_buf();

        // 2-3. 安全副本
        let safety_copy = self.safety_copy_path();
        write_safety_copy(&live_db, &safety_copy)?;
        confirm_safety_copy(&live_db, &safety_copy)?;
        info!("[Restore] 安全副本已写入: {:?}", safety_copy);

        // 4. 解压、校验、原子替换
        let verify_integrity = self.settings().verify_sqlite_integrity;
        let restored_bytes =
            swap_in_archived_database(self, &metadata, &db_entry, &live_db, verify_integrity)
                .map_err(|e| {
                    error!("[Restore] 恢复失败，活动数据库未被替换: {}", e);
                    e.with_safety_copy(&safety_copy)
                })?;

        info!(
            "[Restore] 恢复完成: {} -> {:?} ({} 字节)，安全副本保留在 {:?}",
            archive_id, live_db, restored_bytes, safety_copy
        );

        Ok(RestoreResult {
            archive_id: metadata.archive_id.clone(),
            archive_created_at: metadata.created_at,
            safety_copy_path: safety_copy,
            restored_bytes,
        })
    }
}

/// 复制活动数据库到安全副本位置（先写临时文件再 rename，覆盖上一次的副本）
fn write_safety_copy(live_db: &Path, safety_copy: &Path) -> Result<(), BackupFailure> {
    let failed = |what: &str, e: io::Error| {
        BackupFailure::SafetyCopyFailed(format!("{} {:?}: {}", what, safety_copy, e))
    };

    if let Some(parent) = safety_copy.parent() {
        fs::create_dir_all(parent).map_err(|e| failed("创建安全副本目录", e))?;
    }

    let source = File::open(live_db).map_err(|e| {
        BackupFailure::SafetyCopyFailed(format!("打开活动数据库 {:?}: {}", live_db, e))
    })?;
    let tmp = temp_path_for(safety_copy);
    let result = (|| -> io::Result<()> {
        let mut reader = BufReader::new(source);
        let mut out = File::create(&tmp)?;
        io::copy(&mut reader, &mut out)?;
        out.sync_all()?;
        drop(out);
        fs::rename(&tmp, safety_copy)
    })();

    if let Err(e) = result {
        remove_temp_file(&tmp);
        return Err(failed("写入安全副本", e));
    }
    sync_parent_dir(safety_copy);
    Ok(())
}

/// 确认安全副本存在、非空且与活动文件大小一致
fn confirm_safety_copy(live_db: &Path, safety_copy: &Path) -> Result<(), BackupFailure> {
    let copy_size = fs::metadata(safety_copy)
        .map_err(|e| {
            BackupFailure::SafetyCopyFailed(format!("安全副本不存在 {:?}: {}", safety_copy, e))
        })?
        .len();
    let live_size = fs::metadata(live_db)
        .map_err(|e| {
            BackupFailure::SafetyCopyFailed(format!("读取活动数据库 {:?}: {}", live_db, e))
        })?
        .len();

    if copy_size == 0 {
        return Err(BackupFailure::SafetyCopyFailed(format!(
            "安全副本为空: {:?}",
            safety_copy
        )));
    }
    if copy_size != live_size {
        return Err(BackupFailure::SafetyCopyFailed(format!(
            "安全副本大小 {} 与活动数据库 {} 不一致",
            copy_size, live_size
        )));
    }
    Ok(())
}

fn swap_in_archived_database(
    manager: &BackupManager,
    metadata: &BackupMetadata,
    db_entry: &crate::backup::ArchiveFileEntry,
    live_db: &Path,
    verify_integrity: bool,
) -> Result<u64, BackupFailure> {
    let archive_path = manager.archive_path(&metadata.archive_id);
    let tmp = restore_temp_path(live_db);

    let prepared = extract_entry(&archive_path, db_entry, &tmp).and_then(|size| {
        if verify_integrity {
            check_sqlite_integrity(&tmp)?;
        }
        Ok(size)
    });
    let restored_bytes = match prepared {
        Ok(size) => size,
        Err(e) => {
            remove_sqlite_files(&tmp);
            return Err(e);
        }
    };

    if let Err(e) = fs::rename(&tmp, live_db) {
        remove_sqlite_files(&tmp);
        return Err(BackupFailure::io(
            format!("替换活动数据库 {:?}", live_db),
            e,
        ));
    }
    sync_parent_dir(live_db);

    for suffix in ["-wal", "-shm", "-journal"] {
        let side = with_name_suffix(live_db, suffix);
        if side.exists() {
            if let Err(e) = fs::remove_file(&side) {
                warn!("[Restore] 删除旧的 {} 文件失败 {:?}: {}", suffix, side, e);
            }
        }
    }

    Ok(restored_bytes)
}

/// `PRAGMA integrity_check`
fn check_sqlite_integrity(db_path: &Path) -> Result<(), BackupFailure> {
    let result = (|| -> rusqlite::Result<String> {
        let conn = Connection::open(db_path)?;
        let value: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        drop(conn);
        Ok(value)
    })();

    match result {
        Ok(value) if value == "ok" => Ok(()),
        Ok(value) => Err(BackupFailure::ArchiveInvalid(format!(
            "数据库完整性检查失败: {}",
            value
        ))),
        Err(e) => Err(BackupFailure::ArchiveInvalid(format!(
            "无法打开归档中的数据库: {}",
            e
        ))),
    }
}

/// 删除临时数据库及其 SQLite 附属文件
fn remove_sqlite_files(path: &Path) {
    remove_temp_file(path);
    for suffix in ["-wal", "-shm", "-journal"] {
        remove_temp_file(&with_name_suffix(path, suffix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::{write_archive, ArchivePlan, EntrySource, PlanEntry};
    use crate::backup::{BackupKind, EntryKind};
    use crate::backup_common::calculate_file_hash;
    use crate::clock::ManualClock;
    use crate::config::BackupSettings;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sqlite_file(path: &Path, marker: &str) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS marker (v TEXT); DELETE FROM marker;",
        )
        .unwrap();
        conn.execute("INSERT INTO marker (v) VALUES (?1)", [marker])
            .unwrap();
    }

    fn read_marker(path: &Path) -> String {
        let conn = Connection::open(path).unwrap();
        conn.query_row("SELECT v FROM marker", [], |row| row.get(0))
            .unwrap()
    }

    fn setup() -> (TempDir, PathBuf, BackupManager) {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("homologador.db");
        sqlite_file(&db, "v1");
        let clock = ManualClock::at_ymd_hms(2026, 7, 1, 10, 0, 0);
        let manager = BackupManager::new(db.clone(), BackupSettings::default(), Arc::new(clock));
        (dir, db, manager)
    }

    #[test]
    fn test_restore_replaces_live_database_and_keeps_safety_copy() {
        let (_dir, db, manager) = setup();
        let archive = manager.create_backup(BackupKind::Manual, None).unwrap();

        sqlite_file(&db, "v2");
        assert_eq!(read_marker(&db), "v2");

        let result = manager.restore(&archive.archive_id).unwrap();
        assert_eq!(result.archive_id, archive.archive_id);
        assert_eq!(read_marker(&db), "v1", "应恢复到归档中的数据");
        assert_eq!(read_marker(&result.safety_copy_path), "v2", "安全副本应为恢复前的数据");
        assert!(result
            .safety_copy_path
            .ends_with(Path::new(".pre_restore").join("homologador.db")));
        assert!(!restore_temp_path(&db).exists());
    }

    #[test]
    fn test_restore_tampered_archive_leaves_live_untouched() {
        let (_dir, db, manager) = setup();
        let archive = manager.create_backup(BackupKind::Manual, None).unwrap();
        sqlite_file(&db, "current");
        let before = fs::read(&db).unwrap();

        let mut bytes = fs::read(&archive.archive_path).unwrap();
        let last = bytes.len() - 30;
        bytes[last] ^= 0x5A;
        fs::write(&archive.archive_path, bytes).unwrap();

        let err = manager.restore(&archive.archive_id).unwrap_err();
        assert_matches!(err, BackupFailure::ArchiveInvalid(_));
        assert!(err.safety_copy_path().is_none());
        assert_eq!(fs::read(&db).unwrap(), before, "活动数据库必须逐字节不变");
        assert!(!manager.safety_copy_path().exists(), "校验失败时不应写安全副本");
    }

    #[test]
    fn test_restore_missing_archive_is_invalid() {
        let (_dir, db, manager) = setup();
        let before = fs::read(&db).unwrap();

        for id in ["backup_20300101_000000", "../homologador"] {
            let err = manager.restore(id).unwrap_err();
            assert_matches!(err, BackupFailure::ArchiveInvalid(_), "id={}", id);
            assert!(err.safety_copy_path().is_none());
        }
        assert_eq!(fs::read(&db).unwrap(), before);
        assert!(!manager.safety_copy_path().exists(), "不应写安全副本");
    }

    #[test]
    fn test_restore_without_live_database_fails_safety_copy() {
        let (_dir, db, manager) = setup();
        let archive = manager.create_backup(BackupKind::Manual, None).unwrap();
        fs::remove_file(&db).unwrap();

        assert_matches!(
            manager.restore(&archive.archive_id),
            Err(BackupFailure::SafetyCopyFailed(_))
        );
        assert!(!db.exists(), "安全副本失败时不应创建活动数据库");
    }

    #[test]
    fn test_integrity_check_rejects_non_sqlite_payload() {
        let (_dir, db, manager) = setup();
        let archive = manager.create_backup(BackupKind::Manual, None).unwrap();
        let before = fs::read(&db).unwrap();

        // 用非 SQLite 内容重写归档，并同步更新元数据：归档本身仍然完整
        let mut metadata = archive.metadata.clone().unwrap();
        let plan = ArchivePlan {
            entries: vec![PlanEntry {
                source: EntrySource::Bytes(vec![0xABu8; 4096]),
                origin: Some(db.clone()),
                archive_path: metadata.database_entry().unwrap().archive_path.clone(),
                kind: EntryKind::Database,
                size: 4096,
            }],
            total_size: 4096,
        };
        metadata.files = write_archive(&plan, &archive.archive_path).unwrap();
        metadata.total_source_bytes = plan.total_size;
        metadata.archive_sha256 = calculate_file_hash(&archive.archive_path).unwrap();
        metadata.archive_size = fs::metadata(&archive.archive_path).unwrap().len();
        metadata
            .save_to_file(&manager.sidecar_path(&archive.archive_id))
            .unwrap();
        assert!(manager.verify_backup(&archive.archive_id));

        let err = manager.restore(&archive.archive_id).unwrap_err();
        assert_matches!(err.root(), BackupFailure::ArchiveInvalid(_));
        assert_eq!(err.safety_copy_path(), Some(manager.safety_copy_path().as_path()));
        assert_eq!(fs::read(&db).unwrap(), before);
        assert!(!restore_temp_path(&db).exists(), "临时文件应被清理");
    }
}
