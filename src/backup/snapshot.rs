//! 活动数据库的一致性快照
//!
//! 通过 SQLite Backup API 把活动数据库复制到备份目录下的临时文件，
//! 再由归档写入流程压缩。复制期间其他连接仍可写入；
//! Backup API 保证得到的是某一时刻已提交的状态，不会包含写到一半的事务。

use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::fs::{self, File};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::BackupFailure;

/// 每次 step 复制全部页面：一次读事务内完成，源库在此期间不会被提交覆盖
const PAGES_PER_STEP: i32 = -1;
const BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(50);
const MAX_BUSY_RETRIES: u32 = 200;

/// 把 `live_db` 复制到 `target`（会先删除已存在的 `target`），返回快照大小
pub fn snapshot_database(live_db: &Path, target: &Path) -> Result<u64, BackupFailure> {
    let meta = File::open(live_db)
        .and_then(|f| f.metadata())
        .map_err(|e| BackupFailure::read_source(format!("活动数据库 {:?}", live_db), e))?;
    if !meta.is_file() {
        return Err(BackupFailure::SourceUnreadable(format!(
            "活动数据库不是普通文件: {:?}",
            live_db
        )));
    }

    // 只读打开，避免在数据库缺失时意外创建空库
    let src_conn = Connection::open_with_flags(
        live_db,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| source_failure(live_db, e))?;

    if target.exists() {
        fs::remove_file(target)
            .map_err(|e| BackupFailure::io(format!("删除旧的快照文件 {:?}", target), e))?;
    }
    let mut dest_conn = Connection::open(target).map_err(|e| target_failure(target, e))?;

    debug!("[Backup] 使用 Backup API 复制: {:?} -> {:?}", live_db, target);
    {
        let backup = Backup::new(&src_conn, &mut dest_conn).map_err(|e| target_failure(target, e))?;
        let mut busy_retries = 0;
        loop {
            let step = backup
                .step(PAGES_PER_STEP)
                .map_err(|e| source_failure(live_db, e))?;
            match step {
                StepResult::Done => break,
                StepResult::More => {}
                _ => {
                    busy_retries += 1;
                    if busy_retries > MAX_BUSY_RETRIES {
                        return Err(BackupFailure::Unknown(format!(
                            "活动数据库持续被锁定，无法完成快照: {:?}",
                            live_db
                        )));
                    }
                    std::thread::sleep(BUSY_RETRY_INTERVAL);
                }
            }
        }
    }

    if let Err((_, e)) = dest_conn.close() {
        return Err(target_failure(target, e));
    }
    drop(src_conn);

    let snapshot = File::open(target)
        .map_err(|e| BackupFailure::io(format!("打开快照文件 {:?}", target), e))?;
    snapshot
        .sync_all()
        .map_err(|e| BackupFailure::io(format!("同步快照文件 {:?}", target), e))?;
    let size = snapshot
        .metadata()
        .map_err(|e| BackupFailure::io(format!("读取快照大小 {:?}", target), e))?
        .len();
    Ok(size)
}

fn sqlite_code(err: &rusqlite::Error) -> Option<ErrorCode> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => Some(e.code),
        _ => None,
    }
}

fn source_failure(live_db: &Path, err: rusqlite::Error) -> BackupFailure {
    let message = format!("读取活动数据库 {:?}: {}", live_db, err);
    match sqlite_code(&err) {
        Some(ErrorCode::PermissionDenied) => BackupFailure::PermissionDenied(message),
        Some(ErrorCode::DiskFull) => BackupFailure::DiskFull(message),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            BackupFailure::Unknown(message)
        }
        _ => BackupFailure::SourceUnreadable(message),
    }
}

fn target_failure(target: &Path, err: rusqlite::Error) -> BackupFailure {
    let message = format!("写入快照文件 {:?}: {}", target, err);
    match sqlite_code(&err) {
        Some(ErrorCode::DiskFull) => BackupFailure::DiskFull(message),
        Some(ErrorCode::PermissionDenied) | Some(ErrorCode::ReadOnly) => {
            BackupFailure::PermissionDenied(message)
        }
        _ => BackupFailure::Unknown(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn seeded_db(path: &Path, rows: i64) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, data BLOB NOT NULL)")
            .unwrap();
        conn.execute(
            "INSERT INTO items (data)
             WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < ?1)
             SELECT randomblob(1024) FROM c",
            [rows],
        )
        .unwrap();
    }

    #[test]
    fn test_snapshot_copies_committed_rows() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live.db");
        let target = dir.path().join("backup_x.snapshot.tmp");
        seeded_db(&live, 50);
        fs::write(&target, b"stale").unwrap();

        let size = snapshot_database(&live, &target).unwrap();
        assert_eq!(size, fs::metadata(&live).unwrap().len());

        let conn = Connection::open(&target).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 50);
    }

    #[test]
    fn test_snapshot_of_snapshot_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live.db");
        seeded_db(&live, 20);

        let first = dir.path().join("first.tmp");
        let second = dir.path().join("second.tmp");
        snapshot_database(&live, &first).unwrap();
        snapshot_database(&first, &second).unwrap();
        assert_eq!(
            fs::read(&first).unwrap(),
            fs::read(&second).unwrap(),
            "快照再快照应逐字节一致"
        );
    }

    #[test]
    fn test_missing_or_foreign_source() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.tmp");

        let missing = dir.path().join("missing.db");
        assert_matches!(
            snapshot_database(&missing, &target),
            Err(BackupFailure::SourceUnreadable(_))
        );
        assert!(!missing.exists(), "不应创建缺失的数据库文件");

        let foreign = dir.path().join("foreign.db");
        fs::write(&foreign, vec![0xABu8; 4096]).unwrap();
        assert_matches!(
            snapshot_database(&foreign, &target),
            Err(BackupFailure::SourceUnreadable(_))
        );
    }
}
