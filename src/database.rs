//! 记录存储
//!
//! 单个 SQLite 文件，保存认证记录、用户账号与审计日志。
//! 备份/恢复核心只通过 [`Database::path`] 把它当作不透明文件处理；
//! 恢复期间通过 [`Database::detach`] / [`Database::reattach`] 释放文件句柄。

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT UNIQUE NOT NULL,
        full_name TEXT,
        role TEXT NOT NULL DEFAULT 'viewer',
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        last_login TEXT
    );

    CREATE TABLE IF NOT EXISTS homologations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        real_name TEXT NOT NULL,
        logical_name TEXT,
        url TEXT,
        homologation_date TEXT,
        has_previous_versions INTEGER NOT NULL DEFAULT 0,
        repository_location TEXT,
        details TEXT,
        created_by INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS audit_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        user_id INTEGER,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        target_entity TEXT,
        old_values TEXT,
        new_values TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_homologations_real_name ON homologations(real_name);
    CREATE INDEX IF NOT EXISTS idx_audit_logs_timestamp ON audit_logs(timestamp);
    CREATE INDEX IF NOT EXISTS idx_audit_logs_action ON audit_logs(action);
"#;

pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    /// 维护模式：恢复期间连接被替换为内存库，活动文件不被占用
    maintenance_mode: AtomicBool,
}

impl Database {
    /// 打开（必要时创建）数据库并初始化表结构
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("创建数据库目录失败: {:?}", parent))?;
            }
        }

        let conn = Self::open_connection(db_path)?;
        let db = Database {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
            maintenance_mode: AtomicBool::new(false),
        };
        Ok(db)
    }

    fn open_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("打开数据库连接失败: {:?}", db_path))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("初始化数据库表结构失败")?;
        Ok(conn)
    }

    /// 活动数据库文件路径
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_in_maintenance(&self) -> bool {
        self.maintenance_mode.load(Ordering::SeqCst)
    }

    /// 获取连接；维护模式下拒绝访问
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        if self.is_in_maintenance() {
            anyhow::bail!("数据库处于维护模式（正在恢复备份）");
        }
        self.lock_conn()
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("获取数据库锁失败: {}", e))
    }

    /// 在连接上执行闭包
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn()?;
        f(&conn)
    }

    /// 将 WAL 内容写回主文件
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")
            .context("WAL checkpoint 失败")?;
        Ok(())
    }

    /// 进入维护模式：关闭文件连接，换成内存连接
    pub fn detach(&self) -> Result<()> {
        let mut conn = self.lock_conn()?;
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)") {
            tracing::warn!("[Database] 进入维护模式前 checkpoint 失败: {}", e);
        }
        let placeholder = Connection::open_in_memory().context("创建内存连接失败")?;
        let previous = std::mem::replace(&mut *conn, placeholder);
        if let Err((_, e)) = previous.close() {
            tracing::warn!("[Database] 关闭数据库连接失败: {}", e);
        }
        self.maintenance_mode.store(true, Ordering::SeqCst);
        tracing::info!("[Database] 已进入维护模式: {}", self.db_path.display());
        Ok(())
    }

    /// 退出维护模式：重新打开活动文件
    pub fn reattach(&self) -> Result<()> {
        let mut conn = self.lock_conn()?;
        *conn = Self::open_connection(&self.db_path)?;
        self.maintenance_mode.store(false, Ordering::SeqCst);
        tracing::info!("[Database] 已退出维护模式: {}", self.db_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table_exists(db: &Database, name: &str) -> bool {
        db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [name],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .unwrap()
    }

    #[test]
    fn test_new_creates_schema() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("nested").join("app.db")).unwrap();
        assert!(db.path().exists());
        for table in ["users", "homologations", "audit_logs"] {
            assert!(table_exists(&db, table), "缺少表 {}", table);
        }
    }

    #[test]
    fn test_detach_blocks_access_until_reattach() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("app.db")).unwrap();

        db.detach().unwrap();
        assert!(db.is_in_maintenance());
        assert!(db.conn().is_err(), "维护模式下不应允许访问");

        db.reattach().unwrap();
        assert!(!db.is_in_maintenance());
        assert!(table_exists(&db, "users"));
    }

    #[test]
    fn test_reattach_sees_replaced_file() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("app.db");
        let db = Database::new(&live).unwrap();

        // 在外部准备一个带数据的库，然后替换活动文件
        let other = dir.path().join("other.db");
        {
            let conn = Connection::open(&other).unwrap();
            conn.execute_batch("CREATE TABLE marker (v TEXT); INSERT INTO marker VALUES ('x');")
                .unwrap();
        }

        db.detach().unwrap();
        fs::rename(&other, &live).unwrap();
        db.reattach().unwrap();

        assert!(table_exists(&db, "marker"), "重新打开后应看到替换后的文件");
    }
}
