//! 归档元数据（sidecar `.meta.json`）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::BackupFailure;

/// 元数据格式版本
pub const METADATA_VERSION: u32 = 1;

/// 备份来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// 用户手动触发
    Manual,
    /// 调度器触发
    Auto,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::Auto => "auto",
        }
    }
}

/// 归档条目类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Database,
    /// 生效设置快照 `config/settings.json`
    Settings,
    /// 原始配置文件
    Config,
    Log,
}

/// 归档中的单个文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveFileEntry {
    /// 归档内路径（`/` 分隔）
    pub archive_path: String,
    /// 源文件路径；生成的内容（设置快照）为 None
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    pub kind: EntryKind,
    pub size: u64,
    pub sha256: String,
}

/// 归档元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub version: u32,
    pub archive_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: BackupKind,
    #[serde(default)]
    pub description: Option<String>,
    pub app_version: String,
    pub platform: String,
    /// 活动数据库文件名（恢复时用于定位）
    pub database_file: String,
    pub files: Vec<ArchiveFileEntry>,
    pub total_source_bytes: u64,
    pub archive_sha256: String,
    pub archive_size: u64,
}

impl BackupMetadata {
    pub fn current_platform() -> String {
        format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
    }

    /// 数据库条目
    pub fn database_entry(&self) -> Option<&ArchiveFileEntry> {
        self.files.iter().find(|f| f.kind == EntryKind::Database)
    }

    pub fn log_count(&self) -> usize {
        self.files.iter().filter(|f| f.kind == EntryKind::Log).count()
    }

    /// 写入元数据并 fsync
    ///
    /// 只负责写入给定路径；原子替换（临时文件 + rename）由调用方完成。
    pub fn save_to_file(&self, path: &Path) -> Result<(), BackupFailure> {
        let json = serde_json::to_vec_pretty(self)?;
        let mut file = File::create(path)
            .map_err(|e| BackupFailure::io(format!("创建元数据文件 {:?}", path), e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| BackupFailure::io(format!("写入元数据文件 {:?}", path), e))?;
        Ok(())
    }

    /// 从文件加载元数据
    pub fn load_from_file(path: &Path) -> Result<Self, BackupFailure> {
        let content = fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackupFailure::NotFound(format!("元数据文件不存在: {:?}", path))
            } else {
                BackupFailure::io(format!("读取元数据文件 {:?}", path), e)
            }
        })?;
        let metadata: BackupMetadata = serde_json::from_slice(&content).map_err(|e| {
            BackupFailure::ArchiveInvalid(format!("解析元数据失败 {:?}: {}", path, e))
        })?;
        if metadata.version > METADATA_VERSION {
            return Err(BackupFailure::ArchiveInvalid(format!(
                "元数据版本 {} 高于当前支持的版本 {}",
                metadata.version, METADATA_VERSION
            )));
        }
        Ok(metadata)
    }
}
