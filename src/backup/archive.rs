//! 归档容器：命名规则、备份计划、ZIP 写入与逐条目校验
//!
//! 目录布局：
//! ```text
//! <backup_directory>/
//!   backup_<YYYYMMDD_HHMMSS>.archive      ZIP 容器（deflate）
//!   backup_<YYYYMMDD_HHMMSS>.meta.json    sidecar 元数据
//!   .pre_restore/<db file name>           恢复前安全副本
//! ```
//! 归档内路径：`database/`、`config/`、`logs/`。

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::FileOptions;

use super::metadata::{ArchiveFileEntry, BackupMetadata, EntryKind};
use super::BackupFailure;
use crate::backup_common::{
    calculate_bytes_hash, calculate_file_hash, check_zip_security, copy_with_hash,
    is_safe_entry_name, is_symlink,
};
use crate::config::BackupSettings;

pub const ARCHIVE_PREFIX: &str = "backup_";
pub const ARCHIVE_EXTENSION: &str = ".archive";
pub const SIDECAR_EXTENSION: &str = ".meta.json";
pub const TEMP_SUFFIX: &str = ".tmp";
pub const PRE_RESTORE_DIR: &str = ".pre_restore";
pub const SETTINGS_SNAPSHOT_PATH: &str = "config/settings.json";

const ID_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";
/// `YYYYMMDD_HHMMSS`
const ID_TIME_LEN: usize = 15;

// ============================================================================
// 命名
// ============================================================================

/// 由创建时间生成归档 ID（不含冲突后缀）
pub fn format_archive_id(created_at: &DateTime<Utc>) -> String {
    format!("{}{}", ARCHIVE_PREFIX, created_at.format(ID_TIME_FORMAT))
}

/// 带冲突后缀的归档 ID：`backup_..._2`、`backup_..._3`
pub fn format_archive_id_with_suffix(created_at: &DateTime<Utc>, suffix: u32) -> String {
    if suffix <= 1 {
        format_archive_id(created_at)
    } else {
        format!("{}_{}", format_archive_id(created_at), suffix)
    }
}

/// 从归档 ID 解析创建时间（忽略数字后缀）
pub fn parse_archive_id(archive_id: &str) -> Option<DateTime<Utc>> {
    let rest = archive_id.strip_prefix(ARCHIVE_PREFIX)?;
    let stamp = rest.get(..ID_TIME_LEN)?;
    let suffix = &rest[ID_TIME_LEN..];
    if !suffix.is_empty() {
        let digits = suffix.strip_prefix('_')?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }
    let naive = NaiveDateTime::parse_from_str(stamp, ID_TIME_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// 冲突后缀序号（无后缀为 1），用于同一秒内多个归档的排序
pub fn archive_suffix(archive_id: &str) -> u32 {
    archive_id
        .strip_prefix(ARCHIVE_PREFIX)
        .and_then(|rest| rest.get(ID_TIME_LEN..))
        .and_then(|s| s.strip_prefix('_'))
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(1)
}

/// 归档 ID 是否合法（同时防止路径穿越）
pub fn is_valid_archive_id(archive_id: &str) -> bool {
    parse_archive_id(archive_id).is_some()
}

pub fn archive_file_name(archive_id: &str) -> String {
    format!("{}{}", archive_id, ARCHIVE_EXTENSION)
}

pub fn sidecar_file_name(archive_id: &str) -> String {
    format!("{}{}", archive_id, SIDECAR_EXTENSION)
}

/// 创建归档时数据库快照的临时文件名，同样匹配 `backup_*.tmp`
pub fn snapshot_file_name(archive_id: &str) -> String {
    format!("{}.snapshot{}", archive_id, TEMP_SUFFIX)
}

/// 从 `backup_*.archive` 文件名取出归档 ID
pub fn archive_id_from_file_name(file_name: &str) -> Option<&str> {
    let id = file_name.strip_suffix(ARCHIVE_EXTENSION)?;
    is_valid_archive_id(id).then_some(id)
}

/// 从 `backup_*.meta.json` 文件名取出归档 ID
pub fn archive_id_from_sidecar_name(file_name: &str) -> Option<&str> {
    let id = file_name.strip_suffix(SIDECAR_EXTENSION)?;
    is_valid_archive_id(id).then_some(id)
}

/// 是否为备份过程留下的临时文件
pub fn is_backup_temp_file(file_name: &str) -> bool {
    file_name.starts_with(ARCHIVE_PREFIX) && file_name.ends_with(TEMP_SUFFIX)
}

pub fn temp_path_for(path: &Path) -> PathBuf {
    with_name_suffix(path, TEMP_SUFFIX)
}

/// 恢复时解压数据库用的临时文件，与活动数据库同目录（保证 rename 原子）
pub fn restore_temp_path(live_db: &Path) -> PathBuf {
    with_name_suffix(live_db, ".restore.tmp")
}

/// 在文件名后追加后缀，例如 `app.db` + `-wal`
pub fn with_name_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

// ============================================================================
// 备份计划
// ============================================================================

/// 条目内容来源
#[derive(Debug, Clone)]
pub enum EntrySource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub source: EntrySource,
    /// 写入元数据的原始路径；数据库条目指向活动数据库而不是快照
    pub origin: Option<PathBuf>,
    pub archive_path: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// 一次备份要写入的全部内容
#[derive(Debug, Default)]
pub struct ArchivePlan {
    pub entries: Vec<PlanEntry>,
    pub total_size: u64,
}

impl ArchivePlan {
    fn push(&mut self, entry: PlanEntry) {
        self.total_size += entry.size;
        self.entries.push(entry);
    }
}

/// 构建备份计划
///
/// 数据库条目的内容取自 `database_snapshot`（见 [`super::snapshot`]），
/// 条目名与元数据中的来源仍使用 `database_path`。
/// 快照（或配置的原始配置文件）缺失、不可读时返回 `SourceUnreadable`。
pub fn build_plan(
    database_path: &Path,
    database_snapshot: &Path,
    settings: &BackupSettings,
    now: DateTime<Utc>,
) -> Result<ArchivePlan, BackupFailure> {
    let mut plan = ArchivePlan::default();

    let db_name = file_name_string(database_path).ok_or_else(|| {
        BackupFailure::SourceUnreadable(format!("无效的数据库路径: {:?}", database_path))
    })?;
    let db_size = readable_file_size(database_snapshot, "数据库快照")?;
    plan.push(PlanEntry {
        source: EntrySource::File(database_snapshot.to_path_buf()),
        origin: Some(database_path.to_path_buf()),
        archive_path: format!("database/{}", db_name),
        kind: EntryKind::Database,
        size: db_size,
    });

    let snapshot = serde_json::to_vec_pretty(settings)?;
    plan.push(PlanEntry {
        size: snapshot.len() as u64,
        source: EntrySource::Bytes(snapshot),
        origin: None,
        archive_path: SETTINGS_SNAPSHOT_PATH.to_string(),
        kind: EntryKind::Settings,
    });

    if let Some(config_file) = &settings.config_file {
        let name = file_name_string(config_file).ok_or_else(|| {
            BackupFailure::SourceUnreadable(format!("无效的配置文件路径: {:?}", config_file))
        })?;
        let size = readable_file_size(config_file, "配置文件")?;
        let archive_path = format!("config/{}", name);
        if archive_path != SETTINGS_SNAPSHOT_PATH {
            plan.push(PlanEntry {
                source: EntrySource::File(config_file.clone()),
                origin: Some(config_file.clone()),
                archive_path,
                kind: EntryKind::Config,
                size,
            });
        }
    }

    if let Some(log_dir) = &settings.log_directory {
        let since = now - Duration::days(i64::from(settings.log_window_days));
        for entry in collect_recent_logs(log_dir, since) {
            plan.push(entry);
        }
    }

    Ok(plan)
}

fn file_name_string(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}

/// 确认源文件存在、可打开，返回大小
fn readable_file_size(path: &Path, label: &str) -> Result<u64, BackupFailure> {
    let context = || format!("{} {:?}", label, path);
    let file = File::open(path).map_err(|e| BackupFailure::read_source(context(), e))?;
    let meta = file
        .metadata()
        .map_err(|e| BackupFailure::read_source(context(), e))?;
    if !meta.is_file() {
        return Err(BackupFailure::SourceUnreadable(format!(
            "{} 不是普通文件: {:?}",
            label, path
        )));
    }
    Ok(meta.len())
}

/// 收集日志目录中在 `since` 之后修改过的 `*.log` 文件
///
/// 跳过符号链接；单个文件读取失败只记录日志。
pub fn collect_recent_logs(log_dir: &Path, since: DateTime<Utc>) -> Vec<PlanEntry> {
    let mut entries = Vec::new();

    if !log_dir.is_dir() {
        tracing::debug!("[Backup] 日志目录不存在，跳过日志收集: {:?}", log_dir);
        return entries;
    }
    if is_symlink(log_dir) {
        tracing::warn!("[Backup] 跳过符号链接的日志目录: {:?}", log_dir);
        return entries;
    }

    for entry in WalkDir::new(log_dir).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!("[Backup] 遍历日志目录失败: {}", err);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!("[Backup] 读取日志文件元数据失败 {:?}: {}", path, err);
                continue;
            }
        };
        let modified = match metadata.modified() {
            Ok(t) => DateTime::<Utc>::from(t),
            Err(err) => {
                tracing::warn!("[Backup] 读取日志修改时间失败 {:?}: {}", path, err);
                continue;
            }
        };
        if modified < since {
            continue;
        }

        let relative = match path.strip_prefix(log_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");

        entries.push(PlanEntry {
            source: EntrySource::File(path.to_path_buf()),
            origin: Some(path.to_path_buf()),
            archive_path: format!("logs/{}", relative),
            kind: EntryKind::Log,
            size: metadata.len(),
        });
    }

    entries
}

// ============================================================================
// 写入
// ============================================================================

/// 按计划把所有条目流式写入 ZIP 容器，并 fsync
///
/// 返回每个条目的大小与 SHA256（边写边算）。
pub fn write_archive(
    plan: &ArchivePlan,
    target: &Path,
) -> Result<Vec<ArchiveFileEntry>, BackupFailure> {
    let file = File::create(target)
        .map_err(|e| BackupFailure::io(format!("创建归档文件 {:?}", target), e))?;
    let mut zip = zip::ZipWriter::new(file);

    let mut written = Vec::with_capacity(plan.entries.len());
    for entry in &plan.entries {
        let options = FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .large_file(entry.size >= u64::from(u32::MAX))
            .unix_permissions(0o644);
        zip.start_file(entry.archive_path.as_str(), options)?;

        let write_failed =
            |e: io::Error| BackupFailure::io(format!("写入归档条目 {}", entry.archive_path), e);
        let (size, sha256) = match &entry.source {
            EntrySource::File(path) => {
                let source = File::open(path).map_err(|e| {
                    BackupFailure::read_source(format!("打开源文件 {:?}", path), e)
                })?;
                let mut reader = BufReader::with_capacity(64 * 1024, source);
                copy_with_hash(&mut reader, &mut zip).map_err(write_failed)?
            }
            EntrySource::Bytes(bytes) => {
                zip.write_all(bytes).map_err(write_failed)?;
                (bytes.len() as u64, calculate_bytes_hash(bytes))
            }
        };

        written.push(ArchiveFileEntry {
            archive_path: entry.archive_path.clone(),
            source_path: entry.origin.clone(),
            kind: entry.kind,
            size,
            sha256,
        });
    }

    let mut file = zip.finish()?;
    file.flush()
        .and_then(|_| file.sync_all())
        .map_err(|e| BackupFailure::io(format!("同步归档文件 {:?}", target), e))?;

    Ok(written)
}

// ============================================================================
// 校验与提取
// ============================================================================

/// 校验归档容器与其中每个条目
///
/// 1. 容器大小与 SHA256 与元数据一致
/// 2. 通过 ZIP 炸弹检测
/// 3. 条目数量一致，每个条目的大小与 SHA256 一致
pub fn verify_archive_contents(
    archive_path: &Path,
    metadata: &BackupMetadata,
) -> Result<(), BackupFailure> {
    let actual_size = fs::metadata(archive_path)
        .map_err(|e| {
            BackupFailure::ArchiveInvalid(format!("读取归档失败 {:?}: {}", archive_path, e))
        })?
        .len();
    if actual_size != metadata.archive_size {
        return Err(BackupFailure::ArchiveInvalid(format!(
            "归档大小不匹配: expected={}, actual={}",
            metadata.archive_size, actual_size
        )));
    }

    let actual_hash = calculate_file_hash(archive_path)
        .map_err(|e| BackupFailure::ArchiveInvalid(format!("计算归档校验和失败: {}", e)))?;
    if actual_hash != metadata.archive_sha256 {
        return Err(BackupFailure::ArchiveInvalid(format!(
            "归档校验和不匹配: expected={}, actual={}",
            metadata.archive_sha256, actual_hash
        )));
    }

    check_zip_security(archive_path)?.validate()?;

    let file = File::open(archive_path)
        .map_err(|e| BackupFailure::ArchiveInvalid(format!("打开归档失败: {}", e)))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| BackupFailure::ArchiveInvalid(format!("解析归档失败: {}", e)))?;

    if zip.len() != metadata.files.len() {
        return Err(BackupFailure::ArchiveInvalid(format!(
            "归档条目数量不匹配: expected={}, actual={}",
            metadata.files.len(),
            zip.len()
        )));
    }

    for expected in &metadata.files {
        if !is_safe_entry_name(&expected.archive_path) {
            return Err(BackupFailure::ArchiveInvalid(format!(
                "不安全的归档条目路径: {}",
                expected.archive_path
            )));
        }
        let mut entry = zip.by_name(&expected.archive_path).map_err(|e| {
            BackupFailure::ArchiveInvalid(format!("缺少归档条目 {}: {}", expected.archive_path, e))
        })?;
        let (size, hash) = copy_with_hash(&mut entry, &mut io::sink()).map_err(|e| {
            BackupFailure::ArchiveInvalid(format!(
                "读取归档条目 {} 失败: {}",
                expected.archive_path, e
            ))
        })?;
        if size != expected.size || hash != expected.sha256 {
            return Err(BackupFailure::ArchiveInvalid(format!(
                "条目校验失败 {}: expected size={} sha256={}, actual size={} sha256={}",
                expected.archive_path, expected.size, expected.sha256, size, hash
            )));
        }
    }

    Ok(())
}

/// 把单个条目解压到目标文件并 fsync，校验大小与 SHA256
pub fn extract_entry(
    archive_path: &Path,
    expected: &ArchiveFileEntry,
    target: &Path,
) -> Result<u64, BackupFailure> {
    let file = File::open(archive_path)
        .map_err(|e| BackupFailure::ArchiveInvalid(format!("打开归档失败: {}", e)))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| BackupFailure::ArchiveInvalid(format!("解析归档失败: {}", e)))?;
    let mut entry = zip.by_name(&expected.archive_path).map_err(|e| {
        BackupFailure::ArchiveInvalid(format!("缺少归档条目 {}: {}", expected.archive_path, e))
    })?;

    let mut out = File::create(target)
        .map_err(|e| BackupFailure::io(format!("创建临时文件 {:?}", target), e))?;
    let (size, hash) = copy_with_hash(&mut entry, &mut out)
        .map_err(|e| BackupFailure::io(format!("解压条目 {}", expected.archive_path), e))?;
    out.sync_all()
        .map_err(|e| BackupFailure::io(format!("同步临时文件 {:?}", target), e))?;

    if size != expected.size || hash != expected.sha256 {
        return Err(BackupFailure::ArchiveInvalid(format!(
            "解压后的 {} 与元数据不一致: size={} sha256={}",
            expected.archive_path, size, hash
        )));
    }
    Ok(size)
}
