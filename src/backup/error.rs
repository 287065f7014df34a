//! 备份 / 恢复错误类型

use std::io;
use std::path::{Path, PathBuf};

/// 备份与恢复的类型化失败原因
///
/// 所有文件 I/O 失败都会映射到其中一种，附带底层原因文本。不做重试。
#[derive(Debug, thiserror::Error)]
pub enum BackupFailure {
    #[error("Source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("Disk full: {0}")]
    DiskFull(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Archive invalid: {0}")]
    ArchiveInvalid(String),

    #[error("Safety copy failed: {0}")]
    SafetyCopyFailed(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Another backup or restore is in progress")]
    Busy,

    #[error("Unknown error: {0}")]
    Unknown(String),

    /// 安全副本已写入之后发生的失败
    #[error("{reason} (safety copy available at {})", .safety_copy_path.display())]
    AfterSafetyCopy {
        reason: Box<BackupFailure>,
        safety_copy_path: PathBuf,
    },
}

impl BackupFailure {
    /// 写入侧 I/O 错误的映射（备份目录、临时文件、重命名）
    pub fn io(context: impl AsRef<str>, err: io::Error) -> Self {
        let message = format!("{}: {}", context.as_ref(), err);
        if is_disk_full(&err) {
            return BackupFailure::DiskFull(message);
        }
        match err.kind() {
            io::ErrorKind::PermissionDenied => BackupFailure::PermissionDenied(message),
            _ => BackupFailure::Unknown(message),
        }
    }

    /// 读取源文件（活动数据库、配置文件）时的 I/O 错误映射
    pub fn read_source(context: impl AsRef<str>, err: io::Error) -> Self {
        let message = format!("{}: {}", context.as_ref(), err);
        match err.kind() {
            io::ErrorKind::PermissionDenied => BackupFailure::PermissionDenied(message),
            _ => BackupFailure::SourceUnreadable(message),
        }
    }

    /// 给安全副本之后的错误附上副本路径（已附加的不重复包装）
    pub fn with_safety_copy(self, path: &Path) -> Self {
        match self {
            already @ BackupFailure::AfterSafetyCopy { .. } => already,
            other => BackupFailure::AfterSafetyCopy {
                reason: Box::new(other),
                safety_copy_path: path.to_path_buf(),
            },
        }
    }

    /// 去掉安全副本包装后的根本原因
    pub fn root(&self) -> &BackupFailure {
        match self {
            BackupFailure::AfterSafetyCopy { reason, .. } => reason.root(),
            other => other,
        }
    }

    pub fn safety_copy_path(&self) -> Option<&Path> {
        match self {
            BackupFailure::AfterSafetyCopy {
                safety_copy_path, ..
            } => Some(safety_copy_path.as_path()),
            _ => None,
        }
    }
}

impl From<zip::result::ZipError> for BackupFailure {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => BackupFailure::io("ZIP I/O", e),
            other => BackupFailure::ArchiveInvalid(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BackupFailure {
    fn from(err: serde_json::Error) -> Self {
        BackupFailure::Unknown(format!("元数据序列化失败: {}", err))
    }
}

fn is_disk_full(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            return true;
        }
    }
    #[cfg(windows)]
    {
        // ERROR_DISK_FULL / ERROR_HANDLE_DISK_FULL
        if matches!(err.raw_os_error(), Some(112) | Some(39)) {
            return true;
        }
    }
    let _ = err;
    false
}
