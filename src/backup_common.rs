//! 备份系统共享组件
//!
//! 提供备份与恢复共用的工具函数
//! - SHA256计算: 用于文件完整性校验（支持边复制边计算）
//! - 安全防护: ZIP炸弹检测、符号链接防护
//! - 磁盘空间检查: 写入前预估可用空间

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::backup::BackupFailure;
type Result<T> = std::result::Result<T, BackupFailure>;

/// 记录并跳过迭代中的错误，避免 `.flatten()` 静默丢弃
///
/// 适用于 `read_dir` / `WalkDir` 等迭代场景。
pub fn log_and_skip_entry_err<T, E: std::fmt::Display>(
    result: std::result::Result<T, E>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("[BackupCommon] Directory entry read error (skipped): {}", e);
            None
        }
    }
}

// ============================================================================
// 安全常量 - 防止 ZIP 炸弹和资源耗尽攻击
// ============================================================================

/// 最大允许解压总大小: 10GB
pub const MAX_UNCOMPRESSED_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// 最大允许单文件大小: 2GB
pub const MAX_SINGLE_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// 最大允许压缩比 (解压后大小 / 压缩大小)
/// 正常备份压缩比通常在 2-10 之间，超过 100 可能是 ZIP 炸弹
pub const MAX_COMPRESSION_RATIO: u64 = 100;

/// 最大允许文件数量（一个归档只有数据库、配置和少量日志）
pub const MAX_FILE_COUNT: usize = 10_000;

/// 极端压缩比阈值，超过此值视为 ZIP 炸弹
pub const EXTREME_COMPRESSION_RATIO: u64 = 1000;

/// 磁盘空间安全余量（20%）
pub const DISK_SPACE_MARGIN: f64 = 1.2;

const HASH_BUFFER_SIZE: usize = 8192;

/// 计算文件的SHA256哈希值
///
/// 使用8KB缓冲区分块读取，适合处理大文件而不会占用过多内存
pub fn calculate_file_hash(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let (_, hash) = copy_with_hash(&mut reader, &mut io::sink())?;
    Ok(hash)
}

/// 计算字节数组的SHA256哈希值
pub fn calculate_bytes_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// 从 reader 复制到 writer，同时计算 SHA256
///
/// 返回 (字节数, 十六进制哈希)。写入归档、解压到临时文件、
/// 校验归档条目（writer 为 `io::sink()`）都走这一条路径。
pub fn copy_with_hash<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
) -> io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
        writer.write_all(&buffer[..bytes_read])?;
        total += bytes_read as u64;
    }

    Ok((total, format!("{:x}", hasher.finalize())))
}

/// fsync 父目录，确保 rename 后的目录项持久化
pub fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// 删除临时文件，失败只记录日志
pub fn remove_temp_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!("[BackupCommon] 清理临时文件失败 {:?}: {}", path, e);
        }
    }
}

// ============================================================================
// ZIP 炸弹检测
// ============================================================================

/// ZIP 安全验证结果
#[derive(Debug)]
pub struct ZipSecurityCheck {
    pub total_uncompressed_size: u64,
    pub total_compressed_size: u64,
    pub file_count: usize,
    pub compression_ratio: f64,
    pub largest_file_size: u64,
    pub largest_file_name: String,
}

impl ZipSecurityCheck {
    /// 验证 ZIP 文件是否安全
    pub fn validate(&self) -> Result<()> {
        if self.total_uncompressed_size > MAX_UNCOMPRESSED_SIZE {
            return Err(BackupFailure::ArchiveInvalid(format!(
                "ZIP 文件解压后大小 ({:.2} GB) 超过最大限制 ({:.2} GB)，可能是 ZIP 炸弹",
                self.total_uncompressed_size as f64 / 1024.0 / 1024.0 / 1024.0,
                MAX_UNCOMPRESSED_SIZE as f64 / 1024.0 / 1024.0 / 1024.0
            )));
        }

        if self.largest_file_size > MAX_SINGLE_FILE_SIZE {
            return Err(BackupFailure::ArchiveInvalid(format!(
                "ZIP 中文件 '{}' 大小 ({:.2} GB) 超过单文件限制 ({:.2} GB)",
                self.largest_file_name,
                self.largest_file_size as f64 / 1024.0 / 1024.0 / 1024.0,
                MAX_SINGLE_FILE_SIZE as f64 / 1024.0 / 1024.0 / 1024.0
            )));
        }

        // SQLite 空页压缩比可能很高，只对极端压缩比报错
        if self.compression_ratio > EXTREME_COMPRESSION_RATIO as f64 {
            return Err(BackupFailure::ArchiveInvalid(format!(
                "ZIP 炸弹检测：压缩比 {:.1} 超过极限阈值 {}",
                self.compression_ratio, EXTREME_COMPRESSION_RATIO
            )));
        } else if self.compression_ratio > MAX_COMPRESSION_RATIO as f64 {
            tracing::warn!(
                "[BackupCommon] ZIP 压缩比较高 ({:.1} > {})",
                self.compression_ratio,
                MAX_COMPRESSION_RATIO
            );
        }

        if self.file_count > MAX_FILE_COUNT {
            return Err(BackupFailure::ArchiveInvalid(format!(
                "ZIP 文件包含 {} 个文件，超过最大限制 {}",
                self.file_count, MAX_FILE_COUNT
            )));
        }

        Ok(())
    }
}

/// 对 ZIP 文件进行安全检查
///
/// 在解压或逐条目校验前检测 ZIP 炸弹
pub fn check_zip_security(zip_path: &Path) -> Result<ZipSecurityCheck> {
    let file = File::open(zip_path)
        .map_err(|e| BackupFailure::ArchiveInvalid(format!("打开 ZIP 文件失败: {}", e)))?;

    let compressed_size = file.metadata().map(|m| m.len()).unwrap_or(0);

    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| BackupFailure::ArchiveInvalid(format!("解析 ZIP 文件失败: {}", e)))?;

    let file_count = archive.len();
    let mut total_uncompressed = 0u64;
    let mut largest_size = 0u64;
    let mut largest_name = String::new();

    for i in 0..file_count {
        let file = archive
            .by_index(i)
            .map_err(|e| BackupFailure::ArchiveInvalid(format!("读取 ZIP 条目失败: {}", e)))?;

        let size = file.size();
        total_uncompressed = total_uncompressed.saturating_add(size);

        if size > largest_size {
            largest_size = size;
            largest_name = file.name().to_string();
        }
    }

    let compression_ratio = if compressed_size > 0 {
        total_uncompressed as f64 / compressed_size as f64
    } else {
        0.0
    };

    Ok(ZipSecurityCheck {
        total_uncompressed_size: total_uncompressed,
        total_compressed_size: compressed_size,
        file_count,
        compression_ratio,
        largest_file_size: largest_size,
        largest_file_name: largest_name,
    })
}

/// 归档条目名是否安全（无绝对路径、无 `..`）
pub fn is_safe_entry_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.starts_with('\\')
        && !name.contains(':')
        && name
            .split(['/', '\\'])
            .all(|part| !part.is_empty() && part != "..")
}

// ============================================================================
// 符号链接检测
// ============================================================================

/// 检查路径是否为符号链接
///
/// 使用 symlink_metadata 而非 metadata，避免跟随符号链接。
/// 无法读取元数据时返回 `true`（视为符号链接）。
pub fn is_symlink(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(meta) => meta.file_type().is_symlink(),
        Err(e) => {
            tracing::warn!(
                "[BackupCommon] 无法读取路径元数据 {:?}: {}，视为符号链接并跳过",
                path,
                e
            );
            true
        }
    }
}

// ============================================================================
// 磁盘空间检查
// ============================================================================

/// 获取指定路径所在磁盘的可用空间（字节）
///
/// 使用系统 API（Unix: statvfs, Windows: GetDiskFreeSpaceExW）。
/// 路径不存在时向上查找第一个存在的祖先目录。
pub fn get_available_disk_space(path: &Path) -> io::Result<u64> {
    let check_path = existing_ancestor(path);

    #[cfg(unix)]
    {
        get_disk_space_statvfs(&check_path)
    }

    #[cfg(windows)]
    {
        get_disk_space_win32(&check_path)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = check_path;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "当前平台不支持磁盘空间查询",
        ))
    }
}

fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = Some(path);
    while let Some(p) = current {
        if p.exists() {
            return p.to_path_buf();
        }
        current = p.parent();
    }
    #[cfg(windows)]
    {
        PathBuf::from("C:\\")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/")
    }
}

/// Unix: 使用 libc::statvfs 系统调用获取磁盘可用空间
///
/// f_bavail * f_frsize = 非特权用户可用的字节数。
#[cfg(unix)]
fn get_disk_space_statvfs(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("路径包含空字节，无法传递给 statvfs: {}", e),
        )
    })?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };

    if ret == 0 {
        #[allow(clippy::unnecessary_cast)]
        let available = stat.f_bavail as u64 * stat.f_frsize as u64;
        tracing::debug!(
            "[BackupCommon] statvfs 成功: path={:?}, available={} bytes ({:.2} GB)",
            path,
            available,
            available as f64 / 1024.0 / 1024.0 / 1024.0
        );
        Ok(available)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Windows: 使用 GetDiskFreeSpaceExW 获取磁盘可用空间
#[cfg(windows)]
fn get_disk_space_win32(path: &Path) -> io::Result<u64> {
    use std::os::windows::ffi::OsStrExt;

    let wide_path: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    let mut free_bytes_available: u64 = 0;
    let mut total_bytes: u64 = 0;
    let mut total_free_bytes: u64 = 0;

    extern "system" {
        fn GetDiskFreeSpaceExW(
            lpDirectoryName: *const u16,
            lpFreeBytesAvailableToCaller: *mut u64,
            lpTotalNumberOfBytes: *mut u64,
            lpTotalNumberOfFreeBytes: *mut u64,
        ) -> i32;
    }

    let ret = unsafe {
        GetDiskFreeSpaceExW(
            wide_path.as_ptr(),
            &mut free_bytes_available,
            &mut total_bytes,
            &mut total_free_bytes,
        )
    };

    if ret != 0 {
        Ok(free_bytes_available)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// 需要的空间（含 20% 余量）是否超出可用空间
pub fn ensure_space(available: u64, required_bytes: u64) -> Result<()> {
    let required_with_margin = (required_bytes as f64 * DISK_SPACE_MARGIN).ceil() as u64;

    if available < required_with_margin {
        return Err(BackupFailure::DiskFull(format!(
            "磁盘空间不足: 需要 {} 字节（含 20% 余量），可用 {} 字节",
            required_with_margin, available
        )));
    }
    Ok(())
}

/// 检查目标目录所在磁盘是否有足够空间
///
/// 无法获取可用空间时拒绝操作。
pub fn check_disk_space(path: &Path, required_bytes: u64) -> Result<()> {
    let available = get_available_disk_space(path).map_err(|e| {
        BackupFailure::Unknown(format!("无法获取磁盘可用空间 {:?}: {}", path, e))
    })?;
    ensure_space(available, required_bytes)
}
