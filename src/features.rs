//! 启动时功能探测
//!
//! 只在启动时检测一次，结果存放在 `BackupService` 中，运行期间不再探测。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::config::BackupSettings;

const WRITE_PROBE_FILE: &str = ".write_probe";

/// 可用功能集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AvailableFeatures {
    /// 自动备份已启用
    pub auto_backup: bool,
    /// 日志目录存在，归档会包含近期日志
    pub log_capture: bool,
    /// 配置文件存在，归档会包含原始配置
    pub config_snapshot: bool,
    /// 备份目录可写
    pub backup_dir_writable: bool,
}

impl AvailableFeatures {
    pub fn detect(settings: &BackupSettings, backup_dir: &Path) -> Self {
        let features = Self {
            auto_backup: settings.auto_backup_enabled,
            log_capture: settings
                .log_directory
                .as_deref()
                .map(Path::is_dir)
                .unwrap_or(false),
            config_snapshot: settings
                .config_file
                .as_deref()
                .map(Path::is_file)
                .unwrap_or(false),
            backup_dir_writable: probe_writable(backup_dir),
        };

        info!(
            "[Features] 自动备份={} 日志采集={} 配置快照={} 备份目录可写={}",
            features.auto_backup,
            features.log_capture,
            features.config_snapshot,
            features.backup_dir_writable
        );
        if !features.backup_dir_writable {
            warn!("[Features] 备份目录不可写: {:?}", backup_dir);
        }
        features
    }
}

fn probe_writable(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(WRITE_PROBE_FILE);
    match fs::write(&probe, b"ok") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
