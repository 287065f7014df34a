//! 自动备份调度器
//!
//! 运行在现有 tokio 运行时上的协作式定时任务：
//! - 启动后经过一个间隔才首次触发（不持久化上次时间，也不对齐整点）
//! - 每次触发执行一次 `create_backup(Auto)`
//! - 操作锁被占用时跳过本次触发，不排队
//! - 错过的触发直接跳过，不会补发
//! - 间隔修改在下一次触发后生效

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backup::BackupFailure;
use crate::service::BackupService;

/// 调度器运行计数
#[derive(Debug, Default)]
pub struct SchedulerStats {
    ticks: AtomicU64,
    backups_created: AtomicU64,
    skipped_busy: AtomicU64,
    skipped_disabled: AtomicU64,
    failures: AtomicU64,
}

impl SchedulerStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn backups_created(&self) -> u64 {
        self.backups_created.load(Ordering::SeqCst)
    }

    pub fn skipped_busy(&self) -> u64 {
        self.skipped_busy.load(Ordering::SeqCst)
    }

    pub fn skipped_disabled(&self) -> u64 {
        self.skipped_disabled.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}

pub struct AutoBackupScheduler;

impl AutoBackupScheduler {
    /// 启动调度任务
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn start(service: Arc<BackupService>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(SchedulerStats::default());
        let task = tokio::spawn(run_loop(service, stats.clone(), shutdown_rx));
        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
            stats,
        }
    }
}

/// 调度任务句柄
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<SchedulerStats>,
}

impl SchedulerHandle {
    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 停止调度并等待任务退出
    ///
    /// 正在进行的备份会先完成。
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("[AutoBackup] 调度任务异常退出: {}", e);
        }
        info!("[AutoBackup] 自动备份调度器已停止");
    }
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn run_loop(
    service: Arc<BackupService>,
    stats: Arc<SchedulerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut period = service.settings().interval();
    let mut ticker = new_ticker(period);
    info!(
        "[AutoBackup] 自动备份调度器已启动，间隔 {} 小时",
        period.as_secs() / 3600
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_tick(&service, &stats).await;

                let next = service.settings().interval();
                if next != period {
                    info!(
                        "[AutoBackup] 备份间隔已从 {} 小时调整为 {} 小时",
                        period.as_secs() / 3600,
                        next.as_secs() / 3600
                    );
                    period = next;
                    ticker = new_ticker(period);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_tick(service: &BackupService, stats: &SchedulerStats) {
    stats.ticks.fetch_add(1, Ordering::SeqCst);

    if !service.settings().auto_backup_enabled {
        stats.skipped_disabled.fetch_add(1, Ordering::SeqCst);
        debug!("[AutoBackup] 自动备份已关闭，跳过本次触发");
        return;
    }

    info!("[AutoBackup] 开始执行自动备份...");
    match service.try_create_scheduled_backup().await {
        Ok(archive) => {
            stats.backups_created.fetch_add(1, Ordering::SeqCst);
            info!(
                "[AutoBackup] 自动备份完成: {} ({} bytes)",
                archive.archive_id, archive.size_bytes
            );
        }
        Err(BackupFailure::Busy) => {
            stats.skipped_busy.fetch_add(1, Ordering::SeqCst);
            warn!("[AutoBackup] 其他备份/恢复操作正在进行，跳过本次触发");
        }
        Err(e) => {
            stats.failures.fetch_add(1, Ordering::SeqCst);
            error!("[AutoBackup] 自动备份失败: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::backup::{BackupKind, BackupManager};
    use crate::clock::{Clock, TokioClock};
    use crate::config::BackupSettings;
    use crate::database::Database;
    use crate::features::AvailableFeatures;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn service(dir: &TempDir, settings: BackupSettings) -> Arc<BackupService> {
        let db_path = dir.path().join("homologador.db");
        let database = Arc::new(Database::new(&db_path).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(
            Utc.with_ymd_and_hms(2026, 5, 4, 0, 0, 0).unwrap(),
        ));
        let manager = Arc::new(BackupManager::new(db_path, settings, clock.clone()));
        let audit = Arc::new(AuditLogger::new(database.clone(), clock));
        Arc::new(BackupService::new(
            manager,
            database,
            audit,
            AvailableFeatures::default(),
        ))
    }

    async fn wait_for_ticks(handle: &SchedulerHandle, ticks: u64) {
        for _ in 0..1000 {
            if handle.stats().ticks() >= ticks && !handle_busy(handle) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("调度器未在预期内触发 {} 次", ticks);
    }

    fn handle_busy(handle: &SchedulerHandle) -> bool {
        let s = handle.stats();
        s.ticks() != s.backups_created() + s.skipped_busy() + s.skipped_disabled() + s.failures()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_interval() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, BackupSettings::default());
        let handle = AutoBackupScheduler::start(service.clone());

        tokio::time::sleep(23 * HOUR).await;
        assert_eq!(handle.stats().ticks(), 0, "启动后不应立即触发");

        tokio::time::sleep(HOUR).await;
        wait_for_ticks(&handle, 1).await;

        let backups = service.list_backups().await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].kind(), Some(BackupKind::Auto));

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skipped_when_disabled_or_busy() {
        let dir = TempDir::new().unwrap();
        let mut settings = BackupSettings::default();
        settings.auto_backup_enabled = false;
        let service = service(&dir, settings.clone());
        let handle = AutoBackupScheduler::start(service.clone());

        tokio::time::sleep(24 * HOUR).await;
        wait_for_ticks(&handle, 1).await;
        assert_eq!(handle.stats().skipped_disabled(), 1);

        settings.auto_backup_enabled = true;
        service.update_settings(settings).unwrap();
        let permit = service.operation_lock().try_acquire().unwrap();

        tokio::time::sleep(24 * HOUR).await;
        wait_for_ticks(&handle, 2).await;
        assert_eq!(handle.stats().skipped_busy(), 1);
        drop(permit);

        assert!(service.list_backups().await.unwrap().is_empty());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_applies_after_next_tick() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, BackupSettings::default());
        let handle = AutoBackupScheduler::start(service.clone());

        let mut settings = service.settings();
        settings.interval_hours = 6;
        service.update_settings(settings).unwrap();

        // 当前计时不重置，仍在 24 小时后触发
        tokio::time::sleep(12 * HOUR).await;
        assert_eq!(handle.stats().ticks(), 0);

        tokio::time::sleep(12 * HOUR).await;
        wait_for_ticks(&handle, 1).await;

        tokio::time::sleep(6 * HOUR).await;
        wait_for_ticks(&handle, 2).await;
        assert_eq!(handle.stats().backups_created(), 2);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_task() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, BackupSettings::default());
        let handle = AutoBackupScheduler::start(service);
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        handle.stop().await;
    }
}
