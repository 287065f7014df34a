// 守护进程入口：加载配置、打开记录存储、启动自动备份调度器，Ctrl-C 退出。

use anyhow::Context;
use std::sync::Arc;

use homologador_lib::audit::AuditLogger;
use homologador_lib::backup::BackupManager;
use homologador_lib::clock::{Clock, SystemClock};
use homologador_lib::config::AppConfig;
use homologador_lib::database::Database;
use homologador_lib::features::AvailableFeatures;
use homologador_lib::logging::init_logging;
use homologador_lib::scheduler::AutoBackupScheduler;
use homologador_lib::service::BackupService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    tracing::info!("Homologador v{} 启动中", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load().context("加载配置失败")?;
    let database = Arc::new(
        Database::new(&config.database_path)
            .with_context(|| format!("打开数据库失败: {:?}", config.database_path))?,
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let manager = Arc::new(BackupManager::new(
        config.database_path.clone(),
        config.backup.clone(),
        clock.clone(),
    ));
    let audit = Arc::new(AuditLogger::new(database.clone(), clock));
    let features = AvailableFeatures::detect(&config.backup, &config.backup_directory());

    let service = Arc::new(BackupService::new(manager, database, audit, features));
    let scheduler = AutoBackupScheduler::start(service.clone());

    tokio::signal::ctrl_c()
        .await
        .context("等待退出信号失败")?;
    tracing::info!("收到退出信号，正在停止...");
    scheduler.stop().await;
    Ok(())
}
