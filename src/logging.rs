//! 日志初始化
//!
//! 使用 `tracing-subscriber` 的 fmt 输出；级别通过 `RUST_LOG` 控制，默认 `info`。

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";

fn build_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// 安装全局订阅者
///
/// 重复调用是安全的：已经安装过时返回 false。
pub fn init_logging() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter())
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        init_logging();
        assert!(!init_logging(), "第二次初始化不应覆盖已有订阅者");
    }
}
