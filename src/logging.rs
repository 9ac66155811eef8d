//! 日志初始化
//!
//! `RUST_LOG` 优先; 否则按 `-v` 次数选择 info / debug / trace

use tracing_subscriber::EnvFilter;

/// 按命令行冗余级别初始化全局日志 (重复调用无副作用)
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}
