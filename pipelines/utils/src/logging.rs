//! 日志初始化.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// 初始化全局日志, 只在第一次调用时生效.
///
/// `RUST_LOG` 优先于 `level`. `json` 为真时每条事件输出为一行 JSON.
pub fn init(level: &str, json: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        // 已有全局 subscriber 时 (例如测试中) 保持原样
        let _ = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
    });
}
