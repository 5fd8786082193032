//! 日志初始化

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 默认日志级别（未设置 `RUST_LOG` 时）
pub const DEFAULT_LOG_FILTER: &str = "info";

/// 初始化文本格式日志
///
/// 全局 subscriber 已存在时返回 `false`，可以重复调用
pub fn init_tracing() -> bool {
    init_tracing_with(DEFAULT_LOG_FILTER, false)
}

/// 初始化日志，`json` 为 true 时输出 JSON 行
pub fn init_tracing_with(default_filter: &str, json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).try_init().is_ok()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init().is_ok()
    }
}
