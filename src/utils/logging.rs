/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::orchestrator::BatchStatus;

/// 初始化全局日志
///
/// `RUST_LOG` 优先；否则默认 `info`，详细模式为 `debug`。重复调用无副作用。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `max_workers`: 每个批次默认的并发数
/// - `store_dir`: 记录存放目录
pub fn log_startup(max_workers: usize, store_dir: &str) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 批量抓取模式");
    info!("📊 每批次默认并发数: {}", max_workers);
    info!("💾 记录存放目录: {}", store_dir);
    info!("{}", "=".repeat(60));
}

/// 记录批次文件加载信息
pub fn log_batches_loaded(batches: usize, requests: usize) {
    info!("✓ 找到 {} 个批次文件，共 {} 个请求", batches, requests);
    info!("💡 所有批次同时提交，各自在后台运行\n");
}

/// 记录单个批次的进度
pub fn log_batch_progress(entity_id: &str, field_name: &str, status: &BatchStatus) {
    info!(
        "⏳ {}.{}: 完成 {} / 失败 {} / 运行中 {} ({}% 成功, {}% 失败)",
        entity_id,
        field_name,
        status.completed.len(),
        status.errored.len(),
        status.running.len(),
        status.percent_success(),
        status.percent_error()
    );
}

/// 打印最终统计信息
///
/// # 参数
/// - `success`: 成功数量
/// - `failed`: 失败数量
/// - `total`: 总数
/// - `store_dir`: 记录存放目录
pub fn print_final_stats(success: usize, failed: usize, total: usize, store_dir: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", success, total);
    info!("❌ 失败: {}", failed);
    info!("{}", "=".repeat(60));
    info!("\n记录已保存至: {}", store_dir);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
