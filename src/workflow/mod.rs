//! 流程层（Workflow）
//!
//! 定义"一个请求"的完整处理流程：运行、分类失败、清理缓存、退避重试、归一化为终态。

pub mod executor;

pub use executor::{RequestExecutor, RetryPolicy};
