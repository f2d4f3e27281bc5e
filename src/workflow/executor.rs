//! 单个请求的执行流程 - 流程层
//!
//! 核心职责：定义"一个请求"从运行到得出终态的完整流程
//!
//! 流程顺序：
//! 1. 运行变体的 `run()`
//! 2. 失败时按错误分类处理：由请求决定是否清除缓存，超时类错误线性退避后重试
//! 3. 任何错误（包括 panic）都转成记录的错误终态，绝不向外传播

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ScrapeResult;
use crate::models::{now_epoch_secs, RecordUpdate};
use crate::services::{ScrapeOutput, ScrapeRequest};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 超时类错误的最大重试次数
    pub max_retries: u32,
    /// 线性退避步长：第 n 次重试前等待 n × step
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_step: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.timeout_retries,
            backoff_step: config.backoff_step(),
        }
    }

    /// 不重试
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_step: Duration::ZERO,
        }
    }

    /// 第 `retry` 次重试（从 1 开始）前的等待时间
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff_step.saturating_mul(retry)
    }
}

/// 请求执行器
///
/// - 不持有任何资源
/// - 只依赖 [`ScrapeRequest`] 契约
/// - 不知道记录存在哪里
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestExecutor {
    retry: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// 运行请求，按策略重试，返回结果或最后一次错误
    pub async fn execute(&self, request: &dyn ScrapeRequest) -> ScrapeResult<ScrapeOutput> {
        let mut retry = 0;
        loop {
            let error = match request.run().await {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };

            if request.invalidate_on(&error) && request.invalidate_cache() {
                // 缓存里可能是"仍在处理"的页面或格式异常的页面
                warn!("{} 已删除缓存条目 {}", request.name(), request.fingerprint());
            }

            if !error.is_retryable() || retry >= self.retry.max_retries {
                return Err(error);
            }

            retry += 1;
            let delay = self.retry.delay_for(retry);
            warn!(
                "{}: {} (重试 {}/{}，等待 {} 秒)",
                request.name(),
                error,
                retry,
                self.retry.max_retries,
                delay.as_secs()
            );
            sleep(delay).await;
        }
    }

    /// 执行批次中的一项，总是得到终态更新
    ///
    /// `request` 为构造阶段的结果；构造失败时直接记为错误。
    pub async fn execute_item(
        &self,
        index: usize,
        request: ScrapeResult<Box<dyn ScrapeRequest>>,
    ) -> RecordUpdate {
        let outcome = match request {
            Ok(request) => {
                match AssertUnwindSafe(self.execute(request.as_ref()))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(output)) => {
                        info!("[请求 {}] ✓ {} 完成", index, request.name());
                        Ok(output)
                    }
                    Ok(Err(e)) => {
                        error!("[请求 {}] ❌ {} 失败 ({}): {}", index, request.name(), e.kind(), e);
                        Err(e.to_string())
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!("[请求 {}] ❌ {} 崩溃: {}", index, request.name(), message);
                        Err(message)
                    }
                }
            }
            Err(e) => {
                error!("[请求 {}] ❌ 无法构造请求: {}", index, e);
                Err(e.to_string())
            }
        };

        RecordUpdate {
            end_time: now_epoch_secs(),
            outcome,
        }
    }
}

/// 从 panic 负载中取出文本
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
