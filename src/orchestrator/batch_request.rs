//! 批次请求编排器 - 编排层
//!
//! ## 职责
//!
//! 1. **初始化记录**：为每一项同步计算指纹和缓存命中，一次性写入全部 pending 记录
//! 2. **并发控制**：每个批次一个 Semaphore，限制同时运行的请求数
//! 3. **结果回写**：唯一的消费者按完成顺序，用单条定向更新写回记录
//! 4. **立即返回**：`start()` 不等待任何请求完成，进度只能通过 `status()` 查询
//!
//! ## 并发模型
//!
//! ```text
//! start() ──写入 N 条 pending──► RecordStore
//!    │
//!    └─ spawn 监督任务（脱离调用者继续运行）
//!          ├─ spawn worker 0..N（各自持有 Semaphore 许可后执行）
//!          └─ FuturesUnordered 收集完成结果 ──update_record(i)──► RecordStore
//! ```
//!
//! 回写失败会线性退避重试；仍然失败的终态保留在内存中，`status()` 读取时叠加上去，
//! 避免一项已经结束的请求永远显示为运行中。

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult, BusinessError, ScrapeResult, StoreError};
use crate::infrastructure::store::RecordStore;
use crate::models::{now_epoch_secs, RecordUpdate, RequestRecord};
use crate::orchestrator::batch_status::BatchStatus;
use crate::services::{RequestFactory, ScrapeRequest};
use crate::workflow::RequestExecutor;

/// 回写终态的最多尝试次数
const WRITE_ATTEMPTS: u32 = 5;
/// 回写重试的退避步长：第 n 次失败后等待 n × step
const WRITE_BACKOFF_STEP: Duration = Duration::from_secs(1);

/// 未能写入存储的终态，按记录下标保存
type UnsavedUpdates = Arc<DashMap<usize, RecordUpdate>>;

/// 批次配置
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// 拥有批次的实体
    pub entity_id: String,
    /// 记录所在字段
    pub field_name: String,
    /// 同时运行的请求上限
    pub max_workers: usize,
}

impl BatchSettings {
    pub fn new(entity_id: impl Into<String>, field_name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            entity_id: entity_id.into(),
            field_name: field_name.into(),
            max_workers: max_workers.max(1),
        }
    }
}

/// 一个实体字段上的批次请求
pub struct BatchRequest<F: RequestFactory> {
    factory: Arc<F>,
    store: Arc<dyn RecordStore>,
    executor: RequestExecutor,
    settings: BatchSettings,
    unsaved: UnsavedUpdates,
}

impl<F: RequestFactory> BatchRequest<F> {
    pub fn new(
        factory: Arc<F>,
        store: Arc<dyn RecordStore>,
        executor: RequestExecutor,
        settings: BatchSettings,
    ) -> Self {
        Self {
            factory,
            store,
            executor,
            settings,
            unsaved: Arc::new(DashMap::new()),
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// 提交整个批次，不等待任何请求完成
    ///
    /// `display_keys` 选出每项参数中用于展示的位置，负数从末尾数起。
    /// 显示键越界时不写入任何记录，直接返回错误。
    pub async fn start(&self, largs: Vec<Vec<String>>, display_keys: &[i64]) -> AppResult<()> {
        let request_keys = largs
            .iter()
            .enumerate()
            .map(|(item, args)| request_key(item, args, display_keys))
            .collect::<Result<Vec<_>, _>>()?;

        // 构造请求可能读取本地文件（例如计算上传文件的指纹），放到阻塞线程池中
        let factory = self.factory.clone();
        let (built, lookups) = tokio::task::spawn_blocking(move || {
            let built: Vec<ScrapeResult<Box<dyn ScrapeRequest>>> =
                largs.iter().map(|args| factory.build(args)).collect();
            let lookups: Vec<Option<(String, bool)>> = built
                .iter()
                .map(|request| {
                    request
                        .as_ref()
                        .ok()
                        .map(|r| (r.fingerprint().to_string(), r.in_cache()))
                })
                .collect();
            (built, lookups)
        })
        .await
        .map_err(|e| AppError::Other(format!("构造请求失败: {}", e)))?;

        let start_time = now_epoch_secs();
        let records: Vec<RequestRecord> = lookups
            .into_iter()
            .zip(request_keys)
            .enumerate()
            .map(|(index, (lookup, key))| match lookup {
                Some((cache_key, in_cache)) => {
                    RequestRecord::pending(index, key, cache_key, in_cache, start_time)
                }
                None => RequestRecord::pending(index, key, String::new(), false, start_time),
            })
            .collect();
        let cached = records.iter().filter(|r| r.in_cache).count();

        self.store
            .write(&self.settings.entity_id, &self.settings.field_name, records)
            .await?;
        debug!(
            "{} 初始记录已保存: {}.{}",
            self.factory.variant(),
            self.settings.entity_id,
            self.settings.field_name
        );

        info!(
            "📦 {} 批次 {}.{}: 提交 {} 个请求 (已缓存 {}，并发 {})",
            self.factory.variant(),
            self.settings.entity_id,
            self.settings.field_name,
            built.len(),
            cached,
            self.settings.max_workers
        );

        self.unsaved.clear();

        // 监督任务脱离调用者运行，批次无法取消
        tokio::spawn(supervise(
            built,
            self.executor,
            self.store.clone(),
            self.unsaved.clone(),
            self.settings.clone(),
            self.factory.variant().to_string(),
        ));
        Ok(())
    }

    /// 读取当前记录并分类（不访问网络）
    pub async fn status(&self) -> AppResult<BatchStatus> {
        let mut records = self
            .store
            .read(&self.settings.entity_id, &self.settings.field_name)
            .await?;
        for entry in self.unsaved.iter() {
            if let Some(record) = records.get_mut(*entry.key()) {
                if !record.is_terminal() {
                    record.apply(entry.value());
                }
            }
        }
        Ok(BatchStatus::from_records(&records))
    }
}

/// 运行所有 worker，并作为唯一消费者写回结果
async fn supervise(
    built: Vec<ScrapeResult<Box<dyn ScrapeRequest>>>,
    executor: RequestExecutor,
    store: Arc<dyn RecordStore>,
    unsaved: UnsavedUpdates,
    settings: BatchSettings,
    variant: String,
) {
    let total = built.len();
    let semaphore = Arc::new(Semaphore::new(settings.max_workers));
    let mut running = FuturesUnordered::new();

    for (index, request) in built.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            executor.execute_item(index, request).await
        });
        debug!("[请求 {}] {} 已提交", index, variant);
        running.push(handle.map(move |joined| (index, joined)));
    }

    let mut succeeded = 0;
    while let Some((index, joined)) = running.next().await {
        let update = joined.unwrap_or_else(|e| {
            error!("[请求 {}] 任务执行失败: {}", index, e);
            RecordUpdate {
                end_time: now_epoch_secs(),
                outcome: Err(format!("worker failed: {}", e)),
            }
        });
        if update.outcome.is_ok() {
            succeeded += 1;
        }

        match save_update(store.as_ref(), &settings, index, &update).await {
            Ok(()) => debug!("[请求 {}] 结果已写入 {}.{}", index, settings.entity_id, settings.field_name),
            Err(e) => {
                error!("[请求 {}] 写入结果失败，终态仅保留在内存中: {}", index, e);
                unsaved.insert(index, update);
            }
        }
    }

    info!(
        "✓ {} 批次 {}.{} 完成: 成功 {}/{}",
        variant, settings.entity_id, settings.field_name, succeeded, total
    );
}

/// 定向回写一条终态，失败时线性退避重试
async fn save_update(
    store: &dyn RecordStore,
    settings: &BatchSettings,
    index: usize,
    update: &RecordUpdate,
) -> Result<(), StoreError> {
    let mut attempt = 1;
    loop {
        match store
            .update_record(&settings.entity_id, &settings.field_name, index, update)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if attempt < WRITE_ATTEMPTS => {
                let delay = WRITE_BACKOFF_STEP * attempt;
                warn!(
                    "[请求 {}] 写入结果失败 ({}/{})，{} 秒后重试: {}",
                    index,
                    attempt,
                    WRITE_ATTEMPTS,
                    delay.as_secs(),
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// 把显示键解析为数组下标，负数从末尾数起
pub fn resolve_display_key(key: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if key < 0 { len + key } else { key };
    (0..len).contains(&index).then_some(index as usize)
}

fn request_key(item: usize, args: &[String], display_keys: &[i64]) -> Result<Vec<String>, BusinessError> {
    display_keys
        .iter()
        .map(|&key| {
            resolve_display_key(key, args.len())
                .map(|i| args[i].clone())
                .ok_or(BusinessError::DisplayKeyOutOfRange {
                    item,
                    key,
                    len: args.len(),
                })
        })
        .collect()
}
