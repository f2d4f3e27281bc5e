use crate::config::Config;
use crate::infrastructure::{
    DiskCache, JsonFileStore, MemoryCache, RecordStore, ResponseCache, ReqwestHttpClient,
};
use crate::models::{load_all_batch_specs, BatchSpec};
use crate::orchestrator::{BatchRequest, BatchSettings, BatchStatus};
use crate::services::{ScrapeContext, VariantFactory};
use crate::utils::logging::{
    log_batch_progress, log_batches_loaded, log_startup, print_final_stats, truncate_text,
};
use crate::workflow::{RequestExecutor, RetryPolicy};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 应用主结构
pub struct App {
    config: Config,
    ctx: Arc<ScrapeContext>,
    store: Arc<dyn RecordStore>,
    executor: RequestExecutor,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        log_startup(config.max_workers, &config.store_dir);

        let client = ReqwestHttpClient::new(config.http_timeout()).context("无法创建 HTTP 客户端")?;

        let cache: Arc<dyn ResponseCache> = match &config.cache_dir {
            Some(dir) => {
                info!("🗄️ 使用磁盘缓存: {}", dir);
                Arc::new(DiskCache::open(dir).with_context(|| format!("无法打开缓存目录: {}", dir))?)
            }
            None => {
                info!("🗄️ 使用内存缓存");
                Arc::new(MemoryCache::new())
            }
        };

        let store = JsonFileStore::open(&config.store_dir)
            .await
            .with_context(|| format!("无法打开记录目录: {}", config.store_dir))?;

        let ctx = Arc::new(ScrapeContext::from_config(&config, Arc::new(client), cache));
        let executor = RequestExecutor::new(RetryPolicy::from_config(&config));

        Ok(Self {
            config,
            ctx,
            store: Arc::new(store),
            executor,
        })
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<()> {
        // 加载所有批次文件
        info!("\n📁 正在扫描批次文件...");
        let specs = load_all_batch_specs(&self.config.batch_folder).await?;

        if specs.is_empty() {
            warn!("⚠️ 没有找到批次文件，程序结束");
            return Ok(());
        }

        let total_requests: usize = specs.iter().map(|s| s.args.len()).sum();
        log_batches_loaded(specs.len(), total_requests);

        let batches = self.start_all(specs).await;
        let statuses = self.wait_all(&batches).await?;

        // 输出最终统计
        let mut stats = ProcessingStats::default();
        for (batch, status) in batches.iter().zip(&statuses) {
            let settings = batch.settings();
            for entry in &status.errored {
                warn!(
                    "❌ {}.{} {}",
                    settings.entity_id,
                    settings.field_name,
                    truncate_text(&entry.to_string(), 200)
                );
            }
            stats.success += status.completed.len();
            stats.failed += status.errored.len();
            stats.total += status.total();
        }
        print_final_stats(stats.success, stats.failed, stats.total, &self.config.store_dir);

        Ok(())
    }

    /// 提交所有批次；启动失败的批次被跳过
    async fn start_all(&self, specs: Vec<BatchSpec>) -> Vec<BatchRequest<VariantFactory>> {
        let mut batches = Vec::new();

        for spec in specs {
            let source = spec.file_path.clone().unwrap_or_default();
            match self.start_batch(spec).await {
                Ok(batch) => batches.push(batch),
                Err(e) => error!("📦 批次 {} 启动失败: {:#}", source, e),
            }
        }

        batches
    }

    async fn start_batch(&self, spec: BatchSpec) -> Result<BatchRequest<VariantFactory>> {
        let variant = spec.variant()?;
        let settings = BatchSettings::new(
            spec.entity_id.clone(),
            spec.field_name()?,
            self.config.workers_for(variant.name()),
        );
        let factory = Arc::new(VariantFactory::new(variant, self.ctx.clone()));
        let batch = BatchRequest::new(factory, self.store.clone(), self.executor, settings);

        batch.start(spec.args, &spec.display_keys).await?;
        Ok(batch)
    }

    /// 轮询所有批次，直到全部结束
    async fn wait_all(&self, batches: &[BatchRequest<VariantFactory>]) -> Result<Vec<BatchStatus>> {
        let interval = Duration::from_millis(self.config.status_poll_ms.max(1));

        loop {
            let mut statuses = Vec::with_capacity(batches.len());
            for batch in batches {
                statuses.push(batch.status().await?);
            }

            if statuses.iter().all(BatchStatus::is_done) {
                return Ok(statuses);
            }

            for (batch, status) in batches.iter().zip(&statuses) {
                if !status.is_done() {
                    let settings = batch.settings();
                    log_batch_progress(&settings.entity_id, &settings.field_name, status);
                }
            }

            tokio::time::sleep(interval).await;
        }
    }
}

/// 处理统计
#[derive(Debug, Default)]
struct ProcessingStats {
    success: usize,
    failed: usize,
    total: usize,
}
