use batch_scrape::config::Config;
use batch_scrape::infrastructure::{MemoryCache, MemoryStore, ReqwestHttpClient};
use batch_scrape::orchestrator::{BatchRequest, BatchSettings};
use batch_scrape::services::{ScrapeContext, ScrapeRequest, TagInRequest, Variant, VariantFactory};
use batch_scrape::utils::logging;
use batch_scrape::workflow::{RequestExecutor, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;

fn live_context(config: &Config) -> Arc<ScrapeContext> {
    let client = ReqwestHttpClient::new(config.http_timeout()).expect("创建 HTTP 客户端失败");
    Arc::new(ScrapeContext::from_config(
        config,
        Arc::new(client),
        Arc::new(MemoryCache::new()),
    ))
}

#[tokio::test]
#[ignore] // 默认忽略，需要手动运行：cargo test -- --ignored
async fn test_tagin_live() {
    // 初始化日志
    logging::init(true);

    // 加载配置
    let config = Config::from_env();
    let ctx = live_context(&config);

    let request = TagInRequest::new(ctx, "ENST00000330062", "FLAG", "GRCh38");
    let output = request.run().await.expect("TagIn 请求失败");

    assert!(output.contains_key("guides"), "结果应该包含 guides");
    assert!(request.in_cache(), "成功后应该已缓存");
}

#[tokio::test]
#[ignore]
async fn test_crispor_batch_live() {
    logging::init(true);

    let config = Config::from_env();
    let ctx = live_context(&config);

    let batch = BatchRequest::new(
        Arc::new(VariantFactory::new(Variant::CrisporGuide, ctx)),
        Arc::new(MemoryStore::new()),
        RequestExecutor::new(RetryPolicy::from_config(&config)),
        BatchSettings::new("live", "guide_data", config.workers_for("crispor_guide")),
    );

    let largs = vec![
        vec!["chr1:11,130,540-11,130,751".to_string()],
        vec!["chr1:1-1".to_string()],
    ];
    batch.start(largs, &[0]).await.expect("启动批次失败");

    // 外部服务很慢，最多等待 10 分钟
    for _ in 0..120 {
        let status = batch.status().await.expect("读取状态失败");
        println!("{}", status);
        if status.is_done() {
            assert_eq!(status.total(), 2);
            return;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    panic!("批次在 10 分钟内没有结束");
}
