//! 远程请求契约 - 业务能力层
//!
//! 每种外部服务实现一次 [`ScrapeRequest`]：
//! - `fingerprint()` 纯计算，不做 I/O
//! - `in_cache()` 委托给注入的缓存
//! - `run()` 完成全部网络交互并返回结构化结果
//!
//! [`ScrapeContext`] 持有所有变体共享的能力（HTTP 客户端、缓存、轮询参数、服务地址）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{ScrapeError, ScrapeResult};
use crate::infrastructure::cache::ResponseCache;
use crate::infrastructure::http::{Fingerprint, HttpClient, HttpRequest, HttpResponse};

/// 变体返回的结构化结果
pub type ScrapeOutput = Map<String, JsonValue>;

/// 一个远程任务
#[async_trait]
pub trait ScrapeRequest: Send + Sync {
    /// 变体名称
    fn name(&self) -> &'static str;

    /// 请求指纹（缓存键）
    fn fingerprint(&self) -> Fingerprint;

    /// 注入的缓存
    fn cache(&self) -> &dyn ResponseCache;

    /// 相同请求是否已有缓存的答案
    fn in_cache(&self) -> bool {
        self.cache().has(&self.fingerprint())
    }

    /// 删除本请求的缓存条目
    fn invalidate_cache(&self) -> bool {
        self.cache().invalidate(&self.fingerprint())
    }

    /// 出现该错误后，是否删除本请求的缓存条目
    ///
    /// 默认按错误分类判断。缓存条目在失败后仍然有效的变体（例如已提交、
    /// 仍在运行的远程任务）可以覆盖此方法。
    fn invalidate_on(&self, error: &ScrapeError) -> bool {
        error.poisons_cache()
    }

    /// 执行请求并解析结果
    async fn run(&self) -> ScrapeResult<ScrapeOutput>;
}

/// 轮询参数
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// 两次检查之间的间隔
    pub interval: Duration,
    /// 最多检查次数
    pub max_retries: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// 外部服务地址
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub crispor: String,
    pub crispresso: String,
    pub tagin: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        let config = Config::default();
        Self {
            crispor: config.crispor_base_url,
            crispresso: config.crispresso_base_url,
            tagin: config.tagin_base_url,
        }
    }
}

/// 变体共享的能力
#[derive(Clone)]
pub struct ScrapeContext {
    pub client: Arc<dyn HttpClient>,
    pub cache: Arc<dyn ResponseCache>,
    pub cache_ttl: Duration,
    pub poll: PollSettings,
    pub endpoints: Endpoints,
    /// CRISPResso 表单要求的邮箱
    pub notify_email: String,
}

impl ScrapeContext {
    /// 使用默认参数创建
    pub fn new(client: Arc<dyn HttpClient>, cache: Arc<dyn ResponseCache>) -> Self {
        let config = Config::default();
        Self::from_config(&config, client, cache)
    }

    pub fn from_config(
        config: &Config,
        client: Arc<dyn HttpClient>,
        cache: Arc<dyn ResponseCache>,
    ) -> Self {
        Self {
            client,
            cache,
            cache_ttl: config.cache_ttl(),
            poll: PollSettings {
                interval: config.poll_interval(),
                max_retries: config.poll_max_retries,
            },
            endpoints: Endpoints {
                crispor: config.crispor_base_url.clone(),
                crispresso: config.crispresso_base_url.clone(),
                tagin: config.tagin_base_url.clone(),
            },
            notify_email: config.notify_email.clone(),
        }
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// 发送请求，不经过缓存
    pub async fn fetch(&self, request: &HttpRequest) -> ScrapeResult<HttpResponse> {
        info!("{} request to: {}", request.method.as_str(), request.url);
        self.client.send(request).await?.error_for_status()
    }

    /// 先查缓存，未命中时发送请求并写入缓存
    pub async fn fetch_cached(&self, request: &HttpRequest) -> ScrapeResult<HttpResponse> {
        let key = request.fingerprint();
        self.fetch_cached_as(&key, request).await
    }

    /// 以指定的键缓存请求的响应
    ///
    /// 多步会话中，最终页面缓存在用户关心的那一步的指纹下。
    pub async fn fetch_cached_as(
        &self,
        key: &Fingerprint,
        request: &HttpRequest,
    ) -> ScrapeResult<HttpResponse> {
        if let Some(cached) = self.cache.get(key) {
            debug!("缓存命中: {} {}", request.url, key);
            return Ok(cached);
        }
        let response = self.fetch(request).await?;
        self.cache.put(key, &response, self.cache_ttl);
        Ok(response)
    }

    /// 读取缓存中指定键的响应
    pub fn cached(&self, key: &Fingerprint) -> Option<HttpResponse> {
        self.cache.get(key)
    }

    /// 写入缓存
    pub fn store(&self, key: &Fingerprint, response: &HttpResponse) {
        self.cache.put(key, response, self.cache_ttl);
    }
}

/// 读取第 `i` 个位置参数，缺失或为空时使用默认值
pub(crate) fn arg_or(args: &[String], i: usize, default: &str) -> String {
    args.get(i)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

/// 读取必填的位置参数
pub(crate) fn required_arg(args: &[String], i: usize, name: &str, variant: &str) -> ScrapeResult<String> {
    args.get(i)
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .ok_or_else(|| {
            ScrapeError::invalid_input(format!("{}: missing argument '{}'", variant, name))
        })
}

/// 以 `(key, value)` 列表构建 JSON 对象，保持顺序
pub(crate) fn ordered_object<I, K, V>(items: I) -> JsonValue
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<JsonValue>,
{
    let mut map = Map::new();
    for (k, v) in items {
        map.insert(k.into(), v.into());
    }
    JsonValue::Object(map)
}

/// URL 查询参数编码（保留 RFC 3986 非保留字符）
pub(crate) fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cache::MemoryCache;
    use crate::infrastructure::http::{HttpMethod, MockHttpClient};

    #[test]
    fn percent_encode_escapes_plus() {
        assert_eq!(percent_encode("s185+"), "s185%2B");
        assert_eq!(percent_encode("a b/c"), "a%20b/c");
    }

    #[test]
    fn missing_argument_is_invalid_input() {
        let args = vec!["".to_string()];
        let err = required_arg(&args, 0, "seq", "crispor_guide").unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert_eq!(arg_or(&args, 0, "hg38"), "hg38");
        assert_eq!(arg_or(&args, 3, "NGG"), "NGG");
    }

    #[tokio::test]
    async fn cached_fetch_hits_network_once() {
        let mock = MockHttpClient::new();
        mock.add_response(HttpMethod::Get, "http://x/page", Ok(HttpResponse::ok("http://x/page", "<p>hi</p>")));
        let ctx = ScrapeContext::new(Arc::new(mock.clone()), Arc::new(MemoryCache::new()));

        let request = HttpRequest::get("http://x/page");
        let first = ctx.fetch_cached(&request).await.unwrap();
        let second = ctx.fetch_cached(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn error_status_is_not_cached() {
        let mock = MockHttpClient::new();
        mock.add_sticky_response(
            HttpMethod::Get,
            "http://x/down",
            Ok(HttpResponse {
                status: 502,
                ..HttpResponse::ok("http://x/down", "bad gateway")
            }),
        );
        let cache = Arc::new(MemoryCache::new());
        let ctx = ScrapeContext::new(Arc::new(mock), cache.clone());

        assert!(ctx.fetch_cached(&HttpRequest::get("http://x/down")).await.is_err());
        assert!(cache.is_empty());
    }
}
