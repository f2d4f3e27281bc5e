use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// 程序配置文件
#[derive(Clone, Debug)]
pub struct Config {
    /// 每个批次默认的并发请求数量
    pub max_workers: usize,
    /// 按请求类型覆盖的并发数量（部分外部服务超过少量并发就会降级）
    pub variant_max_workers: HashMap<String, usize>,
    /// 缓存有效期（秒）
    pub cache_ttl_secs: u64,
    /// 磁盘缓存目录，未设置时使用内存缓存
    pub cache_dir: Option<String>,
    /// 批次记录存放目录
    pub store_dir: String,
    /// 批次 TOML 文件存放目录
    pub batch_folder: String,
    /// 单个 HTTP 请求超时（秒）
    pub http_timeout_secs: u64,
    /// 轮询外部任务状态的间隔（秒）
    pub poll_interval_secs: u64,
    /// 轮询外部任务状态的最大次数
    pub poll_max_retries: u32,
    /// 超时类错误的自动重试次数
    pub timeout_retries: u32,
    /// 线性退避的步长（秒）
    pub backoff_step_secs: u64,
    /// 主程序查询批次状态的间隔（毫秒）
    pub status_poll_ms: u64,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    // --- 外部服务配置 ---
    pub crispor_base_url: String,
    pub crispresso_base_url: String,
    pub tagin_base_url: String,
    /// CRISPResso 表单要求填写的通知邮箱
    pub notify_email: String,
}

impl Default for Config {
    fn default() -> Self {
        // 超过 8 个线程时 Crispor 会返回 "no output" 错误
        let variant_max_workers = HashMap::from([
            ("crispor_guide".to_string(), 4),
            ("crispor_primer".to_string(), 4),
            ("crispresso".to_string(), 4),
        ]);

        Self {
            max_workers: 8,
            variant_max_workers,
            cache_ttl_secs: 3600 * 12,
            cache_dir: None,
            store_dir: "batch_store".to_string(),
            batch_folder: "batches".to_string(),
            http_timeout_secs: 300,
            poll_interval_secs: 30,
            poll_max_retries: 3,
            timeout_retries: 3,
            backoff_step_secs: 15,
            status_poll_ms: 2000,
            verbose_logging: false,
            crispor_base_url: "http://crispor.tefor.net/crispor.py".to_string(),
            crispresso_base_url: "http://crispresso.pinellolab.partners.org".to_string(),
            tagin_base_url: "http://tagin.stembio.org/submit/".to_string(),
            notify_email: String::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();

        let mut variant_max_workers = default.variant_max_workers.clone();
        for variant in crate::services::Variant::ALL {
            let var_name = format!("MAX_WORKERS_{}", variant.name().to_uppercase());
            if let Some(limit) = parse_env::<usize>(&var_name) {
                variant_max_workers.insert(variant.name().to_string(), limit);
            }
        }

        Self {
            max_workers: parse_env("MAX_WORKERS").unwrap_or(default.max_workers),
            variant_max_workers,
            cache_ttl_secs: parse_env("CACHE_TTL_SECS").unwrap_or(default.cache_ttl_secs),
            cache_dir: std::env::var("CACHE_DIR").ok().filter(|v| !v.is_empty()),
            store_dir: std::env::var("STORE_DIR").unwrap_or(default.store_dir),
            batch_folder: std::env::var("BATCH_FOLDER").unwrap_or(default.batch_folder),
            http_timeout_secs: parse_env("HTTP_TIMEOUT_SECS").unwrap_or(default.http_timeout_secs),
            poll_interval_secs: parse_env("POLL_INTERVAL_SECS").unwrap_or(default.poll_interval_secs),
            poll_max_retries: parse_env("POLL_MAX_RETRIES").unwrap_or(default.poll_max_retries),
            timeout_retries: parse_env("TIMEOUT_RETRIES").unwrap_or(default.timeout_retries),
            backoff_step_secs: parse_env("BACKOFF_STEP_SECS").unwrap_or(default.backoff_step_secs),
            status_poll_ms: parse_env("STATUS_POLL_MS").unwrap_or(default.status_poll_ms),
            verbose_logging: parse_env("VERBOSE_LOGGING").unwrap_or(default.verbose_logging),
            crispor_base_url: std::env::var("CRISPOR_BASE_URL").unwrap_or(default.crispor_base_url),
            crispresso_base_url: std::env::var("CRISPRESSO_BASE_URL")
                .unwrap_or(default.crispresso_base_url),
            tagin_base_url: std::env::var("TAGIN_BASE_URL").unwrap_or(default.tagin_base_url),
            notify_email: std::env::var("NOTIFY_EMAIL").unwrap_or(default.notify_email),
        }
    }

    /// 某个请求类型的并发上限
    pub fn workers_for(&self, variant: &str) -> usize {
        self.variant_max_workers
            .get(variant)
            .copied()
            .unwrap_or(self.max_workers)
            .max(1)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backoff_step(&self) -> Duration {
        Duration::from_secs(self.backoff_step_secs)
    }
}

/// 读取并解析环境变量，解析失败时记录警告并返回 None
fn parse_env<T: FromStr>(var_name: &str) -> Option<T> {
    let value = std::env::var(var_name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("环境变量 {} 的值 '{}' 无法解析，使用默认值", var_name, value);
            None
        }
    }
}
