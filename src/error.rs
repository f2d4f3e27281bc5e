use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 远程请求错误
    #[error("请求错误: {0}")]
    Scrape(#[from] ScrapeError),
    /// 持久化错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 业务逻辑错误
    #[error("业务错误: {0}")]
    Business(#[from] BusinessError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 远程请求错误
///
/// 每个变体对应一种失败分类，执行器据此决定是否重试、是否清除缓存。
#[derive(Debug, Clone, Error)]
pub enum ScrapeError {
    /// 输入本身无法被外部工具使用（不重试）
    #[error("{0}")]
    InvalidInput(String),
    /// 外部任务仍在排队或运行，轮询次数已耗尽（可重试）
    #[error("{0}")]
    Timeout(String),
    /// 响应结构不符合预期（上游格式变化或临时故障）
    #[error("{0}")]
    Protocol(String),
    /// 外部任务明确报告失败
    #[error("{0}")]
    RemoteFailure(String),
    /// HTTP 状态码错误
    #[error("HTTP {status}: {url}")]
    Http { url: String, status: u16 },
    /// 网络传输失败
    #[error("请求 {url} 失败: {message}")]
    Transport { url: String, message: String },
}

impl ScrapeError {
    /// 是否值得由执行器自动重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScrapeError::Timeout(_))
    }

    /// 出现此错误时，刚写入的缓存条目是否应被视为"中毒"而删除
    pub fn poisons_cache(&self) -> bool {
        matches!(
            self,
            ScrapeError::Timeout(_) | ScrapeError::Protocol(_) | ScrapeError::RemoteFailure(_)
        )
    }

    /// 错误分类名称（用于日志）
    pub fn kind(&self) -> &'static str {
        match self {
            ScrapeError::InvalidInput(_) => "invalid_input",
            ScrapeError::Timeout(_) => "timeout",
            ScrapeError::Protocol(_) => "protocol",
            ScrapeError::RemoteFailure(_) => "remote_failure",
            ScrapeError::Http { .. } => "http",
            ScrapeError::Transport { .. } => "transport",
        }
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        match err.status() {
            Some(status) => ScrapeError::Http {
                url,
                status: status.as_u16(),
            },
            None => ScrapeError::Transport {
                url,
                message: err.to_string(),
            },
        }
    }
}

/// 持久化错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 读写文件失败
    #[error("读写存储文件失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// JSON 解析失败
    #[error("存储内容 JSON 解析失败 ({path}): {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    /// 记录索引超出范围
    #[error("记录索引 {index} 超出范围 (实体 {entity_id}.{field_name}, 长度 {len})")]
    IndexOutOfRange {
        entity_id: String,
        field_name: String,
        index: usize,
        len: usize,
    },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 未知的请求类型
    #[error("未知的请求类型: {0}")]
    UnknownVariant(String),
    /// 批次文件缺少字段
    #[error("批次文件 {path} 无效: {reason}")]
    InvalidBatchFile { path: String, reason: String },
}

/// 业务逻辑错误
#[derive(Debug, Error)]
pub enum BusinessError {
    /// 显示键超出参数范围
    #[error("显示键 {key} 超出第 {item} 项参数范围 (参数个数 {len})")]
    DisplayKeyOutOfRange { item: usize, key: i64, len: usize },
}

// ========== 便捷构造函数 ==========

impl ScrapeError {
    /// 创建输入无效错误
    pub fn invalid_input(message: impl Into<String>) -> Self {
        ScrapeError::InvalidInput(message.into())
    }

    /// 创建超时错误
    pub fn timeout(message: impl Into<String>) -> Self {
        ScrapeError::Timeout(message.into())
    }

    /// 创建协议错误
    pub fn protocol(message: impl Into<String>) -> Self {
        ScrapeError::Protocol(message.into())
    }
}

impl StoreError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<String>, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.into(),
            source,
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

/// 单个远程请求的结果类型
pub type ScrapeResult<T> = Result<T, ScrapeError>;
