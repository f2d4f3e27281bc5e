use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// 结果中由记录本身占用的键，变体返回的同名字段会被丢弃
const RESERVED_KEYS: &[&str] = &[
    "index",
    "success",
    "request_key",
    "in_cache",
    "cache_key",
    "start_time",
    "end_time",
    "error",
];

/// 记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// 已提交，尚未结束（持久化为 success = null）
    Pending,
    Success,
    Error,
}

/// 单个请求的持久化记录
///
/// 在 `start()` 时以 pending 状态创建，之后只被自己的完成回调修改一次。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// 在批次中的序号
    pub index: usize,
    /// null = 运行中，true = 成功，false = 失败
    pub success: Option<bool>,
    /// 用于展示的部分输入参数
    pub request_key: Vec<String>,
    /// 提交时是否已命中缓存
    pub in_cache: bool,
    /// 请求指纹
    pub cache_key: String,
    /// 开始时间（Unix 秒）
    pub start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 成功时合并进来的变体结果字段
    #[serde(flatten)]
    pub result: Map<String, JsonValue>,
}

impl RequestRecord {
    pub fn pending(
        index: usize,
        request_key: Vec<String>,
        cache_key: String,
        in_cache: bool,
        start_time: f64,
    ) -> Self {
        Self {
            index,
            success: None,
            request_key,
            in_cache,
            cache_key,
            start_time,
            end_time: None,
            error: None,
            result: Map::new(),
        }
    }

    pub fn status(&self) -> RecordStatus {
        match self.success {
            None => RecordStatus::Pending,
            Some(true) => RecordStatus::Success,
            Some(false) => RecordStatus::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.success.is_some()
    }

    /// 合并终态更新
    pub fn apply(&mut self, update: &RecordUpdate) {
        self.end_time = Some(update.end_time);
        match &update.outcome {
            Ok(result) => {
                self.success = Some(true);
                self.error = None;
                for (key, value) in result {
                    if !RESERVED_KEYS.contains(&key.as_str()) {
                        self.result.insert(key.clone(), value.clone());
                    }
                }
            }
            Err(message) => {
                self.success = Some(false);
                self.error = Some(message.clone());
            }
        }
    }
}

/// 写回单条记录的终态字段
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub end_time: f64,
    /// 成功时为变体结果，失败时为错误文本
    pub outcome: Result<Map<String, JsonValue>, String>,
}

/// 当前 Unix 时间（秒，带小数）
pub fn now_epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
