use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::services::Variant;

/// 一个批次文件描述的批次
///
/// ```toml
/// entity_id = "ENSG00000141510"
/// variant = "crispor_guide"
/// display_keys = [-1]
/// args = [
///     ["ACGT...", "exon2", "hg38", "NGG", "chr17:7,676,000-7,676,200"],
/// ]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSpec {
    /// 拥有结果记录的实体
    pub entity_id: String,
    /// 请求类型名称
    pub variant: String,
    /// 记录字段，缺省时使用该类型的默认字段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    /// 每项参数中用于展示的位置，负数从末尾数起
    #[serde(default)]
    pub display_keys: Vec<i64>,
    /// 每项的位置参数
    #[serde(default)]
    pub args: Vec<Vec<String>>,
    #[serde(skip_serializing, skip_deserializing)]
    pub file_path: Option<String>,
}

impl BatchSpec {
    pub fn variant(&self) -> Result<Variant, ConfigError> {
        self.variant.parse()
    }

    /// 实际使用的记录字段
    pub fn field_name(&self) -> Result<String, ConfigError> {
        match &self.field_name {
            Some(field) if !field.trim().is_empty() => Ok(field.clone()),
            _ => Ok(self.variant()?.field_name().to_string()),
        }
    }
}
