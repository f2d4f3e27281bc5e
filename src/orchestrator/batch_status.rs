//! 批次状态汇总 - 编排层
//!
//! 纯函数：读到的记录 → 完成 / 失败 / 运行中三组。不做任何 I/O。

use std::fmt;

use serde::Serialize;

use crate::models::{RecordStatus, RequestRecord};

/// 状态列表中的一项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEntry {
    pub index: usize,
    pub request_key: Vec<String>,
    pub in_cache: bool,
    /// 完成项为耗时（如 "1.2s"），失败项为错误文本，运行中为空
    pub detail: Option<String>,
}

impl StatusEntry {
    fn from_record(index: usize, record: &RequestRecord) -> Self {
        let detail = match record.status() {
            RecordStatus::Pending => None,
            RecordStatus::Success => {
                let elapsed = record.end_time.unwrap_or(record.start_time) - record.start_time;
                Some(format!("{:.1}s", elapsed))
            }
            RecordStatus::Error => Some(record.error.clone().unwrap_or_default()),
        };
        Self {
            index,
            request_key: record.request_key.clone(),
            in_cache: record.in_cache,
            detail,
        }
    }
}

impl fmt::Display for StatusEntry {
    /// `(0, "chr1:1-1", "in cache", "1.2s")`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.index)?;
        for key in &self.request_key {
            write!(f, ", {:?}", key)?;
        }
        if self.in_cache {
            write!(f, ", \"in cache\"")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ", {:?}", detail)?;
        }
        write!(f, ")")
    }
}

/// 批次状态（派生视图，不持久化）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStatus {
    pub completed: Vec<StatusEntry>,
    pub errored: Vec<StatusEntry>,
    pub running: Vec<StatusEntry>,
}

impl BatchStatus {
    /// 按当前记录分类，记录的位置就是它的序号
    pub fn from_records(records: &[RequestRecord]) -> Self {
        let mut status = Self::default();
        for (index, record) in records.iter().enumerate() {
            let entry = StatusEntry::from_record(index, record);
            match record.status() {
                RecordStatus::Pending => status.running.push(entry),
                RecordStatus::Success => status.completed.push(entry),
                RecordStatus::Error => status.errored.push(entry),
            }
        }
        status
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.errored.len() + self.running.len()
    }

    /// 成功百分比（向下取整），空批次为 0
    pub fn percent_success(&self) -> usize {
        percent(self.completed.len(), self.total())
    }

    /// 失败百分比（向下取整），空批次为 0
    pub fn percent_error(&self) -> usize {
        percent(self.errored.len(), self.total())
    }

    pub fn is_done(&self) -> bool {
        self.running.is_empty()
    }

    pub fn is_successful(&self) -> bool {
        self.completed.len() == self.total()
    }
}

fn percent(part: usize, total: usize) -> usize {
    if total == 0 {
        0
    } else {
        100 * part / total
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, entries: &[StatusEntry]) -> fmt::Result {
    write!(f, "[")?;
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", entry)?;
    }
    write!(f, "]")
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchStatus(")?;
        write_list(f, &self.completed)?;
        write!(f, ", ")?;
        write_list(f, &self.errored)?;
        write!(f, ", ")?;
        write_list(f, &self.running)?;
        write!(f, ")")
    }
}
