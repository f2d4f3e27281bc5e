//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批次提交和进度汇总，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_request` - 批次编排器
//! - 一次性写入所有 pending 记录
//! - 控制每个批次的并发数量（Semaphore）
//! - 串行写回每一项的终态（单条定向更新）
//! - `start()` 立即返回，批次在后台继续运行
//!
//! ### `batch_status` - 状态汇总
//! - 纯函数，从当前记录计算完成 / 失败 / 运行中
//! - 成功、失败百分比和整体是否完成
//!
//! ## 层次关系
//!
//! ```text
//! batch_request (处理 Vec<args>)
//!     ↓
//! workflow::RequestExecutor (处理单个请求)
//!     ↓
//! services (能力层：crispor / crispresso / tagin)
//!     ↓
//! infrastructure (基础设施：http / cache / store)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一职责**：batch_request 管提交与回写，batch_status 只做分类
//! 2. **唯一写者**：每个批次只有一个任务写回结果，记录按下标定向更新
//! 3. **向下依赖**：编排层 → workflow → services → infrastructure
//! 4. **无业务逻辑**：不解析页面，不判断错误类型

pub mod batch_request;
pub mod batch_status;

// 重新导出主要类型
pub use batch_request::{resolve_display_key, BatchRequest, BatchSettings};
pub use batch_status::{BatchStatus, StatusEntry};
