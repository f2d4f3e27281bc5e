//! # Batch Scrape
//!
//! 把一批缓慢、不可靠的网页工具请求（CRISPOR、CRISPResso、TagIn）
//! 提交到后台运行，逐项记录结果，并随时汇总进度。
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源，只暴露能力
//! - `HttpClient` - 发送请求；`HttpRequest::fingerprint()` 计算内容指纹
//! - `ResponseCache` - 指纹 → 响应的缓存（内存 / 磁盘）
//! - `RecordStore` - 批次记录的持久化端口（内存 / JSON 文件）
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，每个模块对应一个外部工具
//! - `ScrapeRequest` - 单个请求的契约（指纹、缓存、运行）
//! - `Variant` / `VariantFactory` - 由参数构造具体请求
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个请求"的完整处理流程
//! - `RequestExecutor` - 运行、清理中毒缓存、退避重试、归一化为终态
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_request` - 批次提交、并发控制、结果回写
//! - `orchestrator/batch_status` - 从记录汇总进度
//!
//! ## 模块结构

pub mod app;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use app::App;
pub use config::Config;
pub use error::{AppError, AppResult, ScrapeError, ScrapeResult};
pub use infrastructure::{HttpClient, RecordStore, ResponseCache};
pub use models::{BatchSpec, RecordUpdate, RequestRecord};
pub use orchestrator::{BatchRequest, BatchSettings, BatchStatus};
pub use services::{RequestFactory, ScrapeRequest, Variant, VariantFactory};
pub use workflow::{RequestExecutor, RetryPolicy};
