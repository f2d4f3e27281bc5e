//! 业务能力层（Services）
//!
//! 每个外部服务一个模块，各自实现 [`ScrapeRequest`] 契约：
//! 构造规范化请求、计算指纹、执行网络交互、解析页面。
//! 只处理单个请求，不知道批次和记录的存在。

pub mod crispor_guide;
pub mod crispor_primer;
pub mod crispresso;
pub mod html;
pub mod scrape_request;
pub mod tagin;
pub mod variant;

pub use crispor_guide::CrisporGuideRequest;
pub use crispor_primer::CrisporPrimerRequest;
pub use crispresso::CrispressoRequest;
pub use scrape_request::{Endpoints, PollSettings, ScrapeContext, ScrapeOutput, ScrapeRequest};
pub use tagin::TagInRequest;
pub use variant::{RequestFactory, Variant, VariantFactory};
