//! 基础设施层（Infrastructure）
//!
//! 持有稀缺资源，只暴露能力：
//! - `http` - 发送请求、规范化请求并计算指纹
//! - `cache` - 指纹 → 响应的内容寻址缓存
//! - `store` - 批次记录的持久化端口

pub mod cache;
pub mod http;
pub mod store;

pub use cache::{DiskCache, MemoryCache, ResponseCache};
pub use http::{
    FilePart, Fingerprint, HttpClient, HttpMethod, HttpRequest, HttpResponse, MockHttpClient,
    MultipartHasher, RequestBody, ReqwestHttpClient, MULTIPART_BOUNDARY,
};
pub use store::{JsonFileStore, MemoryStore, RecordStore};
