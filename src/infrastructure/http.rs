//! HTTP 访问 - 基础设施层
//!
//! 只暴露"发送一个请求"的能力，以及请求的规范化编码（指纹）。
//! 不认识任何外部服务，也不解析 HTML。

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, SET_COOKIE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{ScrapeError, ScrapeResult};

/// multipart 上传使用的固定分隔符
///
/// 同样的文件字节必须产生同样的请求体，否则每次上传的指纹都不同，缓存永远不会命中。
pub const MULTIPART_BOUNDARY: &str = "batch_scrape_fixed_form_boundary";

/// 请求指纹：方法 + URL + 参数的 SHA-256 十六进制摘要
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// 上传的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub field: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// 请求体
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Empty,
    /// application/x-www-form-urlencoded，保持字段顺序
    Form(Vec<(String, String)>),
    /// multipart/form-data，使用 [`MULTIPART_BOUNDARY`]
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<FilePart>,
    },
}

impl RequestBody {
    /// 按固定分隔符编码 multipart 请求体
    pub fn encode_multipart(fields: &[(String, String)], files: &[FilePart]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in fields {
            out.extend_from_slice(&multipart_field(name, value));
        }
        for file in files {
            out.extend_from_slice(&multipart_file_header(&file.field, &file.filename));
            out.extend_from_slice(&file.bytes);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(&multipart_closing());
        out
    }

    /// 用于计算指纹的规范化字节
    fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            RequestBody::Empty => Vec::new(),
            // 字符串对的 JSON 编码是确定的
            RequestBody::Form(pairs) => serde_json::to_vec(pairs).unwrap_or_default(),
            RequestBody::Multipart { fields, files } => Self::encode_multipart(fields, files),
        }
    }
}

fn multipart_field(name: &str, value: &str) -> Vec<u8> {
    format!(
        "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
        MULTIPART_BOUNDARY, name, value
    )
    .into_bytes()
}

fn multipart_file_header(field: &str, filename: &str) -> Vec<u8> {
    format!(
        "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
        MULTIPART_BOUNDARY, field, filename
    )
    .into_bytes()
}

fn multipart_closing() -> Vec<u8> {
    format!("--{}--\r\n", MULTIPART_BOUNDARY).into_bytes()
}

/// 流式计算 multipart POST 的指纹
///
/// 文件内容按块读入，不需要整体放进内存。结果与对完整请求调用
/// [`HttpRequest::fingerprint`] 相同。
pub struct MultipartHasher {
    hasher: Sha256,
}

impl MultipartHasher {
    /// 普通字段必须在文件之前一次给出
    pub fn new(url: &str, fields: &[(String, String)]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(HttpMethod::Post.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        for (name, value) in fields {
            hasher.update(multipart_field(name, value));
        }
        Self { hasher }
    }

    /// 追加一个文件，从 `reader` 读到结尾
    pub fn add_file(&mut self, field: &str, filename: &str, mut reader: impl Read) -> io::Result<()> {
        self.hasher.update(multipart_file_header(field, filename));
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.hasher.update(&buf[..n]);
        }
        self.hasher.update(b"\r\n");
        Ok(())
    }

    pub fn finish(mut self) -> Fingerprint {
        self.hasher.update(multipart_closing());
        Fingerprint(format!("{:x}", self.hasher.finalize()))
    }
}

/// 一个待发送的 HTTP 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    /// 请求头不参与指纹计算（Cookie、CSRF 令牌每次会话都不同）
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post_form(url: impl Into<String>, pairs: Vec<(String, String)>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Form(pairs),
        }
    }

    pub fn post_multipart(
        url: impl Into<String>,
        fields: Vec<(String, String)>,
        files: Vec<FilePart>,
    ) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Multipart { fields, files },
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// 计算请求指纹（纯函数，无 I/O）
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.url.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.body.canonical_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }
}

/// HTTP 响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    /// 跟随重定向之后的最终 URL
    pub url: String,
    pub body: String,
    #[serde(default)]
    pub cookies: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn ok(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status: 200,
            url: url.into(),
            body: body.into(),
            cookies: Vec::new(),
        }
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// 非 2xx 状态码转换为错误
    pub fn error_for_status(self) -> ScrapeResult<Self> {
        if (200..300).contains(&self.status) {
            Ok(self)
        } else {
            Err(ScrapeError::Http {
                url: self.url,
                status: self.status,
            })
        }
    }
}

/// 发送 HTTP 请求的能力
///
/// 生产环境使用 [`ReqwestHttpClient`]，测试使用 [`MockHttpClient`]。
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// 发送请求并返回响应（不检查状态码）
    async fn send(&self, request: &HttpRequest) -> ScrapeResult<HttpResponse>;
}

// ========== 基于 reqwest 的实现 ==========

/// 真实的 HTTP 客户端
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> ScrapeResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: &HttpRequest) -> ScrapeResult<HttpResponse> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(pairs) => builder.form(pairs),
            RequestBody::Multipart { fields, files } => builder
                .header(
                    CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY),
                )
                .body(RequestBody::encode_multipart(fields, files)),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        let body = response.text().await?;

        debug!(
            "{} {} -> {} ({} 字节)",
            request.method.as_str(),
            request.url,
            status,
            body.len()
        );

        Ok(HttpResponse {
            status,
            url,
            body,
            cookies,
        })
    }
}

/// 从 Set-Cookie 头中取出 name=value
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

// ========== 测试用实现 ==========

/// 模拟 HTTP 客户端
///
/// 按 "METHOD url" 预先登记响应，同一个键的多个响应按先进先出返回；
/// 队列用完后返回用 [`MockHttpClient::add_sticky_response`] 登记的固定响应。
#[derive(Clone, Default)]
pub struct MockHttpClient {
    queued: Arc<Mutex<HashMap<String, Vec<ScrapeResult<HttpResponse>>>>>,
    sticky: Arc<Mutex<HashMap<String, ScrapeResult<HttpResponse>>>>,
    calls: Arc<Mutex<Vec<HttpRequest>>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(method: HttpMethod, url: &str) -> String {
        format!("{} {}", method.as_str(), url)
    }

    /// 登记一次性响应
    pub fn add_response(&self, method: HttpMethod, url: &str, response: ScrapeResult<HttpResponse>) {
        self.queued
            .lock()
            .entry(Self::key(method, url))
            .or_default()
            .push(response);
    }

    /// 登记可重复返回的响应
    pub fn add_sticky_response(
        &self,
        method: HttpMethod,
        url: &str,
        response: ScrapeResult<HttpResponse>,
    ) {
        self.sticky.lock().insert(Self::key(method, url), response);
    }

    /// 所有已发出的请求
    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// 发往某个 URL 的请求数量
    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.url == url).count()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn send(&self, request: &HttpRequest) -> ScrapeResult<HttpResponse> {
        self.calls.lock().push(request.clone());
        info!("{} request to: {} (mock)", request.method.as_str(), request.url);

        let key = Self::key(request.method, &request.url);
        let queued = {
            let mut queued = self.queued.lock();
            queued
                .get_mut(&key)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };

        if let Some(response) = queued {
            return response;
        }
        if let Some(response) = self.sticky.lock().get(&key) {
            return response.clone();
        }

        Err(ScrapeError::Transport {
            url: request.url.clone(),
            message: format!("没有为 {} 登记模拟响应", key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn identical_requests_share_a_fingerprint() {
        let a = HttpRequest::post_form("http://x/crispor.py", pairs(&[("seq", "ACGT")]));
        let b = HttpRequest::post_form("http://x/crispor.py", pairs(&[("seq", "ACGT")]))
            .with_header("Cookie", "csrftoken=abc");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn different_parameters_change_the_fingerprint() {
        let a = HttpRequest::post_form("http://x/crispor.py", pairs(&[("seq", "ACGT")]));
        let b = HttpRequest::post_form("http://x/crispor.py", pairs(&[("seq", "ACGA")]));
        let c = HttpRequest::get("http://x/crispor.py");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn repeated_uploads_are_cache_equivalent() {
        let file = FilePart {
            field: "fastq_r1".to_string(),
            filename: "r1.fastq.gz".to_string(),
            bytes: vec![1, 2, 3, 4],
        };
        let a = HttpRequest::post_multipart("http://x/submit", pairs(&[("a", "1")]), vec![file.clone()]);
        let b = HttpRequest::post_multipart("http://x/submit", pairs(&[("a", "1")]), vec![file]);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let body = RequestBody::encode_multipart(&pairs(&[("a", "1")]), &[]);
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with(&format!("--{}\r\n", MULTIPART_BOUNDARY)));
        assert!(text.ends_with(&format!("--{}--\r\n", MULTIPART_BOUNDARY)));
    }

    #[test]
    fn streamed_upload_matches_in_memory_fingerprint() {
        let fields = pairs(&[("amplicon", "ACGT"), ("sgRNA", "")]);
        let r1 = b"@r1\nACGT\n+\nIIII\n".to_vec();
        let r2 = vec![7u8; 200_000];

        let mut hasher = MultipartHasher::new("http://x/submit", &fields);
        hasher.add_file("fastq_r1", "r1.fastq", r1.as_slice()).unwrap();
        hasher.add_file("fastq_r2", "r2.fastq", r2.as_slice()).unwrap();

        let request = HttpRequest::post_multipart(
            "http://x/submit",
            fields,
            vec![
                FilePart {
                    field: "fastq_r1".to_string(),
                    filename: "r1.fastq".to_string(),
                    bytes: r1,
                },
                FilePart {
                    field: "fastq_r2".to_string(),
                    filename: "r2.fastq".to_string(),
                    bytes: r2,
                },
            ],
        );
        assert_eq!(hasher.finish(), request.fingerprint());
    }

    #[test]
    fn set_cookie_header_is_split() {
        assert_eq!(
            parse_set_cookie("csrftoken=abc123; expires=Sat; Path=/"),
            Some(("csrftoken".to_string(), "abc123".to_string()))
        );
        assert_eq!(parse_set_cookie("garbage"), None);
    }

    #[tokio::test]
    async fn mock_client_queues_then_sticks() {
        let mock = MockHttpClient::new();
        mock.add_response(HttpMethod::Get, "http://x/status", Ok(HttpResponse::ok("http://x/status", "first")));
        mock.add_sticky_response(HttpMethod::Get, "http://x/status", Ok(HttpResponse::ok("http://x/status", "again")));

        let req = HttpRequest::get("http://x/status");
        assert_eq!(mock.send(&req).await.unwrap().body, "first");
        assert_eq!(mock.send(&req).await.unwrap().body, "again");
        assert_eq!(mock.send(&req).await.unwrap().body, "again");
        assert_eq!(mock.calls_to("http://x/status"), 3);

        let missing = mock.send(&HttpRequest::get("http://x/other")).await;
        assert!(matches!(missing, Err(ScrapeError::Transport { .. })));
    }

    #[test]
    fn non_success_status_is_an_error() {
        let response = HttpResponse {
            status: 503,
            ..HttpResponse::ok("http://x", "")
        };
        assert!(matches!(
            response.error_for_status(),
            Err(ScrapeError::Http { status: 503, .. })
        ));
    }
}
