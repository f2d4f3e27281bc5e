//! Crispor 引物查询 - 业务能力层
//!
//! 为 Crispor 生成的某个 guide 获取引物（Crispor 内部使用 Primer3）。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::error::{ScrapeError, ScrapeResult};
use crate::infrastructure::cache::ResponseCache;
use crate::infrastructure::http::{Fingerprint, HttpRequest};
use crate::services::html::{Document, Element};
use crate::services::scrape_request::{
    arg_or, ordered_object, percent_encode, required_arg, ScrapeContext, ScrapeOutput,
    ScrapeRequest,
};

/// Crispor 引物请求
pub struct CrisporPrimerRequest {
    ctx: Arc<ScrapeContext>,
    request: HttpRequest,
    pam_id: String,
    /// 只用于结果元数据
    seq: String,
    /// 协议错误时的额外尝试次数
    retries: u32,
}

impl CrisporPrimerRequest {
    pub const NAME: &'static str = "crispor_primer";

    pub fn new(
        ctx: Arc<ScrapeContext>,
        batch_id: &str,
        pam_id: &str,
        amp_len: &str,
        tm: &str,
        pam: &str,
        seq: &str,
    ) -> Self {
        // pam_id 中的 '+' 必须编码
        let url = format!(
            "{}?ampLen={}&tm={}&batchId={}&pamId={}&pam={}",
            ctx.endpoints.crispor,
            amp_len,
            tm,
            batch_id,
            percent_encode(pam_id),
            pam
        );
        Self {
            ctx,
            request: HttpRequest::get(url),
            pam_id: pam_id.to_string(),
            seq: seq.to_string(),
            retries: 1,
        }
    }

    /// 位置参数：`batch_id, pam_id, [amp_len=400], [tm=60], [pam=NGG], [seq]`
    pub fn from_args(ctx: Arc<ScrapeContext>, args: &[String]) -> ScrapeResult<Self> {
        let batch_id = required_arg(args, 0, "batch_id", Self::NAME)?;
        let pam_id = required_arg(args, 1, "pam_id", Self::NAME)?;
        let amp_len = arg_or(args, 2, "400");
        let tm = arg_or(args, 3, "60");
        for (name, value) in [("amp_len", &amp_len), ("tm", &tm)] {
            if value.parse::<u32>().is_err() {
                return Err(ScrapeError::invalid_input(format!(
                    "{}: {} must be an integer, got '{}'",
                    Self::NAME,
                    name,
                    value
                )));
            }
        }
        Ok(Self::new(
            ctx,
            &batch_id,
            &pam_id,
            &amp_len,
            &tm,
            &arg_or(args, 4, "NGG"),
            &arg_or(args, 5, ""),
        ))
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }

    fn selected_option(doc: &Document<'_>, select_name: &str) -> ScrapeResult<String> {
        let select = doc
            .find(|e| e.is("select") && e.attr("name") == Some(select_name))
            .ok_or_else(|| {
                ScrapeError::protocol(format!("Crispor primers: select '{}' not found", select_name))
            })?;
        doc.find_within(select, |e| e.is("option") && e.has_attr("selected"))
            .first()
            .and_then(|o| o.attr("value"))
            .map(str::to_string)
            .ok_or_else(|| {
                ScrapeError::protocol(format!(
                    "Crispor primers: no selected option in '{}'",
                    select_name
                ))
            })
    }

    fn ontarget_primers(doc: &Document<'_>) -> ScrapeResult<Vec<(String, String)>> {
        let table = doc
            .by_id("ontargetPcr")
            .and_then(|anchor| doc.find_after(anchor.start, |e| e.has_class("primerTable")))
            .ok_or_else(|| ScrapeError::protocol("Crispor primers: ontarget primer table not found"))?;

        let primers = doc
            .find_within(table, |e| e.is("tr"))
            .into_iter()
            .filter_map(|row| {
                let cells: Vec<&Element> = doc.find_within(row, |e| e.is("td"));
                if cells.len() < 2 {
                    return None;
                }
                let id = doc.text(cells[0]);
                let key = id.trim().rsplit('_').next().unwrap_or_default().to_string();
                Some((key, doc.text(cells[1]).trim().to_string()))
            })
            .collect();
        Ok(primers)
    }

    /// 解析引物页面
    pub(crate) fn extract(&self, html: &str) -> ScrapeResult<ScrapeOutput> {
        let doc = Document::parse(html)?;
        if doc.full_text().contains("exceptions.ValueError") {
            return Err(ScrapeError::protocol("Crispor exceptions.ValueError"));
        }

        let mut out = ScrapeOutput::new();
        out.insert("pam_id".into(), json!(self.pam_id));
        out.insert("seq".into(), json!(self.seq));
        out.insert("url".into(), json!(self.request.url));
        out.insert("amplicon_length".into(), json!(Self::selected_option(&doc, "ampLen")?));
        out.insert("primer_temp".into(), json!(Self::selected_option(&doc, "tm")?));
        out.insert(
            "ontarget_primers".into(),
            ordered_object(Self::ontarget_primers(&doc)?),
        );
        Ok(out)
    }
}

#[async_trait]
impl ScrapeRequest for CrisporPrimerRequest {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn fingerprint(&self) -> Fingerprint {
        self.request.fingerprint()
    }

    fn cache(&self) -> &dyn ResponseCache {
        self.ctx.cache.as_ref()
    }

    async fn run(&self) -> ScrapeResult<ScrapeOutput> {
        let mut attempt = 0;
        loop {
            let response = self.ctx.fetch_cached(&self.request).await?;
            match self.extract(&response.body) {
                Err(e @ ScrapeError::Protocol(_)) if attempt < self.retries => {
                    warn!("{}，重新请求 {}", e, self.request.url);
                    // 坏页面已进缓存，不删掉重试只会拿到同一份
                    self.invalidate_cache();
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cache::MemoryCache;
    use crate::infrastructure::http::{HttpMethod, HttpResponse, MockHttpClient};

    const BASE: &str = "http://crispor.test/crispor.py";

    const PRIMER_PAGE: &str = r#"<html><body>
<select name="ampLen"><option value="300">300</option><option value="400" selected>400</option></select>
<select name="tm"><option value="58">58</option><option value="60" selected="selected">60</option></select>
<h3 id="ontargetPcr">On-target PCR</h3>
<table class="primerTable">
<tr><td>s185+_left</td><td>ACAGCTTGCTCTTCCCTGTC</td></tr>
<tr><td>s185+_right</td><td>TTGGTCTCCAGCCTGAAGTC</td></tr>
</table>
</body></html>"#;

    fn ctx() -> (MockHttpClient, Arc<ScrapeContext>) {
        let mock = MockHttpClient::new();
        let mut ctx = ScrapeContext::new(Arc::new(mock.clone()), Arc::new(MemoryCache::new()));
        ctx.endpoints.crispor = BASE.to_string();
        (mock, Arc::new(ctx))
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn builds_url_with_encoded_pam_id() {
        let (_, ctx) = ctx();
        let req = CrisporPrimerRequest::from_args(ctx, &args(&["9cJN", "s185+"])).unwrap();
        assert_eq!(
            req.url(),
            format!("{}?ampLen=400&tm=60&batchId=9cJN&pamId=s185%2B&pam=NGG", BASE)
        );
    }

    #[test]
    fn rejects_non_numeric_amplicon_length() {
        let (_, ctx) = ctx();
        let err = CrisporPrimerRequest::from_args(ctx, &args(&["9cJN", "s185+", "long"])).err().unwrap();
        assert!(matches!(err, ScrapeError::InvalidInput(_)));
    }

    #[test]
    fn extracts_selected_options_and_primers() {
        let (_, ctx) = ctx();
        let req = CrisporPrimerRequest::from_args(ctx, &args(&["9cJN", "s185+"])).unwrap();
        let out = req.extract(PRIMER_PAGE).unwrap();
        assert_eq!(out["amplicon_length"], json!("400"));
        assert_eq!(out["primer_temp"], json!("60"));
        assert_eq!(
            out["ontarget_primers"],
            json!({"left": "ACAGCTTGCTCTTCCCTGTC", "right": "TTGGTCTCCAGCCTGAAGTC"})
        );
    }

    #[tokio::test]
    async fn value_error_page_is_retried_once() {
        let (mock, ctx) = ctx();
        let req = CrisporPrimerRequest::from_args(ctx, &args(&["9cJN", "s185+"])).unwrap();
        let url = req.url().to_string();
        mock.add_response(
            HttpMethod::Get,
            &url,
            Ok(HttpResponse::ok(url.as_str(), "<pre>exceptions.ValueError</pre>")),
        );
        mock.add_response(HttpMethod::Get, &url, Ok(HttpResponse::ok(url.as_str(), PRIMER_PAGE)));

        let out = req.run().await.unwrap();
        assert_eq!(out["pam_id"], json!("s185+"));
        assert_eq!(mock.calls_to(&url), 2);
    }

    #[tokio::test]
    async fn persistent_value_error_surfaces_as_protocol() {
        let (mock, ctx) = ctx();
        let req = CrisporPrimerRequest::from_args(ctx, &args(&["9cJN", "s7-"])).unwrap();
        let url = req.url().to_string();
        mock.add_sticky_response(
            HttpMethod::Get,
            &url,
            Ok(HttpResponse::ok(url.as_str(), "exceptions.ValueError")),
        );

        let err = req.run().await.unwrap_err();
        assert!(matches!(err, ScrapeError::Protocol(_)));
        assert_eq!(mock.calls_to(&url), 2);
    }
}
