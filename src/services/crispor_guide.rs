//! Crispor 向导序列查询 - 业务能力层
//!
//! 给定序列或染色体区间，从 Crispor 获取候选 guide。
//! Crispor 没有正式的 API，这里解析的是它的结果页面。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use crate::error::{ScrapeError, ScrapeResult};
use crate::infrastructure::cache::ResponseCache;
use crate::infrastructure::http::{Fingerprint, HttpRequest};
use crate::services::html::Document;
use crate::services::scrape_request::{
    arg_or, ordered_object, percent_encode, required_arg, ScrapeContext, ScrapeOutput,
    ScrapeRequest,
};

/// Crispor guide 请求
///
/// 同一个结构服务两种入口：提交新序列（POST 表单），或按已有 batch id 读取结果（GET）。
pub struct CrisporGuideRequest {
    ctx: Arc<ScrapeContext>,
    name: &'static str,
    request: HttpRequest,
    seq: String,
    target: String,
}

impl CrisporGuideRequest {
    pub const NAME: &'static str = "crispor_guide";
    pub const BY_ID_NAME: &'static str = "crispor_guide_by_id";

    pub fn new(
        ctx: Arc<ScrapeContext>,
        seq: &str,
        name: &str,
        org: &str,
        pam: &str,
        target: &str,
    ) -> Self {
        let form = vec![
            ("name".to_string(), name.to_string()),
            ("seq".to_string(), seq.to_string()),
            ("org".to_string(), org.to_string()),
            ("pam".to_string(), pam.to_string()),
            ("sortBy".to_string(), "spec".to_string()),
            ("submit".to_string(), "SUBMIT".to_string()),
        ];
        let request = HttpRequest::post_form(ctx.endpoints.crispor.clone(), form);
        Self {
            ctx,
            name: Self::NAME,
            request,
            seq: seq.to_string(),
            target: target.to_string(),
        }
    }

    /// 位置参数：`seq, [name], [org=hg38], [pam=NGG], [target]`
    pub fn from_args(ctx: Arc<ScrapeContext>, args: &[String]) -> ScrapeResult<Self> {
        let seq = required_arg(args, 0, "seq", Self::NAME)?;
        Ok(Self::new(
            ctx,
            &seq,
            &arg_or(args, 1, ""),
            &arg_or(args, 2, "hg38"),
            &arg_or(args, 3, "NGG"),
            &arg_or(args, 4, ""),
        ))
    }

    /// 读取已有 batch 的结果
    pub fn by_batch_id(ctx: Arc<ScrapeContext>, batch_id: &str) -> Self {
        let url = format!("{}?batchId={}", ctx.endpoints.crispor, batch_id);
        Self {
            ctx,
            name: Self::BY_ID_NAME,
            request: HttpRequest::get(url),
            seq: batch_id.to_string(),
            target: String::new(),
        }
    }

    /// 位置参数：`batch_id`
    pub fn by_batch_id_from_args(ctx: Arc<ScrapeContext>, args: &[String]) -> ScrapeResult<Self> {
        let batch_id = required_arg(args, 0, "batch_id", Self::BY_ID_NAME)?;
        Ok(Self::by_batch_id(ctx, &batch_id))
    }

    /// 错误信息中用来标识请求的文本
    fn label(&self) -> &str {
        if self.target.is_empty() {
            &self.seq
        } else {
            &self.target
        }
    }

    fn sentinel(&self, key: &str) -> ScrapeOutput {
        let mut out = ScrapeOutput::new();
        out.insert("target".into(), json!(self.target));
        out.insert("seq".into(), json!(self.seq));
        out.insert("guide_seqs".into(), ordered_object([(key, key)]));
        out
    }

    /// 解析结果页面
    pub(crate) fn extract(&self, html: &str) -> ScrapeResult<ScrapeOutput> {
        let doc = Document::parse(html)?;
        let label = self.label();

        if let Some(title) = doc.by_class("title") {
            let title_text = doc.text(title);
            if title_text.contains("not present in the selected genome") {
                return Err(ScrapeError::invalid_input(format!(
                    "Crispor on {}: {}",
                    label,
                    title_text.trim()
                )));
            }
        }

        let central = doc
            .by_class("contentcentral")
            .map(|e| doc.text(e))
            .unwrap_or_default();
        if central.contains("retry with a sequence range shorter than 2000 bp") {
            return Err(ScrapeError::invalid_input(format!(
                "Crispor on {}: retry with a sequence range shorter than 2000 bp",
                label
            )));
        }
        if central.contains("This page will refresh every 10 seconds") {
            return Err(ScrapeError::timeout(format!(
                "Crispor on {}: Stuck in job queue. Please retry.",
                label
            )));
        }

        let page_text = doc.full_text();
        if let Some(line) = page_text
            .lines()
            .map(str::trim)
            .find(|l| l.contains("Bad sequence size"))
        {
            let reason = &line[line.find("Bad sequence size").unwrap_or(0)..];
            return Err(ScrapeError::invalid_input(format!(
                "Crispor on {}: {}",
                label,
                reason.trim_end_matches('.')
            )));
        }

        let Some(table) = doc.by_id("otTable") else {
            if page_text.contains("Found no possible guide sequence") {
                return Ok(self.sentinel("not found"));
            }
            if page_text.contains("Server error: could not run command") {
                return Ok(self.sentinel("server error"));
            }
            if page_text.contains("are not valid in the genome") {
                return Ok(self.sentinel("invalid chromosome range"));
            }
            let body = doc
                .find(|e| e.is("body"))
                .map(|b| doc.text(b))
                .unwrap_or(page_text);
            return Err(ScrapeError::protocol(format!(
                "Crispor on {}: No output rows. \"{}\"",
                self.seq,
                body.trim()
            )));
        };

        let batch_id = doc
            .find(|e| e.is("input") && e.attr("name") == Some("batchId"))
            .and_then(|e| e.attr("value"))
            .ok_or_else(|| {
                ScrapeError::protocol(format!("Crispor on {}: batchId not found", label))
            })?
            .to_string();

        let endpoint = &self.ctx.endpoints.crispor;
        let rows = doc.find_within(table, |e| e.has_class("guideRow") && e.has_attr("id"));
        let mut guide_seqs = Vec::with_capacity(rows.len());
        let mut primer_urls = Vec::with_capacity(rows.len());
        for row in rows {
            let pam_id = row.attr("id").unwrap_or_default().to_string();
            let guide = doc
                .find_after(row.start, |e| e.is("tt"))
                .map(|tt| doc.text(tt).trim().to_string())
                .unwrap_or_default();
            primer_urls.push((
                pam_id.clone(),
                format!(
                    "{}?batchId={}&pamId={}&pam=NGG",
                    endpoint,
                    batch_id,
                    percent_encode(&pam_id)
                ),
            ));
            guide_seqs.push((pam_id, guide));
        }

        let mut out = ScrapeOutput::new();
        out.insert("target".into(), json!(self.target));
        out.insert("seq".into(), json!(self.seq));
        out.insert("url".into(), json!(format!("{}?batchId={}", endpoint, batch_id)));
        out.insert("batch_id".into(), json!(batch_id));
        out.insert("guide_seqs".into(), ordered_object(guide_seqs));
        out.insert("primer_urls".into(), ordered_object(primer_urls));
        for (field, download) in [
            ("fasta_url", "download=fasta"),
            ("benchling_url", "download=benchling"),
            ("guides_url", "download=guides&format=tsv"),
            ("offtargets_url", "download=offtargets&format=tsv"),
        ] {
            out.insert(
                field.into(),
                JsonValue::String(format!("{}?batchId={}&{}", endpoint, batch_id, download)),
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl ScrapeRequest for CrisporGuideRequest {
    fn name(&self) -> &'static str {
        self.name
    }

    fn fingerprint(&self) -> Fingerprint {
        self.request.fingerprint()
    }

    fn cache(&self) -> &dyn ResponseCache {
        self.ctx.cache.as_ref()
    }

    async fn run(&self) -> ScrapeResult<ScrapeOutput> {
        let response = self.ctx.fetch_cached(&self.request).await?;
        self.extract(&response.body).inspect_err(|e| {
            warn!("{}", e);
        })
    }
}
