//! TagIn 设计查询 - 业务能力层
//!
//! 给定 Ensembl 转录本编号，从 tagin.stembio.org 获取 HDR 实验的候选 sgRNA 和供体序列。
//!
//! 需要三步会话：
//! 1. GET 提交页，拿到 csrftoken
//! 2. 带 token POST 表单创建设计，拿到设计 Id 和 sessionid
//! 3. 带两个 cookie GET 结果页
//!
//! 三步作为一个整体缓存，键是第 2 步（不含 token）的指纹。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::error::{ScrapeError, ScrapeResult};
use crate::infrastructure::cache::ResponseCache;
use crate::infrastructure::http::{Fingerprint, HttpRequest, HttpResponse};
use crate::services::html::Document;
use crate::services::scrape_request::{
    arg_or, ordered_object, required_arg, ScrapeContext, ScrapeOutput, ScrapeRequest,
};

const TOO_FAR: &str = "sgRNA too far from stop codon";

/// 第 2 步返回的 JSON
#[derive(Debug, Deserialize)]
struct DesignCreated {
    #[serde(rename = "Success", default)]
    success: bool,
    #[serde(rename = "Id", default)]
    id: Option<JsonValue>,
}

/// 结果页中的一个候选 guide
#[derive(Debug, Deserialize)]
struct TagInGuide {
    #[serde(rename = "sgRNA")]
    sg_rna: String,
    #[serde(rename = "sgRNA_score")]
    score: f64,
    #[serde(rename = "sgRNA_start")]
    start: i64,
    #[serde(rename = "sgRNA_stop")]
    stop: i64,
}

/// TagIn 请求
pub struct TagInRequest {
    ctx: Arc<ScrapeContext>,
    acc_number: String,
    form: Vec<(String, String)>,
}

impl TagInRequest {
    pub const NAME: &'static str = "tagin";

    pub fn new(ctx: Arc<ScrapeContext>, acc_number: &str, tag: &str, species: &str) -> Self {
        let form = vec![
            ("acc_number".to_string(), acc_number.to_string()),
            ("tag".to_string(), tag.to_string()),
            ("species".to_string(), species.to_string()),
        ];
        Self {
            ctx,
            acc_number: acc_number.to_string(),
            form,
        }
    }

    /// 位置参数：`acc_number, [tag=FLAG], [species=GRCh38]`
    pub fn from_args(ctx: Arc<ScrapeContext>, args: &[String]) -> ScrapeResult<Self> {
        let acc_number = required_arg(args, 0, "acc_number", Self::NAME)?;
        Ok(Self::new(
            ctx,
            &acc_number,
            &arg_or(args, 1, "FLAG"),
            &arg_or(args, 2, "GRCh38"),
        ))
    }

    fn endpoint(&self) -> &str {
        &self.ctx.endpoints.tagin
    }

    /// 用户关心的那一步：不带 token 的设计表单
    fn logical_request(&self) -> HttpRequest {
        HttpRequest::post_form(self.endpoint(), self.form.clone())
    }

    async fn init_session(&self) -> ScrapeResult<String> {
        let initial = self.ctx.fetch(&HttpRequest::get(self.endpoint())).await?;
        initial
            .cookie("csrftoken")
            .map(str::to_string)
            .ok_or_else(|| ScrapeError::protocol(format!("TagIn on {}: no csrftoken", self.acc_number)))
    }

    /// 创建设计，返回 (设计 Id, sessionid)
    async fn create_design(&self, csrftoken: &str) -> ScrapeResult<(String, String)> {
        let mut form = self.form.clone();
        form.push(("csrfmiddlewaretoken".to_string(), csrftoken.to_string()));
        let request = HttpRequest::post_form(self.endpoint(), form)
            .with_header("X-Requested-With", "XMLHttpRequest")
            .with_header("Cookie", format!("csrftoken={}", csrftoken));

        let response = self.ctx.fetch(&request).await?;
        let session_id = response
            .cookie("sessionid")
            .map(str::to_string)
            .ok_or_else(|| ScrapeError::protocol(format!("TagIn on {}: no sessionid", self.acc_number)))?;

        let created: DesignCreated = serde_json::from_str(&response.body).map_err(|e| {
            ScrapeError::protocol(format!("TagIn on {}: bad design response: {}", self.acc_number, e))
        })?;
        let id = match created.id {
            Some(JsonValue::String(id)) if created.success => id,
            Some(JsonValue::Number(id)) if created.success => id.to_string(),
            _ => {
                return Err(ScrapeError::RemoteFailure(format!(
                    "TagIn on {}: design was not created",
                    self.acc_number
                )))
            }
        };
        debug!("TagIn on {}: design {}", self.acc_number, id);
        Ok((id, session_id))
    }

    async fn fetch_design(&self) -> ScrapeResult<HttpResponse> {
        let csrftoken = self.init_session().await?;
        let (design_id, session_id) = self.create_design(&csrftoken).await?;
        let url = format!("{}{}", self.endpoint(), design_id);
        // 两个 cookie 都必须带上
        let request = HttpRequest::get(url).with_header(
            "Cookie",
            format!("csrftoken={}; sessionid={}", csrftoken, session_id),
        );
        self.ctx.fetch(&request).await
    }

    /// 解析结果页
    pub(crate) fn extract(&self, html: &str, url: &str) -> ScrapeResult<ScrapeOutput> {
        let doc = Document::parse(html)?;
        let protocol = |what: &str| ScrapeError::protocol(format!("TagIn on {}: {}", self.acc_number, what));

        let data_user: Vec<JsonValue> = doc
            .find_all(|e| e.is("div") && e.has_attr("data-user"))
            .into_iter()
            .filter_map(|e| e.attr("data-user"))
            .map(serde_json::from_str::<JsonValue>)
            .collect::<Result<_, _>>()
            .map_err(|e| protocol(&format!("bad data-user JSON: {}", e)))?;
        if data_user.len() < 2 {
            return Err(protocol("data-user blocks not found"));
        }

        let mut guides: Vec<TagInGuide> = serde_json::from_value(data_user[1].clone())
            .map_err(|e| protocol(&format!("bad guide list: {}", e)))?;
        guides.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut guide_seqs = ScrapeOutput::new();
        for guide in &guides {
            guide_seqs.insert(score_key(guide.score), json!(guide.sg_rna));
        }
        let known_guide = |seq: &str| guide_seqs.values().any(|v| v.as_str() == Some(seq));

        let donor_seqs: Vec<(String, String)> = match doc.by_id("table_id3") {
            Some(table) => doc
                .find_within(table, |e| e.is("tr"))
                .into_iter()
                .filter_map(|row| {
                    let cells = doc.find_within(row, |e| e.is("td"));
                    if cells.len() < 2 {
                        return None;
                    }
                    let guide = doc.text(cells[0]);
                    let donor = doc.text(cells[1]);
                    let valid = !guide.is_empty()
                        && !donor.trim().is_empty()
                        && donor.trim() != TOO_FAR
                        && known_guide(&guide);
                    valid.then_some((guide, donor))
                })
                .collect(),
            None => Vec::new(),
        };

        let mut metadata = data_user[0]
            .get(0)
            .and_then(JsonValue::as_object)
            .cloned()
            .ok_or_else(|| protocol("metadata not found"))?;
        let field = |name: &str| metadata.get(name).map(plain).unwrap_or_default();
        let chrm = field("chrm");
        let chr_loc = format!("chr{}:{}-{}", chrm, field("tx_start"), field("tx_stop"));
        metadata.insert("chr_loc".into(), json!(chr_loc));
        // 覆盖所有 guide 的较窄区间
        if let (Some(start), Some(stop)) = (
            guides.iter().map(|g| g.start).min(),
            guides.iter().map(|g| g.stop).max(),
        ) {
            metadata.insert(
                "guide_chr_range".into(),
                json!(format!("chr{}:{}-{}", chrm, start, stop)),
            );
        }

        if guides.is_empty() {
            guide_seqs.insert("not found".into(), json!("not found"));
        }

        let mut out = ScrapeOutput::new();
        out.insert("guide_seqs".into(), JsonValue::Object(guide_seqs));
        out.insert("donor_seqs".into(), ordered_object(donor_seqs));
        out.insert("metadata".into(), JsonValue::Object(metadata));
        out.insert("url".into(), json!(url));
        Ok(out)
    }
}

/// guide 分数保留两位小数作为键
fn score_key(score: f64) -> String {
    let rounded = (score * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format!("{:.1}", rounded)
    } else {
        rounded.to_string()
    }
}

/// JSON 值的纯文本形式（字符串不带引号）
fn plain(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ScrapeRequest for TagInRequest {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn fingerprint(&self) -> Fingerprint {
        self.logical_request().fingerprint()
    }

    fn cache(&self) -> &dyn ResponseCache {
        self.ctx.cache.as_ref()
    }

    async fn run(&self) -> ScrapeResult<ScrapeOutput> {
        let key = self.fingerprint();
        let page = match self.ctx.cached(&key) {
            Some(page) => page,
            None => {
                let page = self.fetch_design().await?;
                self.ctx.store(&key, &page);
                page
            }
        };
        self.extract(&page.body, &page.url)
            .inspect_err(|e| warn!("{}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cache::MemoryCache;
    use crate::infrastructure::http::{HttpMethod, MockHttpClient};
    use crate::infrastructure::http::RequestBody;

    const ENDPOINT: &str = "http://tagin.test/submit/";

    fn design_page() -> String {
        let meta = json!([{"chrm": "17", "tx_start": 7661779, "tx_stop": 7687538, "strand": "-"}]);
        let guides = json!([
            {"sgRNA": "GGTGAGCTGCCCCCAGGAAT", "sgRNA_score": 0.4567, "sgRNA_start": 7669600, "sgRNA_stop": 7669620},
            {"sgRNA": "CACCACCACACTATGTCGAA", "sgRNA_score": 0.912, "sgRNA_start": 7669610, "sgRNA_stop": 7669630}
        ]);
        let escape = |v: &JsonValue| v.to_string().replace('"', "&quot;");
        format!(
            r#"<html><body>
<div data-user="{}"></div>
<div data-user="{}"></div>
<table id="table_id3">
<tr><th>sgRNA</th><th>ssDNA</th></tr>
<tr><td>CACCACCACACTATGTCGAA</td><td>ATGCATGCATGC</td></tr>
<tr><td>GGTGAGCTGCCCCCAGGAAT</td><td> sgRNA too far from stop codon </td></tr>
<tr><td>TTTTTTTTTTTTTTTTTTTT</td><td>GGGGGG</td></tr>
</table>
</body></html>"#,
            escape(&meta),
            escape(&guides)
        )
    }

    fn ctx() -> (MockHttpClient, Arc<ScrapeContext>) {
        let mock = MockHttpClient::new();
        let mut ctx = ScrapeContext::new(Arc::new(mock.clone()), Arc::new(MemoryCache::new()));
        ctx.endpoints.tagin = ENDPOINT.to_string();
        (mock, Arc::new(ctx))
    }

    fn register_session(mock: &MockHttpClient) {
        mock.add_response(
            HttpMethod::Get,
            ENDPOINT,
            Ok(HttpResponse::ok(ENDPOINT, "<form></form>").with_cookie("csrftoken", "tok123")),
        );
        mock.add_response(
            HttpMethod::Post,
            ENDPOINT,
            Ok(HttpResponse::ok(ENDPOINT, r#"{"Success": true, "Id": "abc42"}"#)
                .with_cookie("sessionid", "sess9")),
        );
        let result_url = format!("{}abc42", ENDPOINT);
        mock.add_response(
            HttpMethod::Get,
            &result_url,
            Ok(HttpResponse::ok(result_url.as_str(), design_page())),
        );
    }

    #[test]
    fn score_keys_keep_two_decimals() {
        assert_eq!(score_key(0.4567), "0.46");
        assert_eq!(score_key(1.0), "1.0");
    }

    #[test]
    fn extracts_guides_donors_and_metadata() {
        let (_, ctx) = ctx();
        let req = TagInRequest::new(ctx, "ENST00000269305", "FLAG", "GRCh38");
        let out = req.extract(&design_page(), "http://tagin.test/submit/abc42").unwrap();

        let keys: Vec<&String> = out["guide_seqs"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["0.91", "0.46"]);
        assert_eq!(out["donor_seqs"], json!({"CACCACCACACTATGTCGAA": "ATGCATGCATGC"}));
        assert_eq!(out["metadata"]["chr_loc"], json!("chr17:7661779-7687538"));
        assert_eq!(out["metadata"]["guide_chr_range"], json!("chr17:7669600-7669630"));
    }

    #[tokio::test]
    async fn three_step_session_is_cached_as_one_unit() {
        let (mock, ctx) = ctx();
        register_session(&mock);

        let req = TagInRequest::new(ctx.clone(), "ENST00000269305", "FLAG", "GRCh38");
        assert!(!req.in_cache());
        let out = req.run().await.unwrap();
        assert_eq!(out["url"], json!("http://tagin.test/submit/abc42"));
        assert_eq!(mock.call_count(), 3);

        let calls = mock.calls();
        let post = &calls[1];
        assert!(post.headers.contains(&("Cookie".to_string(), "csrftoken=tok123".to_string())));
        match &post.body {
            RequestBody::Form(pairs) => assert!(pairs
                .contains(&("csrfmiddlewaretoken".to_string(), "tok123".to_string()))),
            other => panic!("unexpected body {:?}", other),
        }
        assert!(calls[2]
            .headers
            .contains(&("Cookie".to_string(), "csrftoken=tok123; sessionid=sess9".to_string())));

        let replay = TagInRequest::new(ctx, "ENST00000269305", "FLAG", "GRCh38");
        assert!(replay.in_cache());
        replay.run().await.unwrap();
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn rejected_design_is_a_remote_failure() {
        let (mock, ctx) = ctx();
        mock.add_response(
            HttpMethod::Get,
            ENDPOINT,
            Ok(HttpResponse::ok(ENDPOINT, "").with_cookie("csrftoken", "tok")),
        );
        mock.add_response(
            HttpMethod::Post,
            ENDPOINT,
            Ok(HttpResponse::ok(ENDPOINT, r#"{"Success": false}"#).with_cookie("sessionid", "s")),
        );

        let err = TagInRequest::new(ctx.clone(), "BOGUS", "FLAG", "GRCh38")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::RemoteFailure(_)));
        assert!(ctx.cache.get(&TagInRequest::new(ctx.clone(), "BOGUS", "FLAG", "GRCh38").fingerprint()).is_none());
    }
}
