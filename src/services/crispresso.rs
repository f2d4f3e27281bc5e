//! CRISPResso2 分析 - 业务能力层
//!
//! 提交测序文件后轮询任务状态，成功后读取报告页面。通常需要 90 秒左右。

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{ScrapeError, ScrapeResult};
use crate::infrastructure::cache::ResponseCache;
use crate::infrastructure::http::{FilePart, Fingerprint, HttpRequest, MultipartHasher};
use crate::services::html::Document;
use crate::services::scrape_request::{
    arg_or, required_arg, ScrapeContext, ScrapeOutput, ScrapeRequest,
};

/// 报告目录中的文件（`{sgRNA}` 会被替换为实际的 guide 序列）
const REPORT_FILES: &[&str] = &[
    "CRISPResso_RUNNING_LOG.txt",
    "CRISPResso2_info.pickle",
    "Alleles_frequency_table.txt",
    "CRISPResso_mapping_statistics.txt",
    "CRISPResso_quantification_of_editing_frequency.txt",
    "Mapping_statistics.txt",
    "Quantification_of_editing_frequency.txt",
    "Reference.Alleles_frequency_table_around_cut_site_for_{sgRNA}.txt",
    "Reference.deletion_histogram.txt",
    "Reference.effect_vector_combined.txt",
    "Reference.effect_vector_deletion.txt",
    "Reference.effect_vector_insertion.txt",
    "Reference.effect_vector_substitution.txt",
    "Reference.indel_histogram.txt",
    "Reference.insertion_histogram.txt",
    "Reference.modification_count_vectors.txt",
    "Reference.nucleotide_frequency_table.txt",
    "Reference.nucleotide_percentage_table.txt",
    "Reference.quantification_window_modification_count_vectors.txt",
    "Reference.quantification_window_nucleotide_frequency_table.txt",
    "Reference.quantification_window_nucleotide_percentage_table.txt",
    "Reference.quantification_window_substitution_frequency_table.txt",
    "Reference.substitution_frequency_table.txt",
    "Reference.substitution_histogram.txt",
    "1a.Read_Barplot.pdf",
    "1a.Read_Barplot.png",
    "1b.Alignment_Pie_Chart.pdf",
    "1b.Alignment_Pie_Chart.png",
    "1c.Alignment_Barplot.pdf",
    "1c.Alignment_Barplot.png",
    "2a.Reference.Nucleotide_Percentage_Quilt.pdf",
    "2a.Reference.Nucleotide_Percentage_Quilt.png",
    "2b.Reference.Nucleotide_Percentage_Quilt_For_{sgRNA}.pdf",
    "2b.Reference.Nucleotide_Percentage_Quilt_For_{sgRNA}.png",
    "3a.Reference.Indel_Size_Distribution.pdf",
    "3a.Reference.Indel_Size_Distribution.png",
    "3b.Reference.Insertion_Deletion_Substitutions_Size_Hist.pdf",
    "3b.Reference.Insertion_Deletion_Substitutions_Size_Hist.png",
    "4a.Reference.Combined_Insertion_Deletion_Substitution_Locations.pdf",
    "4a.Reference.Combined_Insertion_Deletion_Substitution_Locations.png",
    "4b.Reference.Insertion_Deletion_Substitution_Locations.pdf",
    "4b.Reference.Insertion_Deletion_Substitution_Locations.png",
    "4c.Reference.Quantification_Window_Insertion_Deletion_Substitution_Locations.pdf",
    "4c.Reference.Quantification_Window_Insertion_Deletion_Substitution_Locations.png",
    "4d.Reference.Position_Dependent_Average_Indel_Size.pdf",
    "4d.Reference.Position_Dependent_Average_Indel_Size.png",
    "9.Reference.Alleles_Frequency_Table_Around_Cut_Site_For_{sgRNA}.pdf",
    "9.Reference.Alleles_Frequency_Table_Around_Cut_Site_For_{sgRNA}.png",
];

/// 状态接口返回的 JSON
#[derive(Debug, Deserialize)]
struct ReportStatus {
    state: String,
    #[serde(default)]
    message: String,
}

/// 待上传的测序文件，内容在真正提交时才读取
struct Fastq {
    field: &'static str,
    path: PathBuf,
    filename: String,
}

impl Fastq {
    fn new(field: &'static str, path: &Path) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| field.to_string());
        Self {
            field,
            path: path.to_path_buf(),
            filename,
        }
    }

    fn unreadable(&self, e: io::Error) -> ScrapeError {
        ScrapeError::invalid_input(format!(
            "Crispresso: cannot read {} '{}': {}",
            self.field,
            self.path.display(),
            e
        ))
    }

    async fn load(&self) -> ScrapeResult<FilePart> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| self.unreadable(e))?;
        Ok(FilePart {
            field: self.field.to_string(),
            filename: self.filename.clone(),
            bytes,
        })
    }
}

/// CRISPResso 分析请求
pub struct CrispressoRequest {
    ctx: Arc<ScrapeContext>,
    submit_url: String,
    fields: Vec<(String, String)>,
    fastqs: Vec<Fastq>,
    fingerprint: Fingerprint,
    sg_rna: String,
}

impl CrispressoRequest {
    pub const NAME: &'static str = "crispresso";

    /// 构建提交请求
    ///
    /// 测序文件在这里只按块读一遍用于计算指纹（阻塞 I/O），提交时再异步读入。
    pub fn new(
        ctx: Arc<ScrapeContext>,
        amplicon: &str,
        sg_rna: &str,
        fastq_r1: &Path,
        fastq_r2: &Path,
        hdr_seq: &str,
        optional_name: &str,
    ) -> ScrapeResult<Self> {
        // 表单字段全部必填，即使为空
        let fields: Vec<(String, String)> = [
            ("amplicon", amplicon),
            ("amplicon_names", ""),
            ("be_from", "C"),
            ("be_to", "T"),
            ("demo_used", ""),
            ("email", ctx.notify_email.as_str()),
            ("exons", ""),
            ("fastq_se", ""),
            ("hdr_seq", hdr_seq),
            ("optional_name", optional_name),
            ("optradio_exc_l", "15"),
            ("optradio_exc_r", "15"),
            ("optradio_hs", "60"),
            ("optradio_qc", "0"),
            ("optradio_qn", "0"),
            ("optradio_qs", "0"),
            ("optradio_trim", ""),
            ("optradio_wc", "-3"),
            ("optradio_ws", "1"),
            ("seq_design", "paired"),
            ("sgRNA", sg_rna),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let submit_url = format!("{}/submit", ctx.endpoints.crispresso);
        let fastqs = vec![Fastq::new("fastq_r1", fastq_r1), Fastq::new("fastq_r2", fastq_r2)];

        let mut hasher = MultipartHasher::new(&submit_url, &fields);
        for fastq in &fastqs {
            let file = File::open(&fastq.path).map_err(|e| fastq.unreadable(e))?;
            hasher
                .add_file(fastq.field, &fastq.filename, file)
                .map_err(|e| fastq.unreadable(e))?;
        }

        Ok(Self {
            ctx,
            submit_url,
            fields,
            fastqs,
            fingerprint: hasher.finish(),
            sg_rna: sg_rna.to_string(),
        })
    }

    /// 位置参数：`amplicon, sgRNA, fastq_r1, fastq_r2, [hdr_seq], [optional_name]`
    pub fn from_args(ctx: Arc<ScrapeContext>, args: &[String]) -> ScrapeResult<Self> {
        let amplicon = required_arg(args, 0, "amplicon", Self::NAME)?;
        let sg_rna = required_arg(args, 1, "sgRNA", Self::NAME)?;
        let fastq_r1 = required_arg(args, 2, "fastq_r1", Self::NAME)?;
        let fastq_r2 = required_arg(args, 3, "fastq_r2", Self::NAME)?;
        Self::new(
            ctx,
            &amplicon,
            &sg_rna,
            Path::new(&fastq_r1),
            Path::new(&fastq_r2),
            &arg_or(args, 4, ""),
            &arg_or(args, 5, ""),
        )
    }

    /// 读入测序文件，组装 multipart 提交请求
    async fn submit_request(&self) -> ScrapeResult<HttpRequest> {
        let mut files = Vec::with_capacity(self.fastqs.len());
        for fastq in &self.fastqs {
            files.push(fastq.load().await?);
        }
        Ok(HttpRequest::post_multipart(
            self.submit_url.clone(),
            self.fields.clone(),
            files,
        ))
    }

    fn base(&self) -> &str {
        self.ctx.endpoints.crispresso.trim_end_matches('/')
    }

    fn report_request(&self, report_id: &str) -> HttpRequest {
        HttpRequest::get(format!("{}/view_report/{}", self.base(), report_id))
    }

    /// 查询一次任务状态（不缓存），返回是否已完成
    async fn check_report_status(&self, report_id: &str) -> ScrapeResult<bool> {
        let status_url = format!("{}/status/{}", self.base(), report_id);
        let response = self.ctx.fetch(&HttpRequest::get(status_url)).await?;
        let status: ReportStatus = serde_json::from_str(&response.body).map_err(|e| {
            ScrapeError::protocol(format!("Crispresso on {}: bad status response: {}", report_id, e))
        })?;
        debug!("Crispresso on {}: {}", report_id, status.state);

        match status.state.as_str() {
            "FAILURE" => Err(ScrapeError::RemoteFailure(format!(
                "Crispresso on {}: {}",
                report_id, status.message
            ))),
            "SUCCESS" => Ok(true),
            _ => Ok(false),
        }
    }

    /// 轮询直到成功，最多检查 `max_retries` 次，两次检查之间等待固定间隔
    async fn wait_for_report(&self, report_id: &str) -> ScrapeResult<()> {
        let poll = self.ctx.poll;
        for attempt in 1..=poll.max_retries {
            if self.check_report_status(report_id).await? {
                return Ok(());
            }
            if attempt < poll.max_retries {
                info!(
                    "Crispresso on {} 仍在运行 (检查 {}/{}), {} 秒后重试",
                    report_id,
                    attempt,
                    poll.max_retries,
                    poll.interval.as_secs()
                );
                sleep(poll.interval).await;
            }
        }
        Err(ScrapeError::timeout(format!(
            "Crispresso on {}: Retries exhausted.",
            report_id
        )))
    }

    fn extract(&self, report_id: &str, report_url: &str, html: &str) -> ScrapeResult<ScrapeOutput> {
        let doc = Document::parse(html)?;
        let log_params = doc
            .by_id("log_params")
            .map(|e| doc.text(e))
            .ok_or_else(|| {
                ScrapeError::protocol(format!("Crispresso on {}: log_params not found", report_id))
            })?;

        let report_data_url = format!("{}/reports_data/CRISPRessoRun{}", self.base(), report_id);
        let report_files: Vec<String> = REPORT_FILES
            .iter()
            .map(|file| {
                format!(
                    "{}/CRISPResso_on_{}/{}",
                    report_data_url,
                    report_id,
                    file.replace("{sgRNA}", &self.sg_rna)
                )
            })
            .collect();

        let mut out = ScrapeOutput::new();
        out.insert("report_url".into(), json!(report_url));
        out.insert(
            "report_zip".into(),
            json!(format!("{}/CRISPResso_Report_{}.zip", report_data_url, report_id)),
        );
        out.insert("log_params".into(), json!(log_params));
        out.insert("report_files".into(), json!(report_files));
        Ok(out)
    }
}

#[async_trait]
impl ScrapeRequest for CrispressoRequest {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn fingerprint(&self) -> Fingerprint {
        self.fingerprint.clone()
    }

    fn cache(&self) -> &dyn ResponseCache {
        self.ctx.cache.as_ref()
    }

    /// 轮询超时时保留提交响应，重试会继续轮询同一个报告
    fn invalidate_on(&self, error: &ScrapeError) -> bool {
        matches!(error, ScrapeError::Protocol(_) | ScrapeError::RemoteFailure(_))
    }

    async fn run(&self) -> ScrapeResult<ScrapeOutput> {
        let submitted = match self.ctx.cached(&self.fingerprint) {
            Some(submitted) => submitted,
            None => {
                let request = self.submit_request().await?;
                self.ctx.fetch_cached_as(&self.fingerprint, &request).await?
            }
        };
        // 例如 http://crispresso.pinellolab.partners.org/check_progress/P2S84K
        let report_id = submitted
            .url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ScrapeError::protocol(format!("Crispresso: no report id in '{}'", submitted.url))
            })?
            .to_string();

        let report_request = self.report_request(&report_id);
        let report_key = report_request.fingerprint();
        let report = match self.ctx.cached(&report_key) {
            Some(report) => report,
            None => {
                self.wait_for_report(&report_id).await?;
                self.ctx.fetch_cached(&report_request).await?
            }
        };

        self.extract(&report_id, &report_request.url, &report.body)
            .inspect_err(|e| {
                warn!("{}", e);
                self.ctx.cache.invalidate(&report_key);
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cache::MemoryCache;
    use crate::infrastructure::http::{HttpMethod, HttpResponse, MockHttpClient};
    use crate::services::scrape_request::PollSettings;
    use std::time::Duration;

    const BASE: &str = "http://crispresso.test";

    fn setup() -> (MockHttpClient, Arc<ScrapeContext>, tempfile::TempDir) {
        let mock = MockHttpClient::new();
        let mut ctx = ScrapeContext::new(Arc::new(mock.clone()), Arc::new(MemoryCache::new()))
            .with_poll(PollSettings {
                interval: Duration::from_secs(30),
                max_retries: 3,
            });
        ctx.endpoints.crispresso = BASE.to_string();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("r1.fastq"), b"@r1\nACGT\n+\nIIII\n").unwrap();
        std::fs::write(dir.path().join("r2.fastq"), b"@r2\nTGCA\n+\nIIII\n").unwrap();
        (mock, Arc::new(ctx), dir)
    }

    fn request(ctx: Arc<ScrapeContext>, dir: &tempfile::TempDir) -> CrispressoRequest {
        CrispressoRequest::new(
            ctx,
            "ACGTACGTACGT",
            "AATCGGTACAAGATGGCGGA",
            &dir.path().join("r1.fastq"),
            &dir.path().join("r2.fastq"),
            "",
            "",
        )
        .unwrap()
    }

    fn register_submit(mock: &MockHttpClient) {
        mock.add_response(
            HttpMethod::Post,
            &format!("{}/submit", BASE),
            Ok(HttpResponse::ok(format!("{}/check_progress/P2S84K", BASE), "<html/>")),
        );
    }

    fn status(state: &str) -> HttpResponse {
        HttpResponse::ok(
            format!("{}/status/P2S84K", BASE),
            json!({"state": state, "message": "bad reads"}).to_string(),
        )
    }

    #[test]
    fn missing_fastq_is_invalid_input() {
        let (_, ctx, _dir) = setup();
        let args: Vec<String> = ["ACGT", "AATC", "/nonexistent/r1.fastq", "/nonexistent/r2.fastq"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let err = CrispressoRequest::from_args(ctx, &args).err().unwrap();
        assert!(matches!(err, ScrapeError::InvalidInput(_)));
    }

    #[test]
    fn same_files_give_same_fingerprint() {
        let (_, ctx, dir) = setup();
        assert_eq!(
            request(ctx.clone(), &dir).fingerprint(),
            request(ctx, &dir).fingerprint()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_success_then_reads_report() {
        let (mock, ctx, dir) = setup();
        register_submit(&mock);
        let status_url = format!("{}/status/P2S84K", BASE);
        mock.add_response(HttpMethod::Get, &status_url, Ok(status("STARTED")));
        mock.add_response(HttpMethod::Get, &status_url, Ok(status("SUCCESS")));
        let report_url = format!("{}/view_report/P2S84K", BASE);
        mock.add_response(
            HttpMethod::Get,
            &report_url,
            Ok(HttpResponse::ok(report_url.as_str(), "<div id=\"log_params\">-r1 r1.fastq</div>")),
        );

        let req = request(ctx, &dir);
        let out = req.run().await.unwrap();
        assert_eq!(out["log_params"], json!("-r1 r1.fastq"));
        assert_eq!(
            out["report_zip"],
            json!(format!("{}/reports_data/CRISPRessoRunP2S84K/CRISPResso_Report_P2S84K.zip", BASE))
        );
        assert_eq!(mock.calls_to(&status_url), 2);

        // 报告已缓存，重放不再访问网络
        let before = mock.call_count();
        assert!(req.in_cache());
        req.run().await.unwrap();
        assert_eq!(mock.call_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_polling_is_a_timeout() {
        let (mock, ctx, dir) = setup();
        register_submit(&mock);
        let status_url = format!("{}/status/P2S84K", BASE);
        mock.add_sticky_response(HttpMethod::Get, &status_url, Ok(status("STARTED")));

        let started = tokio::time::Instant::now();
        let err = request(ctx, &dir).run().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Crispresso on P2S84K: Retries exhausted.");
        assert_eq!(mock.calls_to(&status_url), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_is_reported() {
        let (mock, ctx, dir) = setup();
        register_submit(&mock);
        mock.add_response(
            HttpMethod::Get,
            &format!("{}/status/P2S84K", BASE),
            Ok(status("FAILURE")),
        );

        let err = request(ctx, &dir).run().await.unwrap_err();
        assert!(matches!(err, ScrapeError::RemoteFailure(_)));
        assert!(err.poisons_cache());
        assert_eq!(err.to_string(), "Crispresso on P2S84K: bad reads");
    }

    #[tokio::test(start_paused = true)]
    async fn polling_timeout_keeps_the_submission_for_the_next_run() {
        let (mock, ctx, dir) = setup();
        register_submit(&mock);
        let status_url = format!("{}/status/P2S84K", BASE);
        for state in ["STARTED", "STARTED", "STARTED", "SUCCESS"] {
            mock.add_response(HttpMethod::Get, &status_url, Ok(status(state)));
        }
        let report_url = format!("{}/view_report/P2S84K", BASE);
        mock.add_response(
            HttpMethod::Get,
            &report_url,
            Ok(HttpResponse::ok(report_url.as_str(), "<div id=\"log_params\">done</div>")),
        );

        let req = request(ctx, &dir);
        let err = req.run().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!req.invalidate_on(&err));
        assert!(req.in_cache());

        // 第二次运行继续轮询同一个报告，第 4 次检查时完成
        let out = req.run().await.unwrap();
        assert_eq!(out["log_params"], json!("done"));
        assert_eq!(mock.calls_to(&format!("{}/submit", BASE)), 1);
        assert_eq!(mock.calls_to(&status_url), 4);
    }

    #[tokio::test]
    async fn fastqs_are_read_when_submitting() {
        let (mock, ctx, dir) = setup();
        let req = request(ctx, &dir);
        std::fs::remove_file(dir.path().join("r1.fastq")).unwrap();

        let err = req.run().await.unwrap_err();
        assert!(matches!(err, ScrapeError::InvalidInput(_)));
        assert!(err.to_string().contains("fastq_r1"));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn cached_submission_needs_no_fastqs() {
        let (mock, ctx, dir) = setup();
        let req = request(ctx.clone(), &dir);
        ctx.store(
            &req.fingerprint(),
            &HttpResponse::ok(format!("{}/check_progress/P2S84K", BASE), "<html/>"),
        );
        std::fs::remove_file(dir.path().join("r1.fastq")).unwrap();
        std::fs::remove_file(dir.path().join("r2.fastq")).unwrap();

        mock.add_response(
            HttpMethod::Get,
            &format!("{}/status/P2S84K", BASE),
            Ok(status("SUCCESS")),
        );
        let report_url = format!("{}/view_report/P2S84K", BASE);
        mock.add_response(
            HttpMethod::Get,
            &report_url,
            Ok(HttpResponse::ok(report_url.as_str(), "<div id=\"log_params\">x</div>")),
        );

        req.run().await.unwrap();
        assert_eq!(mock.calls_to(&format!("{}/submit", BASE)), 0);
    }

    #[tokio::test]
    async fn report_files_cover_pdf_and_png() {
        let (mock, ctx, dir) = setup();
        let req = request(ctx.clone(), &dir);
        let report_url = format!("{}/view_report/P2S84K", BASE);
        let out = req
            .extract("P2S84K", &report_url, "<div id=\"log_params\">x</div>")
            .unwrap();
        let files: Vec<&str> = out["report_files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f.as_str().unwrap())
            .collect();
        assert_eq!(files.len(), REPORT_FILES.len());
        assert!(files.iter().any(|f| f.ends_with("/1a.Read_Barplot.pdf")));
        assert!(files
            .iter()
            .any(|f| f.ends_with("/9.Reference.Alleles_Frequency_Table_Around_Cut_Site_For_AATCGGTACAAGATGGCGGA.pdf")));
        assert!(files.iter().all(|f| !f.contains("{sgRNA}")));
        assert_eq!(mock.call_count(), 0);
    }
}
