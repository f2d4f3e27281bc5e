//! 请求变体选择
//!
//! 编排器只认识 [`RequestFactory`]：给一组位置参数，造出一个 [`ScrapeRequest`]。
//! [`Variant`] 列出内置的外部服务，[`VariantFactory`] 把变体和共享能力绑在一起。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ConfigError, ScrapeResult};
use crate::services::crispor_guide::CrisporGuideRequest;
use crate::services::crispor_primer::CrisporPrimerRequest;
use crate::services::crispresso::CrispressoRequest;
use crate::services::scrape_request::{ScrapeContext, ScrapeRequest};
use crate::services::tagin::TagInRequest;

/// 按位置参数构造请求
pub trait RequestFactory: Send + Sync + 'static {
    /// 变体名称（日志与并发配置使用）
    fn variant(&self) -> &str;

    /// 构造请求；参数不可用时返回 invalid-input 错误
    fn build(&self, args: &[String]) -> ScrapeResult<Box<dyn ScrapeRequest>>;
}

/// 内置的外部服务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    CrisporGuide,
    CrisporGuideById,
    CrisporPrimer,
    Crispresso,
    TagIn,
}

impl Variant {
    pub const ALL: [Variant; 5] = [
        Variant::CrisporGuide,
        Variant::CrisporGuideById,
        Variant::CrisporPrimer,
        Variant::Crispresso,
        Variant::TagIn,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Variant::CrisporGuide => CrisporGuideRequest::NAME,
            Variant::CrisporGuideById => CrisporGuideRequest::BY_ID_NAME,
            Variant::CrisporPrimer => CrisporPrimerRequest::NAME,
            Variant::Crispresso => CrispressoRequest::NAME,
            Variant::TagIn => TagInRequest::NAME,
        }
    }

    /// 结果默认写入的字段
    pub fn field_name(&self) -> &'static str {
        match self {
            Variant::CrisporGuide | Variant::CrisporGuideById => "guide_data",
            Variant::CrisporPrimer => "primer_data",
            Variant::Crispresso => "results_data",
            Variant::TagIn => "tagin_data",
        }
    }

    pub fn build(
        &self,
        ctx: Arc<ScrapeContext>,
        args: &[String],
    ) -> ScrapeResult<Box<dyn ScrapeRequest>> {
        Ok(match self {
            Variant::CrisporGuide => Box::new(CrisporGuideRequest::from_args(ctx, args)?),
            Variant::CrisporGuideById => {
                Box::new(CrisporGuideRequest::by_batch_id_from_args(ctx, args)?)
            }
            Variant::CrisporPrimer => Box::new(CrisporPrimerRequest::from_args(ctx, args)?),
            Variant::Crispresso => Box::new(CrispressoRequest::from_args(ctx, args)?),
            Variant::TagIn => Box::new(TagInRequest::from_args(ctx, args)?),
        })
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Variant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Variant::ALL
            .into_iter()
            .find(|v| v.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownVariant(s.to_string()))
    }
}

/// 绑定了共享能力的内置变体
pub struct VariantFactory {
    variant: Variant,
    ctx: Arc<ScrapeContext>,
}

impl VariantFactory {
    pub fn new(variant: Variant, ctx: Arc<ScrapeContext>) -> Self {
        Self { variant, ctx }
    }

    pub fn kind(&self) -> Variant {
        self.variant
    }
}

impl RequestFactory for VariantFactory {
    fn variant(&self) -> &str {
        self.variant.name()
    }

    fn build(&self, args: &[String]) -> ScrapeResult<Box<dyn ScrapeRequest>> {
        self.variant.build(self.ctx.clone(), args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cache::MemoryCache;
    use crate::infrastructure::http::MockHttpClient;

    #[test]
    fn parses_variant_names() {
        assert_eq!("crispor_guide".parse::<Variant>().unwrap(), Variant::CrisporGuide);
        assert_eq!(" TagIn ".parse::<Variant>().unwrap(), Variant::TagIn);
        assert!(matches!(
            "blast".parse::<Variant>(),
            Err(ConfigError::UnknownVariant(_))
        ));
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<&str> = Variant::ALL.iter().map(|v| v.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Variant::ALL.len());
    }

    #[test]
    fn factory_builds_requests_with_fingerprints() {
        let ctx = Arc::new(ScrapeContext::new(
            Arc::new(MockHttpClient::new()),
            Arc::new(MemoryCache::new()),
        ));
        let factory = VariantFactory::new(Variant::CrisporPrimer, ctx);
        let a = factory.build(&["9cJN".into(), "s185+".into()]).unwrap();
        let b = factory.build(&["9cJN".into(), "s7-".into()]).unwrap();
        assert_eq!(a.name(), "crispor_primer");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert!(!a.in_cache());

        let missing = factory.build(&[]);
        assert!(missing.is_err());
    }
}
