//! HTML 提取工具 - 业务能力层
//!
//! 外部服务只返回 HTML 页面。这里用正则把页面切成元素列表，
//! 再按 id / class / 属性查找元素、读取属性和文本。不是通用解析器，
//! 只覆盖各服务页面实际用到的结构。

use regex::Regex;

use crate::error::{ScrapeError, ScrapeResult};

/// 没有结束标签的元素
const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// 页面中的一个元素
#[derive(Debug, Clone)]
pub struct Element {
    /// 小写标签名
    pub name: String,
    attrs: Vec<(String, String)>,
    /// 开始标签起点
    pub start: usize,
    content_start: usize,
    content_end: usize,
    /// 结束标签之后的位置
    pub end: usize,
}

impl Element {
    /// 读取属性值（已反转义）
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .map(|v| v.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }

    pub fn is(&self, tag: &str) -> bool {
        self.name.eq_ignore_ascii_case(tag)
    }

    /// `other` 是否位于本元素内部
    pub fn contains(&self, other: &Element) -> bool {
        other.start >= self.content_start && other.end <= self.content_end
    }
}

/// 切分好的页面
pub struct Document<'a> {
    html: &'a str,
    elements: Vec<Element>,
    tag_re: Regex,
}

impl<'a> Document<'a> {
    pub fn parse(html: &'a str) -> ScrapeResult<Self> {
        let tag_re = Regex::new(
            r#"<(/?)([a-zA-Z][a-zA-Z0-9]*)((?:[^>"']|"[^"]*"|'[^']*')*)>"#,
        )
        .map_err(|e| ScrapeError::protocol(format!("HTML 正则编译失败: {}", e)))?;
        let attr_re = Regex::new(
            r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#,
        )
        .map_err(|e| ScrapeError::protocol(format!("HTML 正则编译失败: {}", e)))?;

        let mut elements: Vec<Element> = Vec::new();
        let mut open: Vec<usize> = Vec::new();

        for caps in tag_re.captures_iter(html) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(2)) else {
                continue;
            };
            let name = name.as_str().to_ascii_lowercase();
            let closing = caps.get(1).map(|m| !m.as_str().is_empty()).unwrap_or(false);

            if closing {
                // 找到最近的同名开始标签，中间未闭合的元素一起结束
                if let Some(pos) = open.iter().rposition(|&i| elements[i].name == name) {
                    for &i in &open[pos + 1..] {
                        elements[i].content_end = whole.start();
                        elements[i].end = whole.start();
                    }
                    let i = open[pos];
                    elements[i].content_end = whole.start();
                    elements[i].end = whole.end();
                    open.truncate(pos);
                }
                continue;
            }

            let raw_attrs = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            let attrs = attr_re
                .captures_iter(raw_attrs)
                .filter_map(|a| {
                    let key = a.get(1)?.as_str().to_ascii_lowercase();
                    let value = a
                        .get(2)
                        .or_else(|| a.get(3))
                        .or_else(|| a.get(4))
                        .map(|m| unescape(m.as_str()))
                        .unwrap_or_default();
                    Some((key, value))
                })
                .collect();

            let self_closing = raw_attrs.trim_end().ends_with('/') || VOID_TAGS.contains(&name.as_str());
            let index = elements.len();
            elements.push(Element {
                name,
                attrs,
                start: whole.start(),
                content_start: whole.end(),
                content_end: whole.end(),
                end: whole.end(),
            });
            if !self_closing {
                open.push(index);
            }
        }

        for i in open {
            elements[i].content_end = html.len();
            elements[i].end = html.len();
        }

        Ok(Self {
            html,
            elements,
            tag_re,
        })
    }

    /// 所有元素（文档顺序）
    pub fn find(&self, pred: impl Fn(&Element) -> bool) -> Option<&Element> {
        self.elements.iter().find(|e| pred(e))
    }

    pub fn find_all(&self, pred: impl Fn(&Element) -> bool) -> Vec<&Element> {
        self.elements.iter().filter(|e| pred(e)).collect()
    }

    /// 位于 `pos` 之后的第一个匹配元素
    pub fn find_after(&self, pos: usize, pred: impl Fn(&Element) -> bool) -> Option<&Element> {
        self.elements.iter().find(|e| e.start > pos && pred(e))
    }

    /// `parent` 内部的所有匹配元素
    pub fn find_within(&self, parent: &Element, pred: impl Fn(&Element) -> bool) -> Vec<&Element> {
        self.elements
            .iter()
            .filter(|e| parent.contains(e) && pred(e))
            .collect()
    }

    pub fn by_id(&self, id: &str) -> Option<&Element> {
        self.find(|e| e.attr("id") == Some(id))
    }

    pub fn by_class(&self, class: &str) -> Option<&Element> {
        self.find(|e| e.has_class(class))
    }

    /// 元素内部的原始 HTML
    pub fn inner_html(&self, element: &Element) -> &'a str {
        self.html
            .get(element.content_start..element.content_end)
            .unwrap_or("")
    }

    /// 元素的纯文本（去标签、反转义）
    pub fn text(&self, element: &Element) -> String {
        self.strip(self.inner_html(element))
    }

    /// 整个页面的纯文本
    pub fn full_text(&self) -> String {
        self.strip(self.html)
    }

    fn strip(&self, fragment: &str) -> String {
        unescape(&self.tag_re.replace_all(fragment, ""))
    }
}

/// 反转义常见 HTML 实体
pub fn unescape(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail
            .find(';')
            .filter(|&semi| semi <= 10)
            .and_then(|semi| decode_entity(&tail[1..semi]).map(|c| (c, semi)));
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let code = if let Some(hex) = entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                entity.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<html><body>
<div class="title">Query sequence, <a href="x">chr1</a></div>
<table id="otTable">
  <tr class="guideRow" id="s20+"><td><tt>ACGTACGT</tt></td></tr>
  <tr class="guideRow odd" id="s7-"><td><tt>TTTTGGGG</tt></td></tr>
</table>
<input type="hidden" name="batchId" value="9cJN">
<div data-user='[{"a": "&quot;b&quot;"}]'>x</div>
<p>unclosed <b>bold</b>
</body></html>"#;

    #[test]
    fn finds_elements_by_id_and_class() {
        let doc = Document::parse(PAGE).unwrap();
        let table = doc.by_id("otTable").unwrap();
        let rows = doc.find_within(table, |e| e.has_class("guideRow"));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].attr("id"), Some("s7-"));

        let tt = doc.find_after(rows[0].start, |e| e.is("tt")).unwrap();
        assert_eq!(doc.text(tt), "ACGTACGT");
    }

    #[test]
    fn void_elements_have_no_content() {
        let doc = Document::parse(PAGE).unwrap();
        let input = doc
            .find(|e| e.is("input") && e.attr("name") == Some("batchId"))
            .unwrap();
        assert_eq!(input.attr("value"), Some("9cJN"));
        assert_eq!(doc.inner_html(input), "");
    }

    #[test]
    fn text_strips_nested_tags() {
        let doc = Document::parse(PAGE).unwrap();
        let title = doc.by_class("title").unwrap();
        assert_eq!(doc.text(title), "Query sequence, chr1");
        assert!(doc.full_text().contains("unclosed bold"));
    }

    #[test]
    fn attributes_are_unescaped() {
        let doc = Document::parse(PAGE).unwrap();
        let div = doc.find(|e| e.has_attr("data-user")).unwrap();
        assert_eq!(div.attr("data-user"), Some(r#"[{"a": ""b""}]"#));
    }

    #[test]
    fn unescape_handles_numeric_and_unknown_entities() {
        assert_eq!(unescape("a &amp; b &#39;c&#x27; &bogus; &"), "a & b 'c' &bogus; &");
    }
}
