use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use tracing::debug;

use super::pushes::PushStats;
use super::{element_text, parse_std_url, parse_title, parse_username, selector};
use crate::error::{CrawlError, Result};

static MAIN_CONTENT: LazyLock<Selector> = LazyLock::new(|| selector("div#main-content"));
static METALINE: LazyLock<Selector> = LazyLock::new(|| selector("div.article-metaline"));
static META_VALUE: LazyLock<Selector> = LazyLock::new(|| selector("span.article-meta-value"));
static STRIPPED: LazyLock<Selector> = LazyLock::new(|| {
    selector("#main-content div.article-metaline, #main-content div.article-metaline-right, #main-content div.push")
});
static FOOTER_SPAN: LazyLock<Selector> = LazyLock::new(|| selector("#main-content span.f2"));
static IP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").unwrap());

const TIMESTAMP_FORMAT: &str = "%a %b %d %H:%M:%S %Y";
const ORIGIN_MARKER: &str = "發信站";

#[derive(Debug, Clone, Serialize)]
pub struct ArticlePage {
    pub board: String,
    pub article_id: String,
    pub url: String,
    /// Full metaline value, `account (nickname)`.
    pub author: String,
    pub author_account: String,
    pub author_nickname: String,
    pub title: String,
    pub timestamp_raw: String,
    pub timestamp: Option<NaiveDateTime>,
    pub category: String,
    pub is_reply: bool,
    pub is_forward: bool,
    pub content: String,
    pub ip: String,
    pub push_stats: PushStats,
}

pub fn parse_article_page(markup: &str, url: &str) -> Result<ArticlePage> {
    let (board, article_id) =
        parse_std_url(url).ok_or_else(|| CrawlError::malformed(url, "not an article url"))?;
    let mut document = Html::parse_document(markup);

    let main = document
        .select(&MAIN_CONTENT)
        .next()
        .ok_or_else(|| CrawlError::malformed(url, "missing div#main-content"))?;

    // Slots 1/2/3 are author/title/date; any of them may be missing.
    let metas: Vec<String> = main
        .select(&METALINE)
        .map(|line| line.select(&META_VALUE).next().map(element_text).unwrap_or_default())
        .collect();
    let slot = |i: usize| metas.get(i).cloned().unwrap_or_default();
    let author = slot(0);
    let title = slot(1);
    let timestamp_raw = slot(2);

    let info = parse_title(&title);
    let (author_account, author_nickname) = parse_username(&author);
    let timestamp = parse_timestamp(&timestamp_raw);
    let ip = extract_ip(&document);

    // Must run before the push nodes are detached below.
    let push_stats = PushStats::from_document(&document);

    let stripped: Vec<_> = document.select(&STRIPPED).map(|el| el.id()).collect();
    for id in stripped {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }
    let content = document
        .select(&MAIN_CONTENT)
        .next()
        .map(|main| main.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    debug!(
        board = %board,
        article_id = %article_id,
        pushes = push_stats.total,
        has_timestamp = timestamp.is_some(),
        "Parsed article"
    );

    Ok(ArticlePage {
        board,
        article_id,
        url: url.to_string(),
        author,
        author_account,
        author_nickname,
        title,
        timestamp_raw,
        timestamp,
        category: info.category,
        is_reply: info.is_reply,
        is_forward: info.is_forward,
        content,
        ip,
        push_stats,
    })
}

/// `Sat Oct 18 10:21:07 2025`; PTT pads single-digit days with a space.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(&normalized, TIMESTAMP_FORMAT).ok()
}

/// Author IP from the `※ 發信站` footer line, falling back to any footer span.
fn extract_ip(document: &Html) -> String {
    let spans: Vec<String> = document
        .select(&FOOTER_SPAN)
        .map(|s| s.text().collect::<String>())
        .collect();
    let find = |text: &String| IP_RE.captures(text).map(|c| c[1].to_string());

    spans
        .iter()
        .filter(|t| t.contains(ORIGIN_MARKER))
        .find_map(find)
        .or_else(|| spans.iter().find_map(find))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const URL: &str = "https://www.ptt.cc/bbs/Drink/M.1760500000.A.001.html";

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    #[test]
    fn full_article() {
        let a = parse_article_page(&fixture("article"), URL).unwrap();
        assert_eq!(a.board, "Drink");
        assert_eq!(a.article_id, "M.1760500000.A.001");
        assert_eq!(a.author, "teafan (愛喝茶)");
        assert_eq!(a.author_account, "teafan");
        assert_eq!(a.author_nickname, "愛喝茶");
        assert_eq!(a.title, "[心得] 五十嵐 四季春");
        assert_eq!(a.category, "心得");
        assert!(!a.is_reply);
        assert_eq!(a.ip, "114.32.10.5");
        let ts = a.timestamp.unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day()), (2025, 10, 5));
        assert_eq!(ts.hour(), 9);
    }

    #[test]
    fn pushes_counted_then_stripped() {
        let a = parse_article_page(&fixture("article"), URL).unwrap();
        assert_eq!(a.push_stats.total, 4);
        assert_eq!(a.push_stats.approve, 2);
        assert_eq!(a.push_stats.disapprove, 1);
        assert_eq!(a.push_stats.neutral, 1);
        assert_eq!(a.push_stats.score, 1);
        assert!(a.content.contains("四季春加珍珠"));
        assert!(!a.content.contains("推薦推薦"));
        assert!(!a.content.contains("Sat Oct"));
        assert!(!a.content.starts_with("作者"));
    }

    #[test]
    fn missing_ip_footer() {
        let a = parse_article_page(&fixture("article_no_ip"), URL).unwrap();
        assert_eq!(a.ip, "");
        assert_eq!(a.title, "[閒聊] 沒有簽名檔");
        assert!(!a.content.is_empty());
    }

    #[test]
    fn malformed_meta_degrades() {
        let markup = r#"<div id="main-content"><div class="article-metaline"><span class="article-meta-tag">作者</span><span class="article-meta-value">solo</span></div>只有作者</div>"#;
        let a = parse_article_page(markup, URL).unwrap();
        assert_eq!(a.author, "solo");
        assert_eq!(a.author_nickname, "");
        assert_eq!(a.title, "");
        assert_eq!(a.timestamp_raw, "");
        assert!(a.timestamp.is_none());
        assert_eq!(a.content, "只有作者");
    }

    #[test]
    fn missing_main_content_is_malformed() {
        let err = parse_article_page("<html><body>404</body></html>", URL).unwrap_err();
        assert!(matches!(err, CrawlError::MalformedMarkup { .. }));
    }

    #[test]
    fn timestamp_formats() {
        assert!(parse_timestamp("Sat Oct 18 10:21:07 2025").is_some());
        assert!(parse_timestamp("Sun Oct  5 09:00:00 2025").is_some());
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("").is_none());
    }
}
