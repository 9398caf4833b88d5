pub mod article;
pub mod list_page;
pub mod pushes;

use scraper::Selector;
use url::Url;

use crate::fetcher::PTT_DOMAIN;

/// Category used when a title carries no `[...]` tag.
pub const UNCATEGORIZED: &str = "無分類";

const REPLY_MARKER: &str = "Re:";
const FORWARD_MARKER: &str = "Fw:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleInfo {
    pub category: String,
    pub is_reply: bool,
    pub is_forward: bool,
}

/// Split a post title into its bracketed category and reply/forward flags.
pub fn parse_title(title: &str) -> TitleInfo {
    let category = title
        .find('[')
        .and_then(|start| {
            let rest = &title[start + 1..];
            rest.find(']').map(|end| rest[..end].trim())
        })
        .filter(|c| !c.is_empty())
        .unwrap_or(UNCATEGORIZED)
        .to_string();

    TitleInfo {
        category,
        is_reply: title.contains(REPLY_MARKER),
        is_forward: title.contains(FORWARD_MARKER),
    }
}

/// Split `/bbs/<board>/<basename>.html` (absolute or relative) into board and basename.
pub fn parse_std_url(url: &str) -> Option<(String, String)> {
    let (_, path) = url.split_once("/bbs/")?;
    let (board, file) = path.split_once('/')?;
    let basename = file.strip_suffix(".html")?;
    if board.is_empty() || basename.is_empty() || basename.contains('/') {
        return None;
    }
    Some((board.to_string(), basename.to_string()))
}

/// Split `account (nickname)` into its parts. Without a nickname the second part is empty.
pub fn parse_username(full_name: &str) -> (String, String) {
    match full_name.split_once(" (") {
        Some((account, nickname)) => (
            account.to_string(),
            nickname.trim_end_matches(')').to_string(),
        ),
        None => (full_name.to_string(), String::new()),
    }
}

/// Resolve an href from the site against its root.
pub fn absolute_url(href: &str) -> String {
    Url::parse(PTT_DOMAIN)
        .and_then(|base| base.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

pub fn list_page_url(board: &str, index: Option<u32>) -> String {
    match index {
        Some(i) => format!("{PTT_DOMAIN}/bbs/{board}/index{i}.html"),
        None => format!("{PTT_DOMAIN}/bbs/{board}/index.html"),
    }
}

/// Selectors here are literals; a parse failure is a programming error caught by tests.
pub(crate) fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|_| panic!("invalid selector: {css}"))
}

/// Collapse the text of an element to a single trimmed string.
pub(crate) fn element_text(el: scraper::ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}
