use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::{absolute_url, element_text, parse_std_url, parse_title, selector};
use crate::error::{CrawlError, Result};

static ENTRY_OR_SEPARATOR: LazyLock<Selector> =
    LazyLock::new(|| selector("div.r-ent, div.r-list-sep"));
static TITLE: LazyLock<Selector> = LazyLock::new(|| selector("div.title"));
static TITLE_LINK: LazyLock<Selector> = LazyLock::new(|| selector("div.title a"));
static SCORE: LazyLock<Selector> = LazyLock::new(|| selector("div.nrec"));
static DATE: LazyLock<Selector> = LazyLock::new(|| selector("div.date"));
static AUTHOR: LazyLock<Selector> = LazyLock::new(|| selector("div.author"));
static MARK: LazyLock<Selector> = LazyLock::new(|| selector("div.mark"));
static DIR_LINKS: LazyLock<Selector> =
    LazyLock::new(|| selector("div.action-bar div.btn-group-dir a"));
static PAGING_LINKS: LazyLock<Selector> =
    LazyLock::new(|| selector("div.action-bar div.btn-group-paging a"));

const SEPARATOR_CLASS: &str = "r-list-sep";

#[derive(Debug, Clone)]
pub struct ArticleSummary {
    pub title: String,
    pub category: String,
    pub is_reply: bool,
    pub is_forward: bool,
    pub url: String,
    pub board: String,
    pub article_id: String,
    pub score: String,
    pub date: String,
    pub author: String,
    pub mark: String,
    pub is_removed: bool,
    pub removal_reason: Option<String>,
}

impl ArticleSummary {
    /// Numeric value of the recommendation cell: `爆` is 100+, `X1`..`XX` are negative tens.
    pub fn score_value(&self) -> i32 {
        match self.score.as_str() {
            "爆" => 100,
            "XX" => -100,
            s => match s.strip_prefix('X') {
                Some(n) => n.parse::<i32>().map(|n| -10 * n).unwrap_or(0),
                None => s.parse().unwrap_or(0),
            },
        }
    }
}

/// Navigation buttons of a list page. Disabled buttons carry no href.
#[derive(Debug, Clone, Default)]
pub struct Navigation {
    pub board: Option<String>,
    pub man: Option<String>,
    pub oldest: Option<String>,
    pub previous: Option<String>,
    pub next: Option<String>,
    pub newest: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListPage {
    pub board: String,
    pub index: u32,
    /// Reverse of the on-page order.
    pub summaries: Vec<ArticleSummary>,
    pub pinned_skipped: usize,
    pub navigation: Navigation,
}

pub fn parse_list_page(markup: &str, page_url: &str) -> Result<ListPage> {
    let document = Html::parse_document(markup);
    let (board, basename) = parse_std_url(page_url)
        .ok_or_else(|| CrawlError::malformed(page_url, "not a board list url"))?;

    let mut summaries = Vec::new();
    let mut pinned_skipped = 0;
    let mut below_separator = false;
    for node in document.select(&ENTRY_OR_SEPARATOR) {
        if node.value().classes().any(|c| c == SEPARATOR_CLASS) {
            below_separator = true;
            continue;
        }
        if below_separator {
            pinned_skipped += 1;
            continue;
        }
        summaries.push(parse_entry(node, &board));
    }
    summaries.reverse();

    let navigation = parse_navigation(&document);
    let index = page_index(&basename, &navigation)
        .ok_or_else(|| CrawlError::malformed(page_url, "cannot determine page index"))?;

    debug!(
        board = %board,
        index,
        entries = summaries.len(),
        pinned_skipped,
        "Parsed list page"
    );

    Ok(ListPage {
        board,
        index,
        summaries,
        pinned_skipped,
        navigation,
    })
}

fn parse_entry(entry: ElementRef<'_>, board: &str) -> ArticleSummary {
    let text_of = |sel: &Selector| entry.select(sel).next().map(element_text).unwrap_or_default();
    let date = text_of(&*DATE);
    let author = text_of(&*AUTHOR);
    let mark = text_of(&*MARK);

    let Some(link) = entry.select(&TITLE_LINK).next() else {
        let stub = text_of(&*TITLE);
        return ArticleSummary {
            title: stub.clone(),
            category: String::new(),
            is_reply: false,
            is_forward: false,
            url: String::new(),
            board: board.to_string(),
            article_id: String::new(),
            score: String::new(),
            date,
            author,
            mark,
            is_removed: true,
            removal_reason: Some(stub),
        };
    };

    let title = element_text(link);
    let url = link.value().attr("href").map(absolute_url).unwrap_or_default();
    let (article_board, article_id) = parse_std_url(&url).unwrap_or_else(|| (board.to_string(), String::new()));
    let info = parse_title(&title);

    ArticleSummary {
        title,
        category: info.category,
        is_reply: info.is_reply,
        is_forward: info.is_forward,
        url,
        board: article_board,
        article_id,
        score: text_of(&*SCORE),
        date,
        author,
        mark,
        is_removed: false,
        removal_reason: None,
    }
}

fn parse_navigation(document: &Html) -> Navigation {
    let hrefs = |sel: &Selector| -> Vec<Option<String>> {
        document
            .select(sel)
            .map(|a| a.value().attr("href").map(absolute_url))
            .collect()
    };
    let mut dir = hrefs(&*DIR_LINKS).into_iter();
    let mut paging = hrefs(&*PAGING_LINKS).into_iter();

    Navigation {
        board: dir.next().flatten(),
        man: dir.next().flatten(),
        oldest: paging.next().flatten(),
        previous: paging.next().flatten(),
        next: paging.next().flatten(),
        newest: paging.next().flatten(),
    }
}

/// `indexN` carries its own number; the bare `index` alias is one past `previous`.
fn page_index(basename: &str, navigation: &Navigation) -> Option<u32> {
    let digits = basename.strip_prefix("index")?;
    if !digits.is_empty() {
        return digits.parse().ok();
    }
    let (_, previous) = parse_std_url(navigation.previous.as_deref()?)?;
    let previous: u32 = previous.strip_prefix("index")?.parse().ok()?;
    Some(previous + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    #[test]
    fn newest_page_excludes_pinned() {
        let page = parse_list_page(&fixture("list_newest"), "https://www.ptt.cc/bbs/Drink/index.html").unwrap();
        assert_eq!(page.board, "Drink");
        assert_eq!(page.index, 5000);
        assert_eq!(page.pinned_skipped, 2);
        assert_eq!(page.summaries.len(), 4);
        assert!(page.summaries.iter().all(|s| !s.title.contains("板規")));
        // reverse of page order
        assert_eq!(page.summaries[0].title, "[心得] 五十嵐 四季春");
        assert_eq!(page.summaries[3].title, "Re: [問題] 哪家珍奶好喝");
    }

    #[test]
    fn summary_fields() {
        let page = parse_list_page(&fixture("list_newest"), "https://www.ptt.cc/bbs/Drink/index.html").unwrap();
        let s = &page.summaries[0];
        assert_eq!(s.url, "https://www.ptt.cc/bbs/Drink/M.1760500000.A.001.html");
        assert_eq!(s.article_id, "M.1760500000.A.001");
        assert_eq!(s.board, "Drink");
        assert_eq!(s.category, "心得");
        assert_eq!(s.author, "teafan");
        assert_eq!(s.date, "10/15");
        assert_eq!(s.score, "5");
        assert!(!s.is_removed);
        assert!(page.summaries[3].is_reply);
    }

    #[test]
    fn removed_entry_is_tagged() {
        let page = parse_list_page(&fixture("list_newest"), "https://www.ptt.cc/bbs/Drink/index.html").unwrap();
        let removed: Vec<_> = page.summaries.iter().filter(|s| s.is_removed).collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].removal_reason.as_deref(), Some("(本文已被刪除) [someone]"));
        assert!(removed[0].url.is_empty());
        assert!(removed[0].score.is_empty());
    }

    #[test]
    fn navigation_links() {
        let page = parse_list_page(&fixture("list_newest"), "https://www.ptt.cc/bbs/Drink/index.html").unwrap();
        let nav = &page.navigation;
        assert_eq!(nav.previous.as_deref(), Some("https://www.ptt.cc/bbs/Drink/index4999.html"));
        assert_eq!(nav.oldest.as_deref(), Some("https://www.ptt.cc/bbs/Drink/index1.html"));
        assert_eq!(nav.man.as_deref(), Some("https://www.ptt.cc/man/Drink/index.html"));
        assert_eq!(nav.next.as_deref(), None);
        assert_eq!(nav.newest.as_deref(), Some("https://www.ptt.cc/bbs/Drink/index.html"));
    }

    #[test]
    fn explicit_index_without_separator() {
        let markup = r#"<html><body>
            <div class="r-list-container action-bar-margin bbs-screen">
              <div class="r-ent"><div class="nrec"></div><div class="title"><a href="/bbs/Drink/M.1.A.AAA.html">[閒聊] a</a></div>
                <div class="meta"><div class="author">x</div><div class="mark"></div><div class="date"> 9/01</div></div></div>
              <div class="r-ent"><div class="nrec"></div><div class="title"><a href="/bbs/Drink/M.2.A.BBB.html">[閒聊] b</a></div>
                <div class="meta"><div class="author">y</div><div class="mark"></div><div class="date"> 9/02</div></div></div>
            </div></body></html>"#;
        let page = parse_list_page(markup, "https://www.ptt.cc/bbs/Drink/index42.html").unwrap();
        assert_eq!(page.index, 42);
        assert_eq!(page.pinned_skipped, 0);
        assert_eq!(page.summaries.len(), 2);
        assert_eq!(page.summaries[0].date, "9/02");
    }

    #[test]
    fn bare_index_without_previous_is_malformed() {
        let err = parse_list_page("<html></html>", "https://www.ptt.cc/bbs/Drink/index.html").unwrap_err();
        assert!(matches!(err, CrawlError::MalformedMarkup { .. }));
    }

    #[test]
    fn score_values() {
        let page = parse_list_page(&fixture("list_newest"), "https://www.ptt.cc/bbs/Drink/index.html").unwrap();
        let mut s = page.summaries[0].clone();
        assert_eq!(s.score_value(), 5);
        for (raw, expected) in [("爆", 100), ("XX", -100), ("X3", -30), ("", 0)] {
            s.score = raw.to_string();
            assert_eq!(s.score_value(), expected);
        }
    }
}
