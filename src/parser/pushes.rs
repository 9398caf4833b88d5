use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

use super::{element_text, selector};

static PUSH: LazyLock<Selector> = LazyLock::new(|| selector("#main-content div.push"));
static PUSH_TAG: LazyLock<Selector> = LazyLock::new(|| selector("span.push-tag"));
static PUSH_USER: LazyLock<Selector> = LazyLock::new(|| selector("span.push-userid"));
static PUSH_CONTENT: LazyLock<Selector> = LazyLock::new(|| selector("span.push-content"));
static PUSH_IP_DATETIME: LazyLock<Selector> = LazyLock::new(|| selector("span.push-ipdatetime"));

const APPROVE_MARKER: &str = "推";
const DISAPPROVE_MARKER: &str = "噓";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReactionKind {
    Approve,
    Disapprove,
    Neutral,
}

impl ReactionKind {
    pub fn from_tag(tag: &str) -> Self {
        if tag.contains(APPROVE_MARKER) {
            ReactionKind::Approve
        } else if tag.contains(DISAPPROVE_MARKER) {
            ReactionKind::Disapprove
        } else {
            ReactionKind::Neutral
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            ReactionKind::Approve => "推",
            ReactionKind::Disapprove => "噓",
            ReactionKind::Neutral => "→",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionEntry {
    pub kind: ReactionKind,
    pub user: String,
    pub content: String,
    pub ip_datetime: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushStats {
    pub total: u32,
    pub approve: u32,
    pub disapprove: u32,
    pub neutral: u32,
    pub score: i32,
    pub entries: Vec<ReactionEntry>,
}

impl PushStats {
    pub fn from_entries(entries: Vec<ReactionEntry>) -> Self {
        let mut stats = PushStats::default();
        for entry in &entries {
            match entry.kind {
                ReactionKind::Approve => stats.approve += 1,
                ReactionKind::Disapprove => stats.disapprove += 1,
                ReactionKind::Neutral => stats.neutral += 1,
            }
        }
        stats.total = entries.len() as u32;
        stats.score = stats.approve as i32 - stats.disapprove as i32;
        stats.entries = entries;
        stats
    }

    /// Reads every reaction line still present in the document.
    pub fn from_document(document: &Html) -> Self {
        let entries = document.select(&PUSH).filter_map(parse_entry).collect();
        Self::from_entries(entries)
    }

    pub fn summary_lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| format!("{} {}: {}", e.kind.symbol(), e.user, e.content))
            .collect()
    }
}

/// Lines without a reaction tag (e.g. system notices styled as pushes) are skipped.
fn parse_entry(push: ElementRef<'_>) -> Option<ReactionEntry> {
    let tag = push.select(&PUSH_TAG).next().map(element_text)?;
    let field = |sel: &Selector| push.select(sel).next().map(element_text).unwrap_or_default();

    let content = field(&*PUSH_CONTENT);
    let content = content.strip_prefix(':').unwrap_or(&content).trim().to_string();

    Some(ReactionEntry {
        kind: ReactionKind::from_tag(&tag),
        user: field(&*PUSH_USER),
        content,
        ip_datetime: field(&*PUSH_IP_DATETIME),
    })
}
