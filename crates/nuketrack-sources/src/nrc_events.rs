use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use nuketrack_core::{Record, REGULATORY_EVENTS};
use scraper::Html;
use tracing::{info, warn};

use crate::html::{absolute_url, element_text, selector};
use crate::text::{find_long_date, truncate_chars};
use crate::{IngestContext, IngestionSource, SourceError};

pub const NRC_NEWS_BASE_URL: &str = "https://www.nrc.gov/reading-rm/doc-collections/news/";

const MIN_LINK_TEXT_CHARS: usize = 20;
const MAX_TITLE_CHARS: usize = 500;

// Checked in order; the first category with a matching keyword wins.
const EVENT_KEYWORDS: [(&str, &[&str]); 7] = [
    (
        "license-renewal",
        &["license renewal", "renewed", "slr", "subsequent license"],
    ),
    ("license-amendment", &["license amendment", "amendment"]),
    ("inspection", &["inspection", "inspector", "inspected"]),
    (
        "enforcement",
        &["enforcement", "violation", "penalty", "fine", "civil penalty"],
    ),
    ("exemption", &["exemption", "exempt"]),
    (
        "rulemaking",
        &["rulemaking", "rule", "proposed rule", "final rule"],
    ),
    ("hearing", &["hearing", "adjudicatory"]),
];

/// A press release link from the NRC news index.
#[derive(Debug, Clone, PartialEq)]
pub struct NewsItem {
    pub title: String,
    pub source_url: String,
    pub event_date: Option<NaiveDate>,
    pub event_type: &'static str,
    pub docket: Option<String>,
    pub nrc_document_id: Option<String>,
}

pub fn classify_event(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    EVENT_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| lower.contains(kw)))
        .map(|(event_type, _)| *event_type)
        .unwrap_or("other")
}

/// Docket mentioned in a headline: `Docket No. 313` or a full `05000313`.
/// Short numbers are expanded to the `0500xxxx` power-reactor form.
pub fn extract_event_docket(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let anchors = lower
        .match_indices("docket")
        .chain(lower.match_indices("0500"))
        .map(|(at, anchor)| at + anchor.len());
    let mut candidates = anchors
        .filter_map(|after| docket_digits(&lower[after..]).map(|digits| (after, digits)))
        .collect::<Vec<_>>();
    candidates.sort_by_key(|(after, _)| *after);

    let (_, digits) = candidates.into_iter().next()?;
    if digits.len() <= 4 {
        Some(format!("0500{digits:0>4}"))
    } else {
        Some(digits)
    }
}

fn docket_digits(rest: &str) -> Option<String> {
    let mut rest = rest.trim_start();
    if let Some(after_no) = rest.strip_prefix("no") {
        let after_no = after_no.strip_prefix('.').unwrap_or(after_no).trim_start();
        if after_no.starts_with(|c: char| c.is_ascii_digit()) {
            rest = after_no;
        }
    }
    let digits: String = rest.chars().take_while(char::is_ascii_digit).take(8).collect();
    (digits.len() >= 4).then_some(digits)
}

/// NRC document identifier in a URL: an ADAMS accession number
/// (`ML26012A123`, or `ML` plus at least eight digits) or a press release
/// number such as `2026-014`.
pub fn nrc_document_id(url: &str) -> Option<String> {
    url.char_indices().find_map(|(i, _)| {
        let rest = &url[i..];
        accession_number(rest).or_else(|| release_number(rest))
    })
}

fn digit_run(text: &str) -> usize {
    text.bytes().take_while(u8::is_ascii_digit).count()
}

fn accession_number(rest: &str) -> Option<String> {
    let digits = rest.strip_prefix("ML")?;
    let n = digit_run(digits);
    if n >= 8 {
        return Some(rest[..2 + n].to_string());
    }
    let letter = digits.as_bytes().get(5)?;
    if n == 5 && letter.is_ascii_uppercase() && digit_run(&digits[6..]) >= 3 {
        return Some(rest[..2 + 9].to_string());
    }
    None
}

fn release_number(rest: &str) -> Option<String> {
    if digit_run(rest) != 4 || rest.as_bytes().get(4) != Some(&b'-') {
        return None;
    }
    let serial = digit_run(&rest[5..]);
    (serial >= 3).then(|| rest[..5 + serial].to_string())
}

/// Press-release links on a yearly NRC news index page.
pub fn parse_news_page(html: &str, page_url: &str) -> Result<Vec<NewsItem>, SourceError> {
    let document = Html::parse_document(html);
    let link_sel = selector("a[href]")?;

    let mut items: Vec<NewsItem> = Vec::new();
    for link in document.select(&link_sel) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let text = element_text(link);
        if text.chars().count() < MIN_LINK_TEXT_CHARS {
            continue;
        }
        let href = href.trim();
        if !(href.ends_with(".html") || href.ends_with(".htm")) {
            continue;
        }
        let source_url = absolute_url(href, page_url);
        if items.iter().any(|item| item.source_url == source_url) {
            continue;
        }
        items.push(NewsItem {
            title: truncate_chars(&text, MAX_TITLE_CHARS),
            event_date: find_long_date(&text),
            event_type: classify_event(&text),
            docket: extract_event_docket(&text),
            nrc_document_id: nrc_document_id(&source_url),
            source_url,
        });
    }
    Ok(items)
}

/// Scrapes the current year's NRC news releases into regulatory events.
#[derive(Debug, Clone)]
pub struct NrcEvents {
    pub base_url: String,
}

impl Default for NrcEvents {
    fn default() -> Self {
        Self {
            base_url: NRC_NEWS_BASE_URL.to_string(),
        }
    }
}

impl NrcEvents {
    pub fn page_url(&self, year: i32) -> String {
        format!("{}/{year}/", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl IngestionSource for NrcEvents {
    fn name(&self) -> &'static str {
        "nrc-events"
    }

    async fn run(&self, ctx: &mut IngestContext) -> Result<(), SourceError> {
        let page_url = self.page_url(Utc::now().year());
        let body = ctx.http().get_text(self.name(), &page_url).await?;
        let items = parse_news_page(&body, &page_url)?;
        if items.is_empty() {
            warn!(url = %page_url, "no press releases found on news page");
            return Ok(());
        }
        info!(count = items.len(), "parsed news items");

        for item in items {
            let linked = match &item.docket {
                Some(docket) => ctx.store().reactor_by_docket(docket).await?,
                None => None,
            };
            let record = Record::new(item.source_url)
                .with("title", item.title)
                .with("event_type", item.event_type)
                .with("event_date", item.event_date.map(|d| d.to_string()))
                .with("nrc_document_id", item.nrc_document_id)
                .with("reactor_id", linked.map(|r| r.reactor_id))
                .with("site_id", linked.and_then(|r| r.site_id));
            ctx.upsert(&REGULATORY_EVENTS, &record).await?;
        }
        Ok(())
    }
}
