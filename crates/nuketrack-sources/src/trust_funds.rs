use async_trait::async_trait;
use nuketrack_core::{Record, SITES, TRUST_FUNDS};
use scraper::Html;
use tracing::{info, warn};

use crate::html::{absolute_url, element_text, first_table_rows, selector};
use crate::text::parse_amount;
use crate::{IngestContext, IngestionSource, SourceError};

pub const NRC_TRUST_FUND_REPORTS_URL: &str =
    "https://www.nrc.gov/waste/decommissioning/finan-assur/decom-fnd-status-rpts.html";

const FUND_SOURCE: &str = "NRC Decommissioning Funding Report";
const REPORT_EXTENSIONS: [&str; 3] = [".pdf", ".html", ".htm"];
// Header rows some reports mark up with <td> instead of <th>.
const HEADER_NAMES: [&str; 3] = ["plant", "facility", "name"];

/// Link to a funding status report on the NRC index page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLink {
    pub url: String,
    pub report_year: Option<i64>,
}

impl ReportLink {
    pub fn is_pdf(&self) -> bool {
        self.url.to_ascii_lowercase().ends_with(".pdf")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrustFundEntry {
    pub plant_name: String,
    pub fund_balance: Option<f64>,
    pub estimated_cost: Option<f64>,
}

/// First plausible four-digit year (1950 to 2099) in `text`.
fn find_year(text: &str) -> Option<i64> {
    text.as_bytes()
        .windows(4)
        .enumerate()
        .filter(|(start, w)| {
            w.iter().all(u8::is_ascii_digit)
                && !text.as_bytes()[..*start].last().is_some_and(u8::is_ascii_digit)
                && !text.as_bytes().get(start + 4).is_some_and(u8::is_ascii_digit)
        })
        .filter_map(|(start, _)| text[start..start + 4].parse::<i64>().ok())
        .find(|year| (1950..2100).contains(year))
}

/// First number in a money cell, ignoring `$` and thousands separators.
/// `$1,234.5 (est.)` gives 1234.5; `N/A` gives nothing.
fn money_cell(text: &str) -> Option<f64> {
    let cleaned = text.replace(['$', ','], "");
    let start = cleaned.find(|c: char| c.is_ascii_digit() || c == '.')?;
    let run = &cleaned[start..];
    let end = run
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(run.len());
    parse_amount(&run[..end])
}

/// The index page lists reports newest first, so the first link whose text
/// mentions a report or status and that points at a document wins.
pub fn find_latest_report(html: &str, page_url: &str) -> Result<Option<ReportLink>, SourceError> {
    let document = Html::parse_document(html);
    let link_sel = selector("a[href]")?;

    let found = document.select(&link_sel).find_map(|link| {
        let href = link.value().attr("href")?.trim();
        let text = element_text(link);
        let lower_text = text.to_lowercase();
        let lower_href = href.to_ascii_lowercase();
        let is_report = lower_text.contains("report") || lower_text.contains("status");
        let is_document = REPORT_EXTENSIONS.iter().any(|ext| lower_href.ends_with(ext));
        (is_report && is_document).then(|| ReportLink {
            url: absolute_url(href, page_url),
            report_year: find_year(&text).or_else(|| find_year(href)),
        })
    });
    Ok(found)
}

/// Rows of an HTML funding report. Columns: plant name, fund balance,
/// estimated decommissioning cost; rows with fewer cells are ignored.
pub fn parse_funding_table(html: &str) -> Result<Vec<TrustFundEntry>, SourceError> {
    let document = Html::parse_document(html);
    let rows = first_table_rows(&document)?
        .ok_or_else(|| SourceError::Layout("no funding table in NRC report".into()))?;

    let entries = rows
        .into_iter()
        .filter(|cells| cells.len() >= 3)
        .filter(|cells| {
            let name = cells[0].text.to_lowercase();
            !name.is_empty() && !HEADER_NAMES.contains(&name.as_str())
        })
        .map(|cells| TrustFundEntry {
            fund_balance: money_cell(&cells[1].text),
            estimated_cost: money_cell(&cells[2].text),
            plant_name: cells[0].text.clone(),
        })
        .collect();
    Ok(entries)
}

#[derive(Debug, Clone)]
pub struct NrcTrustFunds {
    pub url: String,
}

impl Default for NrcTrustFunds {
    fn default() -> Self {
        Self {
            url: NRC_TRUST_FUND_REPORTS_URL.to_string(),
        }
    }
}

impl NrcTrustFunds {
    /// Known site for the plant, or a new decommissioning site under the
    /// report's name. `None` when the site row itself could not be written.
    async fn site_for(
        &self,
        ctx: &mut IngestContext,
        plant_name: &str,
    ) -> Result<Option<i64>, SourceError> {
        if let Some(site_id) = ctx.store().site_id_by_name(plant_name).await? {
            return Ok(Some(site_id));
        }
        let site = Record::new(plant_name).with("site_type", "decommissioning");
        Ok(ctx.upsert(&SITES, &site).await?.map(|site| site.entity_id))
    }
}

#[async_trait]
impl IngestionSource for NrcTrustFunds {
    fn name(&self) -> &'static str {
        "nrc-trust-funds"
    }

    async fn run(&self, ctx: &mut IngestContext) -> Result<(), SourceError> {
        let index = ctx.http().get_text(self.name(), &self.url).await?;
        let Some(report) = find_latest_report(&index, &self.url)? else {
            warn!(url = %self.url, "no funding status report linked; page format may have changed");
            return Ok(());
        };
        if report.is_pdf() {
            warn!(report = %report.url, "latest funding report is a PDF; nothing to ingest");
            return Ok(());
        }
        info!(report = %report.url, year = ?report.report_year, "fetching funding report");

        let body = ctx.http().get_text(self.name(), &report.url).await?;
        let entries = parse_funding_table(&body)?;
        if entries.is_empty() {
            warn!(report = %report.url, "no trust fund entries parsed");
            return Ok(());
        }
        info!(count = entries.len(), "parsed trust fund entries");

        for entry in entries {
            let Some(site_id) = self.site_for(ctx, &entry.plant_name).await? else {
                continue;
            };
            let record = Record::new(site_id.to_string())
                .with("fund_balance", entry.fund_balance)
                .with("estimated_cost", entry.estimated_cost)
                .with("report_year", report.report_year)
                .with("source", FUND_SOURCE)
                .with("source_url", report.url.as_str());
            ctx.upsert(&TRUST_FUNDS, &record).await?;
        }
        Ok(())
    }
}
