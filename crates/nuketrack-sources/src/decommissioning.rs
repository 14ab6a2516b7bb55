use async_trait::async_trait;
use nuketrack_core::{Record, REACTORS, SITES};
use scraper::Html;
use tracing::{info, warn};

use crate::html::first_table_rows;
use crate::text::{find_docket, site_name, standalone_state_code};
use crate::{IngestContext, IngestionSource, SourceError};

pub const NRC_DECOMMISSIONING_URL: &str =
    "https://www.nrc.gov/info-finder/decommissioning/power-reactor/";

// First matching phrase wins.
const STATUS_PHRASES: [(&str, &str); 5] = [
    ("safstor", "decommissioning"),
    ("decon", "decommissioning"),
    ("dismantling", "decommissioning"),
    ("license terminated", "decommissioned"),
    ("terminated", "decommissioned"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct DecommissioningEntry {
    pub name: String,
    pub site_name: String,
    pub docket: Option<String>,
    pub location: String,
    pub state: Option<String>,
    pub reactor_status: &'static str,
    pub site_type: &'static str,
    pub reactor_type: &'static str,
}

fn classify_status(raw: &str) -> (&'static str, &'static str) {
    let lower = raw.to_lowercase();
    STATUS_PHRASES
        .iter()
        .find(|(phrase, _)| lower.contains(phrase))
        .map(|(_, status)| (*status, *status))
        .unwrap_or(("permanently-shutdown", "decommissioning"))
}

fn decommissioned_reactor_type(raw: &str) -> &'static str {
    let upper = raw.to_ascii_uppercase();
    if upper.contains("PWR") {
        "PWR"
    } else if upper.contains("BWR") {
        "BWR"
    } else {
        "Other"
    }
}

/// Parses the decommissioning table. Columns: reactor name, location (which
/// sometimes carries the docket), decommissioning status, reactor type.
pub fn parse_decommissioning_table(html: &str) -> Result<Vec<DecommissioningEntry>, SourceError> {
    let document = Html::parse_document(html);
    let rows = first_table_rows(&document)?
        .ok_or_else(|| SourceError::Layout("no decommissioning table on NRC page".into()))?;

    let entries = rows
        .into_iter()
        .filter(|cells| cells.len() >= 3)
        .map(|cells| {
            let name = cells[0].text.clone();
            let docket = cells[0]
                .href
                .as_deref()
                .and_then(find_docket)
                .or_else(|| find_docket(&cells[1].text));
            let (reactor_status, site_type) = classify_status(&cells[2].text);
            DecommissioningEntry {
                site_name: site_name(&name),
                docket,
                state: standalone_state_code(&cells[1].text),
                location: cells[1].text.clone(),
                reactor_status,
                site_type,
                reactor_type: cells
                    .get(3)
                    .map(|c| decommissioned_reactor_type(&c.text))
                    .unwrap_or("Other"),
                name,
            }
        })
        .collect();
    Ok(entries)
}

#[derive(Debug, Clone)]
pub struct NrcDecommissioning {
    pub url: String,
}

impl Default for NrcDecommissioning {
    fn default() -> Self {
        Self {
            url: NRC_DECOMMISSIONING_URL.to_string(),
        }
    }
}

#[async_trait]
impl IngestionSource for NrcDecommissioning {
    fn name(&self) -> &'static str {
        "nrc-decommissioning"
    }

    async fn run(&self, ctx: &mut IngestContext) -> Result<(), SourceError> {
        let body = ctx.http().get_text(self.name(), &self.url).await?;
        let entries = parse_decommissioning_table(&body)?;
        if entries.is_empty() {
            warn!(url = %self.url, "no decommissioning entries parsed; page format may have changed");
            return Ok(());
        }
        info!(count = entries.len(), "parsed decommissioning entries");

        for entry in entries {
            let site = Record::new(&entry.site_name)
                .with("state", entry.state.clone())
                .with("site_type", entry.site_type);
            let Some(site) = ctx.upsert(&SITES, &site).await? else {
                continue;
            };

            let Some(docket) = entry.docket else {
                ctx.skip("decommissioning reactor without docket number");
                continue;
            };
            let record = Record::new(docket)
                .with("name", entry.name)
                .with("site_id", site.entity_id)
                .with("reactor_type", entry.reactor_type)
                .with("status", entry.reactor_status);
            ctx.upsert(&REACTORS, &record).await?;
        }
        Ok(())
    }
}
