use async_trait::async_trait;
use nuketrack_core::{Record, REACTORS, SITES};
use scraper::Html;
use tracing::{info, warn};

use crate::html::first_table_rows;
use crate::text::{find_docket, site_name, state_from_location, strip_docket, unit_number};
use crate::{IngestContext, IngestionSource, SourceError};

pub const NRC_OPERATING_REACTORS_URL: &str =
    "https://www.nrc.gov/reactors/operating/list-power-reactor-units.html";

/// One row of the NRC list of operating power reactor units.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatingReactor {
    pub name: String,
    pub site_name: String,
    pub unit_number: Option<i64>,
    pub docket: Option<String>,
    pub reactor_type: String,
    pub location: String,
    pub state: Option<String>,
    pub owner: Option<String>,
}

pub(crate) fn reactor_type(raw: &str) -> &'static str {
    match raw.trim().to_ascii_uppercase().as_str() {
        "PWR" => "PWR",
        "BWR" => "BWR",
        "HTGR" => "HTGR",
        _ => "Other",
    }
}

/// Parses the operating-reactor table. Columns: plant name and docket,
/// license, reactor type, location, owner/operator, region.
pub fn parse_reactor_table(html: &str) -> Result<Vec<OperatingReactor>, SourceError> {
    let document = Html::parse_document(html);
    let rows = first_table_rows(&document)?
        .ok_or_else(|| SourceError::Layout("no reactor table on NRC page".into()))?;

    let reactors = rows
        .into_iter()
        .filter(|cells| cells.len() >= 4)
        .map(|cells| {
            let plant = &cells[0];
            let docket = find_docket(&plant.text)
                .or_else(|| plant.href.as_deref().and_then(find_docket));
            let name = match &docket {
                Some(docket) => strip_docket(&plant.text, docket),
                None => plant.text.clone(),
            };
            let location = cells[3].text.clone();
            OperatingReactor {
                site_name: site_name(&name),
                unit_number: unit_number(&name),
                docket,
                reactor_type: reactor_type(&cells[2].text).to_string(),
                state: state_from_location(&location),
                owner: cells.get(4).map(|c| c.text.clone()).filter(|o| !o.is_empty()),
                location,
                name,
            }
        })
        .collect();
    Ok(reactors)
}

#[derive(Debug, Clone)]
pub struct NrcReactors {
    pub url: String,
}

impl Default for NrcReactors {
    fn default() -> Self {
        Self {
            url: NRC_OPERATING_REACTORS_URL.to_string(),
        }
    }
}

#[async_trait]
impl IngestionSource for NrcReactors {
    fn name(&self) -> &'static str {
        "nrc-reactors"
    }

    async fn run(&self, ctx: &mut IngestContext) -> Result<(), SourceError> {
        let body = ctx.http().get_text(self.name(), &self.url).await?;
        let reactors = parse_reactor_table(&body)?;
        if reactors.is_empty() {
            warn!(url = %self.url, "no reactors parsed; page format may have changed");
            return Ok(());
        }
        info!(count = reactors.len(), "parsed operating reactors");

        for reactor in reactors {
            let site = Record::new(&reactor.site_name)
                .with("state", reactor.state.clone())
                .with("owner", reactor.owner.clone())
                .with("operator", reactor.owner.clone())
                .with("location", reactor.location.clone());
            let Some(site) = ctx.upsert(&SITES, &site).await? else {
                continue;
            };

            let Some(docket) = reactor.docket else {
                ctx.skip("operating reactor without docket number");
                continue;
            };
            let record = Record::new(docket)
                .with("name", reactor.name)
                .with("site_id", site.entity_id)
                .with("unit_number", reactor.unit_number)
                .with("reactor_type", reactor.reactor_type)
                .with("status", "operating");
            ctx.upsert(&REACTORS, &record).await?;
        }
        Ok(())
    }
}
