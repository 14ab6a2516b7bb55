use async_trait::async_trait;
use nuketrack_core::{Record, COMPANIES, CONTRACTS};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::{IngestContext, IngestionSource, SourceError};

pub const USASPENDING_AWARD_SEARCH_URL: &str =
    "https://api.usaspending.gov/api/v2/search/spending_by_award/";

/// Nuclear power generation, engineering services, remediation, nuclear R&D,
/// and power plant construction.
pub const NUCLEAR_NAICS_CODES: [&str; 5] = ["221113", "541330", "562211", "541715", "237130"];

const AGENCY_KEYWORDS: [&str; 5] = ["ENERGY", "NUCLEAR", "DEFENSE", "ARMY", "NAVY"];

const AWARD_FIELDS: [&str; 8] = [
    "Award ID",
    "Recipient Name",
    "Award Amount",
    "Start Date",
    "End Date",
    "Description",
    "Awarding Agency",
    "Awarding Sub Agency",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ContractAward {
    pub award_id: String,
    pub recipient: String,
    pub amount: Option<f64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub description: Option<String>,
    pub awarding_agency: Option<String>,
    pub sub_agency: Option<String>,
}

impl ContractAward {
    pub fn is_nuclear_relevant(&self) -> bool {
        [&self.awarding_agency, &self.sub_agency]
            .into_iter()
            .flatten()
            .any(|agency| {
                let upper = agency.to_uppercase();
                AGENCY_KEYWORDS.iter().any(|kw| upper.contains(kw))
            })
    }

    pub fn source_url(&self) -> String {
        format!("https://www.usaspending.gov/award/{}", self.award_id)
    }
}

/// Search payload for contract awards (types A-D) under one NAICS code,
/// largest awards first.
pub fn award_payload(naics_code: &str, page: u32, limit: u32) -> JsonValue {
    json!({
        "filters": {
            "naics_codes": [naics_code],
            "award_type_codes": ["A", "B", "C", "D"],
        },
        "fields": AWARD_FIELDS,
        "page": page,
        "limit": limit,
        "sort": "Award Amount",
        "order": "desc",
    })
}

fn json_text(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Awards from a `spending_by_award` response. Rows without an award id or a
/// recipient are dropped and counted in the second tuple element.
pub fn parse_awards(response: &JsonValue) -> Result<(Vec<ContractAward>, usize), SourceError> {
    let results = response
        .get("results")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| SourceError::Layout("award search response has no `results` array".into()))?;

    let mut awards = Vec::with_capacity(results.len());
    let mut dropped = 0;
    for row in results {
        let (Some(award_id), Some(recipient)) =
            (json_text(row, "Award ID"), json_text(row, "Recipient Name"))
        else {
            dropped += 1;
            continue;
        };
        awards.push(ContractAward {
            award_id,
            recipient,
            amount: row.get("Award Amount").and_then(JsonValue::as_f64),
            start_date: json_text(row, "Start Date"),
            end_date: json_text(row, "End Date"),
            description: json_text(row, "Description"),
            awarding_agency: json_text(row, "Awarding Agency"),
            sub_agency: json_text(row, "Awarding Sub Agency"),
        });
    }
    Ok((awards, dropped))
}

#[derive(Debug, Clone)]
pub struct UsaSpendingContracts {
    pub endpoint: String,
    pub naics_codes: Vec<String>,
    pub page_size: u32,
}

impl Default for UsaSpendingContracts {
    fn default() -> Self {
        Self {
            endpoint: USASPENDING_AWARD_SEARCH_URL.to_string(),
            naics_codes: NUCLEAR_NAICS_CODES.iter().map(|c| c.to_string()).collect(),
            page_size: 100,
        }
    }
}

impl UsaSpendingContracts {
    async fn store_award(
        &self,
        ctx: &mut IngestContext,
        naics: &str,
        award: ContractAward,
    ) -> Result<(), SourceError> {
        let company = Record::new(&award.recipient).with("company_type", "contractor");
        let Some(company) = ctx.upsert(&COMPANIES, &company).await? else {
            return Ok(());
        };
        let source_url = award.source_url();
        let contract = Record::new(award.award_id)
            .with("company_id", company.entity_id)
            .with("naics_code", naics)
            .with("awarding_agency", award.awarding_agency)
            .with("sub_agency", award.sub_agency)
            .with("description", award.description)
            .with("amount", award.amount)
            .with("start_date", award.start_date)
            .with("end_date", award.end_date)
            .with("source_url", source_url);
        ctx.upsert(&CONTRACTS, &contract).await?;
        Ok(())
    }
}

#[async_trait]
impl IngestionSource for UsaSpendingContracts {
    fn name(&self) -> &'static str {
        "usaspending-contracts"
    }

    /// Queries each NAICS code in turn. A failing code is logged and skipped;
    /// the run only fails when every query fails.
    async fn run(&self, ctx: &mut IngestContext) -> Result<(), SourceError> {
        let mut last_error = None;
        let mut succeeded = 0;

        for naics in &self.naics_codes {
            let payload = award_payload(naics, 1, self.page_size);
            let response = match ctx.http().post_json(self.name(), &self.endpoint, &payload).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(naics = %naics, error = %err, "award search failed");
                    last_error = Some(SourceError::from(err));
                    continue;
                }
            };
            let (awards, dropped) = parse_awards(&response)?;
            succeeded += 1;
            info!(naics = %naics, count = awards.len(), dropped, "fetched contract awards");
            for _ in 0..dropped {
                ctx.skip("award without id or recipient");
            }

            for award in awards {
                if !award.is_nuclear_relevant() {
                    ctx.skip("award outside nuclear-relevant agencies");
                    continue;
                }
                self.store_award(ctx, naics, award).await?;
            }
        }

        match last_error {
            Some(err) if succeeded == 0 => Err(err),
            _ => Ok(()),
        }
    }
}
