use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use nuketrack_core::{Record, COMMODITY_PRICES};
use scraper::Html;
use tracing::{info, warn};

use crate::html::collapse_whitespace;
use crate::text::parse_amount;
use crate::{IngestContext, IngestionSource, SourceError};

pub const CAMECO_URL: &str = "https://www.cameco.com/invest/markets/uranium-price";
const CAMECO: &str = "Cameco";

#[derive(Debug, Clone, PartialEq)]
pub struct SpotPrice {
    pub commodity: &'static str,
    pub price: f64,
    pub unit: &'static str,
}

impl SpotPrice {
    /// Natural key: one price per commodity, day, and publisher.
    pub fn price_key(&self, date: NaiveDate, source: &str) -> String {
        format!("{}|{date}|{source}", self.commodity)
    }
}

/// A `$` amount in page text with the text between it and the previous `$`.
struct DollarAmount<'a> {
    lead: &'a str,
    value: f64,
    tail: &'a str,
}

fn dollar_amounts(text: &str) -> Vec<DollarAmount<'_>> {
    let mut amounts = Vec::new();
    let mut lead_start = 0;
    for (at, _) in text.match_indices('$') {
        let lead = &text[lead_start..at];
        lead_start = at + 1;
        let after = text[at + 1..].trim_start();
        let number_len = after
            .find(|c: char| !(c.is_ascii_digit() || c == ',' || c == '.'))
            .unwrap_or(after.len());
        if let Some(value) = parse_amount(&after[..number_len]) {
            amounts.push(DollarAmount {
                lead,
                value,
                tail: &after[number_len..],
            });
        }
    }
    amounts
}

fn is_per_pound(tail: &str) -> bool {
    let tail = tail.trim_start();
    let tail = tail.strip_prefix('/').unwrap_or(tail).trim_start();
    tail.get(..2).is_some_and(|unit| unit.eq_ignore_ascii_case("lb"))
}

/// Spot U3O8 ($/lb, between $10 and $500) and SWU (between $50 and $500)
/// prices from the text of a price page. At most one of each.
pub fn parse_spot_prices(html: &str) -> Vec<SpotPrice> {
    let document = Html::parse_document(html);
    let text = collapse_whitespace(&document.root_element().text().collect::<Vec<_>>().join(" "));
    let amounts = dollar_amounts(&text);

    let mut prices = Vec::new();
    let uranium = amounts.iter().find(|a| {
        let lead = a.lead.to_lowercase();
        (lead.contains("spot") || lead.contains("price"))
            && is_per_pound(a.tail)
            && a.value > 10.0
            && a.value < 500.0
    });
    if let Some(a) = uranium {
        prices.push(SpotPrice {
            commodity: "U3O8",
            price: a.value,
            unit: "lb",
        });
    }

    let swu = amounts
        .iter()
        .find(|a| a.lead.to_lowercase().contains("swu") && a.value > 50.0 && a.value < 500.0);
    if let Some(a) = swu {
        prices.push(SpotPrice {
            commodity: "SWU",
            price: a.value,
            unit: "SWU",
        });
    }
    prices
}

#[derive(Debug, Clone)]
pub struct UraniumPrices {
    pub url: String,
}

impl Default for UraniumPrices {
    fn default() -> Self {
        Self {
            url: CAMECO_URL.to_string(),
        }
    }
}

#[async_trait]
impl IngestionSource for UraniumPrices {
    fn name(&self) -> &'static str {
        "uranium-prices"
    }

    async fn run(&self, ctx: &mut IngestContext) -> Result<(), SourceError> {
        let body = ctx.http().get_text(self.name(), &self.url).await?;
        let prices = parse_spot_prices(&body);
        if prices.is_empty() {
            warn!(url = %self.url, "no prices parsed; page format may have changed");
            return Ok(());
        }
        info!(count = prices.len(), "parsed spot prices");

        let today = Utc::now().date_naive();
        for price in prices {
            let record = Record::new(price.price_key(today, CAMECO))
                .with("commodity", price.commodity)
                .with("price", price.price)
                .with("unit", price.unit)
                .with("price_date", today.to_string())
                .with("source", CAMECO)
                .with("source_url", self.url.as_str());
            ctx.upsert(&COMMODITY_PRICES, &record).await?;
        }
        Ok(())
    }
}
