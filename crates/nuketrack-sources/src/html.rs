use scraper::{ElementRef, Html, Selector};

use crate::SourceError;

pub(crate) fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Message(e.to_string()))
}

/// Element text with runs of whitespace collapsed to single spaces.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

const NRC_ORIGIN: &str = "https://www.nrc.gov";

/// Resolves a link found on `page_url`. Root-relative links point at the NRC site.
pub(crate) fn absolute_url(href: &str, page_url: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{NRC_ORIGIN}{href}")
    } else {
        format!("{}/{href}", page_url.trim_end_matches('/'))
    }
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One `<td>` of a data table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Cell {
    pub text: String,
    pub href: Option<String>,
}

/// Data rows of the first `<table>` in the document, or `None` if the page has
/// no table at all. Header rows (no `<td>`) are dropped.
pub(crate) fn first_table_rows(document: &Html) -> Result<Option<Vec<Vec<Cell>>>, SourceError> {
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a[href]")?;

    let Some(table) = document.select(&table_sel).next() else {
        return Ok(None);
    };

    let rows = table
        .select(&row_sel)
        .map(|row| {
            row.select(&cell_sel)
                .map(|cell| Cell {
                    text: element_text(cell),
                    href: cell
                        .select(&link_sel)
                        .next()
                        .and_then(|a| a.value().attr("href"))
                        .map(str::to_string),
                })
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect();
    Ok(Some(rows))
}
