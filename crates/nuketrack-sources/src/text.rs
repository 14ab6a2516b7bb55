//! Small text scanners shared by the NRC and price sources.

use chrono::NaiveDate;

const US_STATES: [(&str, &str); 50] = [
    ("Alabama", "AL"),
    ("Alaska", "AK"),
    ("Arizona", "AZ"),
    ("Arkansas", "AR"),
    ("California", "CA"),
    ("Colorado", "CO"),
    ("Connecticut", "CT"),
    ("Delaware", "DE"),
    ("Florida", "FL"),
    ("Georgia", "GA"),
    ("Hawaii", "HI"),
    ("Idaho", "ID"),
    ("Illinois", "IL"),
    ("Indiana", "IN"),
    ("Iowa", "IA"),
    ("Kansas", "KS"),
    ("Kentucky", "KY"),
    ("Louisiana", "LA"),
    ("Maine", "ME"),
    ("Maryland", "MD"),
    ("Massachusetts", "MA"),
    ("Michigan", "MI"),
    ("Minnesota", "MN"),
    ("Mississippi", "MS"),
    ("Missouri", "MO"),
    ("Montana", "MT"),
    ("Nebraska", "NE"),
    ("Nevada", "NV"),
    ("New Hampshire", "NH"),
    ("New Jersey", "NJ"),
    ("New Mexico", "NM"),
    ("New York", "NY"),
    ("North Carolina", "NC"),
    ("North Dakota", "ND"),
    ("Ohio", "OH"),
    ("Oklahoma", "OK"),
    ("Oregon", "OR"),
    ("Pennsylvania", "PA"),
    ("Rhode Island", "RI"),
    ("South Carolina", "SC"),
    ("South Dakota", "SD"),
    ("Tennessee", "TN"),
    ("Texas", "TX"),
    ("Utah", "UT"),
    ("Vermont", "VT"),
    // before "Virginia", which it contains
    ("West Virginia", "WV"),
    ("Virginia", "VA"),
    ("Washington", "WA"),
    ("Wisconsin", "WI"),
    ("Wyoming", "WY"),
];

const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// First NRC power-reactor docket (`0500` followed by four digits) in `text`.
pub(crate) fn find_docket(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    bytes
        .windows(8)
        .position(|w| w.starts_with(b"0500") && w[4..].iter().all(u8::is_ascii_digit))
        .map(|start| text[start..start + 8].to_string())
}

/// Removes a docket number and any parentheses around it from a plant name.
pub(crate) fn strip_docket(name: &str, docket: &str) -> String {
    let without = name
        .replace(&format!("({docket})"), " ")
        .replace(docket, " ");
    without.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trailing unit number of a reactor name, e.g. `Braidwood 1`.
pub(crate) fn unit_number(name: &str) -> Option<i64> {
    let trimmed = name.trim_end();
    let digits_at = trimmed
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    trimmed[digits_at..].parse().ok()
}

/// Site name for a reactor unit: the unit suffix (`2`, `, Unit 2`) removed.
pub(crate) fn site_name(reactor_name: &str) -> String {
    let trimmed = reactor_name.trim();
    let Some(without_digits) = trimmed
        .strip_suffix(|c: char| c.is_ascii_digit())
        .map(|s| s.trim_end_matches(|c: char| c.is_ascii_digit()))
    else {
        return trimmed.to_string();
    };
    let rest = without_digits.trim_end();
    let rest = rest.strip_suffix("Unit").unwrap_or(rest).trim_end();
    let rest = rest.strip_suffix(',').unwrap_or(rest);
    rest.trim().to_string()
}

/// Two-letter state code from a location such as `6 miles WNW of Russellville, AR`,
/// falling back to a spelled-out state name.
pub(crate) fn state_from_location(location: &str) -> Option<String> {
    for (comma, _) in location.match_indices(',') {
        let after = location[comma + 1..].trim_start();
        if let Some(code) = leading_state_code(after) {
            return Some(code);
        }
    }
    US_STATES
        .iter()
        .find(|(name, _)| location.contains(name))
        .map(|(_, code)| (*code).to_string())
}

/// First standalone two-letter uppercase word, e.g. `IL` in `Zion IL 60099`.
pub(crate) fn standalone_state_code(text: &str) -> Option<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .find(|word| word.len() == 2 && word.chars().all(|c| c.is_ascii_uppercase()))
        .map(str::to_string)
}

fn leading_state_code(text: &str) -> Option<String> {
    let mut chars = text.chars();
    let code: String = chars.by_ref().take(2).collect();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    match chars.next() {
        Some(c) if c.is_alphanumeric() || c == '_' => None,
        _ => Some(code),
    }
}

/// First `Month D, YYYY` (comma optional) date in free text.
pub(crate) fn find_long_date(text: &str) -> Option<NaiveDate> {
    let words = text.split_whitespace().collect::<Vec<_>>();
    words.windows(3).find_map(|w| {
        let month = w[0].trim_start_matches(|c: char| !c.is_alphanumeric());
        if !MONTHS.contains(&month) {
            return None;
        }
        let day = w[1].trim_end_matches(',');
        if day.is_empty() || day.len() > 2 || !day.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let year: String = w[2].chars().take_while(char::is_ascii_digit).collect();
        if year.len() != 4 {
            return None;
        }
        NaiveDate::parse_from_str(&format!("{month} {day} {year}"), "%B %d %Y").ok()
    })
}

/// Parses `1,234.50` style amounts.
pub(crate) fn parse_amount(text: &str) -> Option<f64> {
    let cleaned = text.replace(',', "");
    let cleaned = cleaned.trim_end_matches('.');
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Truncates to at most `max` characters without splitting a code point.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
