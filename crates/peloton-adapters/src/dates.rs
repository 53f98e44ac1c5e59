//! Race dates as French sites print them.

use chrono::NaiveDate;
use peloton_core::comparison_key;

const FRENCH_MONTHS: &[(&str, u32)] = &[
    ("janvier", 1),
    ("janv", 1),
    ("jan", 1),
    ("fevrier", 2),
    ("fevr", 2),
    ("fev", 2),
    ("mars", 3),
    ("mar", 3),
    ("avril", 4),
    ("avr", 4),
    ("mai", 5),
    ("juin", 6),
    ("juillet", 7),
    ("juil", 7),
    ("jui", 7),
    ("aout", 8),
    ("aou", 8),
    ("septembre", 9),
    ("sept", 9),
    ("sep", 9),
    ("octobre", 10),
    ("oct", 10),
    ("novembre", 11),
    ("nov", 11),
    ("decembre", 12),
    ("dec", 12),
];

/// Parses "samedi 25 mai 2024", "3 sept. 2024", "1er juin 2024",
/// "25/05/2024", "25-05-2024" and "2024-05-25".
pub fn parse_race_date(text: &str) -> Option<NaiveDate> {
    let key = comparison_key(text).replace([',', '.'], " ");
    let tokens: Vec<&str> = key.split_whitespace().collect();
    spelled_out(&tokens).or_else(|| tokens.iter().find_map(|token| numeric(token)))
}

fn spelled_out(tokens: &[&str]) -> Option<NaiveDate> {
    tokens.windows(3).find_map(|window| {
        let day = day_number(window[0])?;
        let month = month_number(window[1])?;
        let year = year_number(window[2])?;
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

fn day_number(token: &str) -> Option<u32> {
    let digits = token.strip_suffix("er").unwrap_or(token);
    let day: u32 = digits.parse().ok()?;
    (1..=31).contains(&day).then_some(day)
}

fn month_number(token: &str) -> Option<u32> {
    FRENCH_MONTHS
        .iter()
        .find(|(name, _)| *name == token)
        .map(|(_, month)| *month)
}

fn year_number(token: &str) -> Option<i32> {
    if token.len() == 4 && token.chars().all(|ch| ch.is_ascii_digit()) {
        token.parse().ok()
    } else {
        None
    }
}

fn numeric(token: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = token.split(['/', '-']).collect();
    let [a, b, c] = parts.as_slice() else {
        return None;
    };
    if !parts.iter().all(|p| !p.is_empty() && p.chars().all(|ch| ch.is_ascii_digit())) {
        return None;
    }
    if a.len() == 4 {
        NaiveDate::from_ymd_opt(a.parse().ok()?, b.parse().ok()?, c.parse().ok()?)
    } else {
        NaiveDate::from_ymd_opt(year_number(c)?, b.parse().ok()?, a.parse().ok()?)
    }
}
