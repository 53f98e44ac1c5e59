//! Deterministic cleaning of raw participant rows.
//!
//! Every function here is pure: the same row always yields the same entrant,
//! including the same surrogate identifier.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::{Cyclist, CyclistId, RawRow, SURROGATE_PREFIX};

const HEADER_KEYWORDS: &[&str] = &["nom", "name", "coureur", "rider", "prenom"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEntrant {
    pub cyclist_id: CyclistId,
    pub last_name: String,
    pub first_name: String,
    pub last_key: String,
    pub first_key: String,
    pub region: Option<String>,
    pub club: Option<String>,
    pub club_raw: Option<String>,
    pub club_key: String,
    pub category: String,
    pub rank: Option<u32>,
    pub raw_cells: Vec<String>,
}

impl NormalizedEntrant {
    pub fn match_key(&self) -> String {
        format!("{}|{}", self.last_key, self.first_key)
    }

    pub fn to_cyclist(&self) -> Cyclist {
        Cyclist {
            id: self.cyclist_id.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            region: self.region.clone(),
            club: self.club.clone(),
            club_raw: self.club_raw.clone(),
            match_key: self.match_key(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowRejection {
    #[error("row has neither a last name nor a first name")]
    MissingName,
    #[error("row repeats the table header")]
    HeaderRow,
}

pub fn normalize(row: &RawRow) -> Result<NormalizedEntrant, RowRejection> {
    let last = collapse_whitespace(&row.last_name);
    let first = collapse_whitespace(&row.first_name);
    if last.is_empty() && first.is_empty() {
        return Err(RowRejection::MissingName);
    }

    let last_key = comparison_key(&last);
    let first_key = comparison_key(&first);
    if is_header_keyword(&last_key) || is_header_keyword(&first_key) {
        return Err(RowRejection::HeaderRow);
    }

    let region = non_blank(&row.region);
    let club_raw = non_blank(&row.club);
    let club = club_raw.as_deref().map(clean_club_name);
    let club_key = club.as_deref().map(comparison_key).unwrap_or_default();

    let cyclist_id = match non_blank(&row.id) {
        Some(id) => CyclistId::Federation(id),
        None => surrogate_id(&last_key, &first_key, region.as_deref()),
    };

    Ok(NormalizedEntrant {
        cyclist_id,
        last_name: last.to_uppercase(),
        first_name: title_case(&first),
        last_key,
        first_key,
        region,
        club,
        club_raw,
        club_key,
        category: collapse_whitespace(&row.category),
        rank: parse_rank(&row.position),
        raw_cells: row.cells.clone(),
    })
}

/// Accent-insensitive, case-insensitive form used for every name comparison.
pub fn comparison_key(text: &str) -> String {
    let stripped: String = text.nfd().filter(|ch| !is_combining_mark(*ch)).collect();
    collapse_whitespace(&stripped.to_lowercase())
}

/// Key used to find a cyclist by name alone.
pub fn match_key_for(last_name: &str, first_name: &str) -> String {
    format!("{}|{}", comparison_key(last_name), comparison_key(first_name))
}

/// Strips the federation club code some sources prepend ("5244197 VC ...").
pub fn clean_club_name(raw: &str) -> String {
    let trimmed = raw.trim();
    let digits_end = trimmed
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(trimmed.len());
    if digits_end == 0 {
        return collapse_whitespace(trimmed);
    }
    let rest = trimmed[digits_end..].trim_start();
    if rest.is_empty() {
        collapse_whitespace(trimmed)
    } else {
        collapse_whitespace(rest)
    }
}

/// First run of digits in the position cell ("12e", "DNF 3" -> 3).
pub fn parse_rank(position: &str) -> Option<u32> {
    let start = position.find(|ch: char| ch.is_ascii_digit())?;
    let digits: String = position[start..]
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

pub fn surrogate_id(last_key: &str, first_key: &str, region: Option<&str>) -> CyclistId {
    let region_key = region.map(comparison_key).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(format!("{last_key}|{first_key}|{region_key}").as_bytes());
    let digest = hex::encode(hasher.finalize());
    CyclistId::Surrogate(format!("{SURROGATE_PREFIX}{}", &digest[..16]))
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_blank(text: &str) -> Option<String> {
    let collapsed = collapse_whitespace(text);
    (!collapsed.is_empty()).then_some(collapsed)
}

fn is_header_keyword(key: &str) -> bool {
    HEADER_KEYWORDS.contains(&key)
}

fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut at_word_start = true;
    for ch in name.chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(ch);
            at_word_start = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(position: &str, id: &str, last: &str, first: &str, club: &str) -> RawRow {
        RawRow {
            position: position.into(),
            id: id.into(),
            last_name: last.into(),
            first_name: first.into(),
            region: "Pays de la Loire".into(),
            club: club.into(),
            category: "Access 1".into(),
            cells: vec![position.into(), id.into(), last.into(), first.into()],
        }
    }

    #[test]
    fn names_are_cased_and_collapsed() {
        let entrant = normalize(&row("1", "100", "  le   gall ", "jean-PIERRE", "")).expect("entrant");
        assert_eq!(entrant.last_name, "LE GALL");
        assert_eq!(entrant.first_name, "Jean-Pierre");
        assert_eq!(entrant.club, None);
        assert_eq!(entrant.rank, Some(1));
    }

    #[test]
    fn comparison_key_ignores_accents_and_case() {
        assert_eq!(comparison_key("François"), comparison_key("FRANCOIS"));
        assert_eq!(comparison_key("  Élodie   Mérand "), "elodie merand");
    }

    #[test]
    fn club_code_prefix_is_stripped() {
        assert_eq!(clean_club_name("5244197 VC ST SEBASTIEN"), "VC ST SEBASTIEN");
        assert_eq!(clean_club_name("UC Nantes Atlantique"), "UC Nantes Atlantique");
        assert_eq!(clean_club_name("  5244197 "), "5244197");
    }

    #[test]
    fn blank_id_gets_stable_surrogate() {
        let a = normalize(&row("", "", "Dupont", "Éric", "")).expect("a");
        let b = normalize(&row("", " ", "DUPONT", "eric", "")).expect("b");
        assert!(a.cyclist_id.is_surrogate());
        assert_eq!(a.cyclist_id, b.cyclist_id);
        assert!(a.cyclist_id.as_str().starts_with(SURROGATE_PREFIX));
        assert_eq!(a.cyclist_id.as_str().len(), SURROGATE_PREFIX.len() + 16);
    }

    #[test]
    fn rejects_header_and_nameless_rows() {
        assert_eq!(
            normalize(&row("Place", "Licence", "Nom", "Prénom", "Club")),
            Err(RowRejection::HeaderRow)
        );
        assert_eq!(
            normalize(&row("3", "42", " ", "", "Club")),
            Err(RowRejection::MissingName)
        );
    }

    #[test]
    fn rank_is_first_digit_run() {
        assert_eq!(parse_rank("12e"), Some(12));
        assert_eq!(parse_rank("Ab"), None);
        assert_eq!(parse_rank("#7 (ex-aequo 8)"), Some(7));
    }
}
