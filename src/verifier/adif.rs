// 📜 ADIF parsing - logbook export format
//
// Fields look like `<CALL:5>AB1CD` or `<QSO_DATE:8:D>20251018`; the length
// says how many characters of value follow the tag. `<EOR>` closes a
// record, `<EOH>` closes the (ignored) file header.

use super::ConfirmedSet;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| {
        Regex::new(r"(?i)<([A-Z0-9_]+)(?::(\d+)(?::[A-Z])?)?>").expect("static ADIF tag regex")
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdifRecord {
    pub call: Option<String>,
    pub qso_date: Option<NaiveDate>,
    pub time_on: Option<NaiveTime>,
}

impl AdifRecord {
    fn from_fields(fields: &mut HashMap<String, String>) -> Self {
        let record = AdifRecord {
            call: fields
                .get("CALL")
                .map(|c| c.to_ascii_uppercase())
                .filter(|c| !c.is_empty()),
            qso_date: fields.get("QSO_DATE").and_then(|d| parse_date(d)),
            time_on: fields.get("TIME_ON").and_then(|t| parse_time(t)),
        };
        fields.clear();
        record
    }

    pub fn qso_datetime(&self) -> Option<NaiveDateTime> {
        let date = self.qso_date?;
        Some(date.and_time(self.time_on.unwrap_or(NaiveTime::MIN)))
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    match raw.len() {
        4 => NaiveTime::parse_from_str(raw, "%H%M").ok(),
        6 => NaiveTime::parse_from_str(raw, "%H%M%S").ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdifError {
    /// A `<TAG:len>` whose length runs past the end of the document
    #[error("field {field} declares {declared} characters but only {remaining} bytes remain")]
    LengthOverrun {
        field: String,
        declared: String,
        remaining: usize,
    },
}

/// Split an ADIF document into records.
pub fn parse_records(text: &str) -> Result<Vec<AdifRecord>, AdifError> {
    let mut records = Vec::new();
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut pos = 0;

    while let Some(caps) = tag_regex().captures_at(text, pos) {
        let Some(tag) = caps.get(0) else { break };
        let name = caps[1].to_ascii_uppercase();
        pos = tag.end();

        match (name.as_str(), caps.get(2)) {
            ("EOR", _) => records.push(AdifRecord::from_fields(&mut fields)),
            ("EOH", _) => fields.clear(),
            (_, Some(declared)) => {
                let remaining = text.len() - pos;
                let len = match declared.as_str().parse::<usize>() {
                    Ok(len) if len <= remaining => len,
                    _ => {
                        return Err(AdifError::LengthOverrun {
                            field: name,
                            declared: declared.as_str().to_string(),
                            remaining,
                        })
                    }
                };
                let mut end = pos + len;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                fields.insert(name, text[pos..end].trim().to_string());
                pos = end;
            }
            _ => {}
        }
    }

    // Tolerate a final record missing its <EOR>
    if fields.contains_key("CALL") {
        records.push(AdifRecord::from_fields(&mut fields));
    }

    Ok(records)
}

/// Callsigns from `records`, limited to QSOs dated on or after `since`.
/// With a `since` date, undated records are dropped.
pub fn confirmed_since(records: &[AdifRecord], since: Option<NaiveDate>) -> ConfirmedSet {
    records
        .iter()
        .filter(|record| match since {
            None => true,
            Some(since) => record.qso_date.is_some_and(|date| date >= since),
        })
        .filter_map(|record| record.call.as_deref())
        .collect()
}
