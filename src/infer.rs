//! Type inference over staging text columns.
//!
//! The caller's upload often arrives all-text. We scan each text column's
//! distinct values, propose a tighter type, and convert in place with
//! `ALTER COLUMN .. USING`. Conversions are best-effort: a failed cast
//! leaves the column as text and the pipeline carries on.

use anyhow::Result;
use regex::Regex;
use sqlx::{PgPool, Row};
use std::sync::OnceLock;
use tracing::{info, instrument, warn};

use crate::payload::IngestSettings;
use crate::schema::{qualified, quote_ident};
use crate::staging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suggested {
    Boolean,
    Integer,
    Numeric,
    Timestamptz,
    Text,
}

impl Suggested {
    pub fn pg_type(&self) -> Option<&'static str> {
        match self {
            Suggested::Boolean => Some("boolean"),
            Suggested::Integer => Some("bigint"),
            Suggested::Numeric => Some("numeric"),
            Suggested::Timestamptz => Some("timestamptz"),
            Suggested::Text => None,
        }
    }
}

fn integer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[+-]?\d+$").unwrap())
}

fn numeric_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$").unwrap())
}

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}$").unwrap())
}

fn is_boolean_token(v: &str) -> bool {
    matches!(
        v.to_ascii_lowercase().as_str(),
        "true" | "false" | "0" | "1"
    )
}

/// Classify a column from its distinct string values. Empty/whitespace
/// values are ignored; a column with no usable values stays text.
pub fn suggest<'a>(values: impl IntoIterator<Item = &'a str>) -> Suggested {
    let mut saw_any = false;
    let mut all_boolean = true;
    let mut all_integer = true;
    let mut all_numeric = true;
    let mut all_timestamp = true;
    for raw in values {
        let v = raw.trim();
        if v.is_empty() {
            continue;
        }
        saw_any = true;
        all_boolean &= is_boolean_token(v);
        all_integer &= integer_re().is_match(v);
        all_numeric &= integer_re().is_match(v) || numeric_re().is_match(v);
        all_timestamp &= timestamp_re().is_match(v);
        if !(all_boolean || all_integer || all_numeric || all_timestamp) {
            return Suggested::Text;
        }
    }
    if !saw_any {
        return Suggested::Text;
    }
    if all_boolean {
        Suggested::Boolean
    } else if all_integer {
        Suggested::Integer
    } else if all_numeric {
        Suggested::Numeric
    } else if all_timestamp {
        Suggested::Timestamptz
    } else {
        Suggested::Text
    }
}

/// Scan staging text columns and convert those with a tighter suggestion.
/// Zipcode and sale-date columns are exempt: zips keep leading zeros and
/// the sale date is cast by the transform.
#[instrument(skip(pool, settings), fields(table = %settings.staging_table))]
pub async fn infer_data_types(pool: &PgPool, settings: &IngestSettings) -> Result<()> {
    let exempt = settings.payload.inference_exempt_columns();
    let table = qualified(&settings.staging_table);
    let columns = staging::staging_columns(pool, &settings.staging_table).await?;

    for col in columns.iter().filter(|c| c.pg_type == "text") {
        if exempt.iter().any(|e| e == &col.name) {
            continue;
        }
        let ident = quote_ident(&col.name);
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT {ident} FROM {table} WHERE {ident} IS NOT NULL"
        ))
        .persistent(false)
        .fetch_all(pool)
        .await?;
        let values: Vec<String> = rows.into_iter().map(|r| r.get::<String, _>(0)).collect();
        let suggestion = suggest(values.iter().map(|s| s.as_str()));
        let Some(pg_type) = suggestion.pg_type() else {
            continue;
        };

        // NULLIF keeps whitespace-only cells castable; a failure anywhere
        // rolls the ALTER back and the column stays text.
        let alter = format!(
            "ALTER TABLE {table} ALTER COLUMN {ident} TYPE {pg_type} \
             USING NULLIF(btrim({ident}), '')::{pg_type}"
        );
        match sqlx::raw_sql(&alter).execute(pool).await {
            Ok(_) => info!(column = %col.name, to = pg_type, "converted column type"),
            Err(e) => {
                warn!(column = %col.name, to = pg_type, error = %e,
                      "type conversion failed; column stays text")
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleans_win_over_integers() {
        assert_eq!(suggest(["0", "1", "TRUE", "false"]), Suggested::Boolean);
        assert_eq!(suggest(["0", "1", "2"]), Suggested::Integer);
    }

    #[test]
    fn integers_and_numerics() {
        assert_eq!(suggest(["-3", "+42", "7"]), Suggested::Integer);
        assert_eq!(suggest(["1.5", "2", "-0.25"]), Suggested::Numeric);
        assert_eq!(suggest(["1e3", ".5", "2.0E-2"]), Suggested::Numeric);
        assert_eq!(suggest(["1.5", "abc"]), Suggested::Text);
    }

    #[test]
    fn timestamps_need_the_exact_shape() {
        assert_eq!(
            suggest(["2026-01-05T10:00:00", "2026-01-06T11:30:00"]),
            Suggested::Timestamptz
        );
        assert_eq!(suggest(["2026-01-05", "2026-01-06"]), Suggested::Text);
        assert_eq!(suggest(["2026-01-05T10:00:00Z"]), Suggested::Text);
    }

    #[test]
    fn empties_are_ignored_and_all_empty_stays_text() {
        assert_eq!(suggest(["", "  ", "5"]), Suggested::Integer);
        assert_eq!(suggest(["", "  "]), Suggested::Text);
        assert_eq!(suggest([]), Suggested::Text);
    }
}
