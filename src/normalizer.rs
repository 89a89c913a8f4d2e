//! Turns loosely shaped input rows (CSV lines, JSON objects) into
//! canonical `{name, email, company}` candidates.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One input row as produced by a CSV reader or a JSON payload.
pub type RawRow = Map<String, Value>;

const BOM: char = '\u{feff}';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRow {
    pub name: String,
    pub email: String,
    pub company: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedRow {
    /// No keys at all; dropped without an error.
    Ghost,
    /// Non-empty row whose email resolved to nothing.
    MissingEmail,
    Valid(CandidateRow),
}

fn clean_key(key: &str) -> String {
    let key = key.trim();
    let key = key.strip_prefix(BOM).unwrap_or(key);
    key.trim().to_lowercase()
}

fn field_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "true".to_string(),
        _ => String::new(),
    }
}

/// Look up a field by its cleaned key. When several raw keys collapse to
/// the same name, the first non-empty value wins.
fn lookup(row: &RawRow, field: &str) -> String {
    row.iter()
        .filter(|(key, _)| clean_key(key) == field)
        .map(|(_, value)| field_text(value))
        .find(|text| !text.is_empty())
        .unwrap_or_default()
}

pub fn normalize_row(row: &RawRow) -> NormalizedRow {
    if row.is_empty() {
        return NormalizedRow::Ghost;
    }

    let email = lookup(row, "email").to_lowercase();
    if email.is_empty() {
        return NormalizedRow::MissingEmail;
    }

    NormalizedRow::Valid(CandidateRow {
        name: lookup(row, "name"),
        email,
        company: lookup(row, "company"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> RawRow {
        value.as_object().cloned().expect("row must be an object")
    }

    #[test]
    fn test_empty_row_is_ghost() {
        assert_eq!(normalize_row(&RawRow::new()), NormalizedRow::Ghost);
    }

    #[test]
    fn test_keys_are_case_insensitive_and_trimmed() {
        let normalized = normalize_row(&row(json!({
            " Name ": "  Ada Lovelace ",
            "EMAIL": " Ada@Example.COM ",
            "Company": "Analytical Engines\t",
        })));

        assert_eq!(
            normalized,
            NormalizedRow::Valid(CandidateRow {
                name: "Ada Lovelace".to_string(),
                email: "ada@example.com".to_string(),
                company: "Analytical Engines".to_string(),
            })
        );
    }

    #[test]
    fn test_bom_stripped_from_first_header() {
        let normalized = normalize_row(&row(json!({
            "\u{feff}name": "Grace",
            "email": "grace@navy.mil",
            "company": "USN",
        })));

        match normalized {
            NormalizedRow::Valid(candidate) => assert_eq!(candidate.name, "Grace"),
            other => panic!("expected valid row, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_email_is_invalid_not_ghost() {
        let normalized = normalize_row(&row(json!({"name": "No Mail", "company": "Acme"})));
        assert_eq!(normalized, NormalizedRow::MissingEmail);

        let normalized = normalize_row(&row(json!({"name": "Blank", "email": "   "})));
        assert_eq!(normalized, NormalizedRow::MissingEmail);

        let normalized = normalize_row(&row(json!({"email": null})));
        assert_eq!(normalized, NormalizedRow::MissingEmail);
    }

    #[test]
    fn test_extra_keys_ignored() {
        let normalized = normalize_row(&row(json!({
            "email": "x@y.io",
            "phone": "555-0100",
        })));

        assert_eq!(
            normalized,
            NormalizedRow::Valid(CandidateRow {
                name: String::new(),
                email: "x@y.io".to_string(),
                company: String::new(),
            })
        );
    }

    #[test]
    fn test_non_string_values_rendered() {
        let normalized = normalize_row(&row(json!({
            "email": "n@y.io",
            "name": 42,
            "company": false,
        })));

        match normalized {
            NormalizedRow::Valid(candidate) => {
                assert_eq!(candidate.name, "42");
                assert_eq!(candidate.company, "");
            }
            other => panic!("expected valid row, got {:?}", other),
        }
    }
}
