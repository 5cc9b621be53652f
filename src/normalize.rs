//! Row normalization: raw spreadsheet records → canonical [`LeadRow`]s.
//!
//! Column matching is data-driven: a declarative alias table maps each
//! canonical field to a set of accepted column-name synonyms. Lookup is
//! case- and punctuation-insensitive ("E-mail", "email_address", and
//! "Email Address" all reach `email`), first matching column wins, and
//! unmapped optional fields stay empty. Matching logic never touches the
//! parsing code, so it is testable against plain records.

use std::collections::BTreeMap;

use crate::error::SchemaError;
use crate::models::{LeadRow, RawRecord};

/// Canonical text fields in their fixed concatenation order.
///
/// This order is load-bearing: `text_concat` is both the FTS-indexed text
/// and the embedding input, so it must be deterministic across runs.
pub const TEXT_FIELD_ORDER: [&str; 11] = [
    "name", "username", "bio", "category", "website", "email", "phone", "title", "city", "company",
    "domain",
];

/// Built-in synonyms per canonical field, stored pre-normalized (lowercase,
/// alphanumeric only). Dataset-specific additions are merged on top.
const DEFAULT_ALIASES: &[(&str, &[&str])] = &[
    ("name", &["name", "fullname", "contactname", "leadname"]),
    ("username", &["username", "handle", "user", "screenname"]),
    ("bio", &["bio", "description", "about", "summary"]),
    ("category", &["category", "industry", "sector", "niche"]),
    ("website", &["website", "url", "site", "web", "homepage"]),
    ("email", &["email", "emailaddress", "mail", "emailfirst"]),
    (
        "phone",
        &["phone", "phonenumber", "mobile", "tel", "telephone"],
    ),
    ("title", &["title", "jobtitle", "position", "role"]),
    ("city", &["city", "town", "locality"]),
    (
        "company",
        &[
            "company",
            "companyname",
            "employer",
            "organization",
            "organisation",
        ],
    ),
    ("domain", &["domain", "companydomain", "websitedomain"]),
    (
        "follower_count",
        &["followercount", "followers", "followerstotal"],
    ),
    (
        "following_count",
        &["followingcount", "following", "followingtotal"],
    ),
];

/// Alias table consulted by [`Normalizer`]: normalized synonym → canonical
/// field name.
#[derive(Debug, Clone)]
pub struct AliasTable {
    synonyms: BTreeMap<String, &'static str>,
}

impl AliasTable {
    /// Built-in aliases plus per-dataset extras from config. Extra synonyms
    /// for unknown canonical fields are ignored.
    pub fn with_extras(extras: &BTreeMap<String, Vec<String>>) -> Self {
        let mut synonyms = BTreeMap::new();
        for (field, names) in DEFAULT_ALIASES {
            for name in *names {
                synonyms.insert((*name).to_string(), *field);
            }
        }
        for (field, names) in extras {
            let Some(canonical) = DEFAULT_ALIASES
                .iter()
                .map(|(f, _)| *f)
                .find(|f| *f == field.as_str())
            else {
                continue;
            };
            for name in names {
                synonyms.insert(normalize_column_name(name), canonical);
            }
        }
        Self { synonyms }
    }

    pub fn resolve(&self, column_name: &str) -> Option<&'static str> {
        self.synonyms
            .get(&normalize_column_name(column_name))
            .copied()
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::with_extras(&BTreeMap::new())
    }
}

/// Lowercase a column header and drop everything but letters and digits.
fn normalize_column_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Parse a count leniently: strip thousands separators, accept integral
/// floats ("1234.0"), treat empty and garbage as null.
fn parse_count(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(n) = cleaned.parse::<i64>() {
        return Some(n);
    }
    match cleaned.parse::<f64>() {
        Ok(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Some(f as i64),
        _ => None,
    }
}

fn clean(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Normalizes raw records against an alias table.
#[derive(Debug, Clone)]
pub struct Normalizer {
    aliases: AliasTable,
    required_fields: Vec<String>,
}

impl Normalizer {
    pub fn new(aliases: AliasTable, required_fields: Vec<String>) -> Self {
        Self {
            aliases,
            required_fields,
        }
    }

    /// Map one raw record to a canonical row.
    ///
    /// First matching column wins per canonical field. Missing optional
    /// fields are `None`; a missing required field or an empty `text_concat`
    /// is a [`SchemaError`] and the row is skipped by the caller.
    pub fn normalize(
        &self,
        dataset: &str,
        source_file: &str,
        raw: &RawRecord,
    ) -> Result<LeadRow, SchemaError> {
        let mut mapped: BTreeMap<&'static str, String> = BTreeMap::new();
        for (column, value) in &raw.columns {
            let Some(field) = self.aliases.resolve(column) else {
                continue;
            };
            if mapped.contains_key(field) {
                continue;
            }
            if let Some(v) = clean(value) {
                mapped.insert(field, v);
            }
        }

        for required in &self.required_fields {
            if !mapped.contains_key(required.as_str()) {
                return Err(SchemaError::MissingRequired(required.clone()));
            }
        }

        let mut row = LeadRow {
            dataset: dataset.to_string(),
            source_file: source_file.to_string(),
            name: mapped.remove("name"),
            username: mapped.remove("username"),
            bio: mapped.remove("bio"),
            category: mapped.remove("category"),
            website: mapped.remove("website"),
            email: mapped.remove("email"),
            phone: mapped.remove("phone"),
            title: mapped.remove("title"),
            city: mapped.remove("city"),
            company: mapped.remove("company"),
            domain: mapped.remove("domain"),
            follower_count: mapped
                .remove("follower_count")
                .as_deref()
                .and_then(parse_count),
            following_count: mapped
                .remove("following_count")
                .as_deref()
                .and_then(parse_count),
            ..Default::default()
        };

        row.text_concat = text_concat(&row);
        if row.text_concat.is_empty() {
            return Err(SchemaError::EmptyRow);
        }

        Ok(row)
    }
}

/// Join the non-empty text fields in canonical order with single spaces.
pub fn text_concat(row: &LeadRow) -> String {
    TEXT_FIELD_ORDER
        .iter()
        .filter_map(|field| match *field {
            "name" => row.name.as_deref(),
            "username" => row.username.as_deref(),
            "bio" => row.bio.as_deref(),
            "category" => row.category.as_deref(),
            "website" => row.website.as_deref(),
            "email" => row.email.as_deref(),
            "phone" => row.phone.as_deref(),
            "title" => row.title.as_deref(),
            "city" => row.city.as_deref(),
            "company" => row.company.as_deref(),
            "domain" => row.domain.as_deref(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cols: &[(&str, &str)]) -> RawRecord {
        RawRecord::new(
            cols.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(AliasTable::default(), Vec::new())
    }

    #[test]
    fn maps_renamed_columns_case_and_punctuation_insensitive() {
        let raw = record(&[
            ("Full Name", "Ada Lovelace"),
            ("Employer", "Analytical Engines"),
            ("E-mail", "ada@example.com"),
        ]);
        let row = normalizer().normalize("ds", "leads.csv", &raw).unwrap();
        assert_eq!(row.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(row.company.as_deref(), Some("Analytical Engines"));
        assert_eq!(row.email.as_deref(), Some("ada@example.com"));
        assert_eq!(row.title, None);
        assert_eq!(row.city, None);
    }

    #[test]
    fn first_matching_column_wins() {
        let raw = record(&[
            ("website", "https://first.example"),
            ("url", "https://second.example"),
        ]);
        let row = normalizer().normalize("ds", "f", &raw).unwrap();
        assert_eq!(row.website.as_deref(), Some("https://first.example"));
    }

    #[test]
    fn numeric_parsing_is_lenient() {
        assert_eq!(parse_count("12,345"), Some(12345));
        assert_eq!(parse_count("1234.0"), Some(1234));
        assert_eq!(parse_count("1 234"), Some(1234));
        assert_eq!(parse_count(""), None);
        assert_eq!(parse_count("a lot"), None);
        assert_eq!(parse_count("12.5"), None);
    }

    #[test]
    fn unparseable_count_nulls_field_without_failing_row() {
        let raw = record(&[("Name", "Ada"), ("Followers", "n/a")]);
        let row = normalizer().normalize("ds", "f", &raw).unwrap();
        assert_eq!(row.follower_count, None);
        assert_eq!(row.name.as_deref(), Some("Ada"));
    }

    #[test]
    fn text_concat_uses_canonical_field_order() {
        let raw = record(&[
            ("phone", "+49 89 1234"),
            ("name", "Ada"),
            ("city", "Munich"),
            ("title", "Architect"),
        ]);
        let row = normalizer().normalize("ds", "f", &raw).unwrap();
        // name < phone < title < city regardless of input column order
        assert_eq!(row.text_concat, "Ada +49 89 1234 Architect Munich");
    }

    #[test]
    fn missing_required_field_is_schema_error() {
        let n = Normalizer::new(AliasTable::default(), vec!["email".to_string()]);
        let raw = record(&[("Name", "Ada")]);
        assert_eq!(
            n.normalize("ds", "f", &raw),
            Err(SchemaError::MissingRequired("email".to_string()))
        );
    }

    #[test]
    fn empty_row_is_schema_error() {
        let raw = record(&[("Followers", "10"), ("Unknown Column", "x")]);
        assert_eq!(
            normalizer().normalize("ds", "f", &raw),
            Err(SchemaError::EmptyRow)
        );
    }

    #[test]
    fn dataset_aliases_extend_the_table() {
        let mut extras = BTreeMap::new();
        extras.insert("company".to_string(), vec!["Arbeitgeber".to_string()]);
        let n = Normalizer::new(AliasTable::with_extras(&extras), Vec::new());
        let raw = record(&[("Arbeitgeber", "Siemens")]);
        let row = n.normalize("ds", "f", &raw).unwrap();
        assert_eq!(row.company.as_deref(), Some("Siemens"));
    }
}
