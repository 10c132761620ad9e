use serde_json::{Map, Value};
use std::fmt;

/// Fields kept per record on the HTTP path; later fields are dropped.
pub const MAX_HTTP_RECORD_FIELDS: usize = 4;

/// Returned by the SQL retriever when the table is empty.
pub const NO_DATA_SENTINEL: &str = "No data found.";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Null,
    /// Nested arrays and objects, kept as compact JSON
    Raw(String),
}

impl From<&Value> for FieldValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => FieldValue::Text(s.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(f) => FieldValue::Number(f),
                None => FieldValue::Raw(n.to_string()),
            },
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Null => FieldValue::Null,
            other => FieldValue::Raw(other.to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            // Shortest round-trip form: 0.51 stays 0.51, 1.0 prints as 1
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Null => f.write_str("null"),
            FieldValue::Raw(raw) => f.write_str(raw),
        }
    }
}

/// One row or array element, fields in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    /// Take at most `limit` properties of `object`, in encounter order.
    pub fn from_json_object(object: &Map<String, Value>, limit: usize) -> Self {
        object
            .iter()
            .take(limit)
            .fold(Self::new(), |record, (name, value)| {
                record.with_field(name.clone(), FieldValue::from(value))
            })
    }

    /// `name: value` lines joined by a single newline.
    pub fn format(&self) -> String {
        self.fields
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The unit handed to a sink: formatted records separated by blank lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormattedBatch(String);

impl FormattedBatch {
    pub fn from_records(records: &[Record]) -> Self {
        let text = records
            .iter()
            .map(Record::format)
            .collect::<Vec<_>>()
            .join("\n\n");

        Self(text)
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for FormattedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A SQL row reduced to the fixed contextual-data field set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextRow {
    pub country: Option<String>,
    pub viscosity: Option<f64>,
    pub sweetness: Option<f64>,
    pub particle_size: Option<f64>,
    pub overall: Option<f64>,
}

impl ContextRow {
    /// Single-line JSON-like rendering, e.g.
    /// `{ "country" : "uk" , "viscosity" : 0.51, ... }`.
    pub fn format(&self) -> String {
        let country = match &self.country {
            Some(country) => Value::String(country.clone()).to_string(),
            None => "null".to_string(),
        };

        format!(
            "{{ \"country\" : {country} , \"viscosity\" : {}, \"sweetness\" : {}, \"particle_size\" : {}, \"overall\" : {} }}",
            number(self.viscosity),
            number(self.sweetness),
            number(self.particle_size),
            number(self.overall),
        )
    }
}

fn number(value: Option<f64>) -> String {
    match value {
        Some(n) => n.to_string(),
        None => "null".to_string(),
    }
}

/// Rows joined by newlines, or the sentinel when there are none.
pub fn format_context_rows(rows: &[ContextRow]) -> FormattedBatch {
    if rows.is_empty() {
        return FormattedBatch::from_text(NO_DATA_SENTINEL);
    }

    let text = rows
        .iter()
        .map(ContextRow::format)
        .collect::<Vec<_>>()
        .join("\n");

    FormattedBatch::from_text(text)
}
