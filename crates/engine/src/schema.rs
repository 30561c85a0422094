//! Declarative column resolution for upstream tables
//!
//! Upstream endpoints publish the same logical fields under shifting header
//! names. Each source declares a [`TableSchema`]: an ordered alias list per
//! logical field. [`resolve_columns`] maps a header row onto that schema, so a
//! new header spelling is a one-line data change.
//!
//! An alias is a list of fragments. Resolution runs two passes:
//! exact match of the concatenated fragments first, then "header contains
//! every fragment" for fields still unresolved. A column is claimed by at
//! most one field.

use crate::error::{EngineError, EngineResult};
use serde_json::Value;

pub type Alias = &'static [&'static str];

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec<F: 'static> {
    pub field: F,
    pub aliases: &'static [Alias],
    pub required: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TableSchema<F: 'static> {
    pub name: &'static str,
    pub fields: &'static [FieldSpec<F>],
}

/// Resolved field → column index mapping
#[derive(Debug, Clone)]
pub struct ColumnMap<F> {
    columns: Vec<(F, usize)>,
}

impl<F: Copy + PartialEq> ColumnMap<F> {
    pub fn index(&self, field: F) -> Option<usize> {
        self.columns
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, i)| *i)
    }

    /// Raw cell text for `field`, trimmed, `None` when blank
    pub fn cell<'r>(&self, row: &'r [String], field: F) -> Option<&'r str> {
        let idx = self.index(field)?;
        row.get(idx)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    /// Numeric cell for `field` (see [`parse_number`])
    pub fn number(&self, row: &[String], field: F) -> Option<f64> {
        self.cell(row, field).and_then(parse_number)
    }
}

fn normalize_header(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('\u{feff}')
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{3000}')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Map `headers` onto `schema`. `None` when a required field is unresolved.
pub fn resolve_columns<F, H>(headers: &[H], schema: &TableSchema<F>) -> Option<ColumnMap<F>>
where
    F: Copy + PartialEq,
    H: AsRef<str>,
{
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h.as_ref())).collect();
    let mut claimed = vec![false; normalized.len()];
    let mut resolved: Vec<Option<usize>> = vec![None; schema.fields.len()];

    // Pass 1: exact
    for (fi, spec) in schema.fields.iter().enumerate() {
        'aliases: for alias in spec.aliases {
            let wanted = normalize_header(&alias.concat());
            for (ci, header) in normalized.iter().enumerate() {
                if !claimed[ci] && *header == wanted {
                    claimed[ci] = true;
                    resolved[fi] = Some(ci);
                    break 'aliases;
                }
            }
        }
    }

    // Pass 2: every fragment contained
    for (fi, spec) in schema.fields.iter().enumerate() {
        if resolved[fi].is_some() {
            continue;
        }
        'fragments: for alias in spec.aliases {
            let parts: Vec<String> = alias.iter().map(|p| normalize_header(p)).collect();
            for (ci, header) in normalized.iter().enumerate() {
                if !claimed[ci] && parts.iter().all(|p| header.contains(p.as_str())) {
                    claimed[ci] = true;
                    resolved[fi] = Some(ci);
                    break 'fragments;
                }
            }
        }
    }

    let mut columns = Vec::new();
    for (spec, idx) in schema.fields.iter().zip(resolved) {
        match idx {
            Some(i) => columns.push((spec.field, i)),
            None if spec.required => return None,
            None => {}
        }
    }
    Some(ColumnMap { columns })
}

/// Parse a numeric cell: thousands separators and `%` are stripped,
/// placeholder dashes and blanks are `None`.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ',' && *c != '%' && *c != '"' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '-') {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

// ============================================================================
// Raw tables
// ============================================================================

/// A header row plus string cells, the common shape every upstream format
/// is converted into before column resolution.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn value_to_cell(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl RawTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// From a JSON array of flat objects (OpenAPI style). Headers are the
    /// keys of the first object.
    pub fn from_json_objects(items: &[Value]) -> Self {
        let headers: Vec<String> = match items.iter().find_map(|v| v.as_object()) {
            Some(obj) => obj.keys().cloned().collect(),
            None => return Self::default(),
        };
        let rows = items
            .iter()
            .filter_map(|v| v.as_object())
            .map(|obj| {
                headers
                    .iter()
                    .map(|h| obj.get(h).map(value_to_cell).unwrap_or_default())
                    .collect()
            })
            .collect();
        Self { headers, rows }
    }

    /// From a `fields` header array and positional `data` rows
    pub fn from_fields_data(fields: &[Value], data: &[Value]) -> Self {
        let headers = fields.iter().map(value_to_cell).collect();
        let rows = data
            .iter()
            .filter_map(|r| r.as_array())
            .map(|r| r.iter().map(value_to_cell).collect())
            .collect();
        Self { headers, rows }
    }

    /// From CSV text whose header line may follow a preamble. The first
    /// record that resolves against `schema` is taken as the header; rows
    /// before it are dropped.
    pub fn from_csv_text<F: Copy + PartialEq>(
        text: &str,
        schema: &TableSchema<F>,
    ) -> EngineResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(text.trim_start_matches('\u{feff}').as_bytes());

        let mut headers: Option<Vec<String>> = None;
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let cells: Vec<String> = record.iter().map(|c| c.trim().to_string()).collect();
            match headers {
                None => {
                    if resolve_columns(&cells, schema).is_some() {
                        headers = Some(cells);
                    }
                }
                Some(_) => {
                    if cells.iter().any(|c| !c.is_empty()) {
                        rows.push(cells);
                    }
                }
            }
        }

        let headers = headers.ok_or_else(|| {
            EngineError::Parse(format!("{}: no header row matched the schema", schema.name))
        })?;
        Ok(Self { headers, rows })
    }

    /// Resolve against `schema`, or a parse error naming the schema
    pub fn columns<F: Copy + PartialEq>(&self, schema: &TableSchema<F>) -> EngineResult<ColumnMap<F>> {
        resolve_columns(&self.headers, schema).ok_or_else(|| {
            EngineError::Parse(format!(
                "{}: required columns missing in {:?}",
                schema.name, self.headers
            ))
        })
    }
}
