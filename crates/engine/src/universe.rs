//! Reference universe: which (symbol, market) pairs exist and their names

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::schema::{FieldSpec, RawTable, TableSchema};
use crate::sources::FallbackChain;
use crate::types::{Market, SecurityKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseEntry {
    pub symbol: String,
    pub market: Market,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniverseField {
    Symbol,
    Name,
}

pub const UNIVERSE_SCHEMA: TableSchema<UniverseField> = TableSchema {
    name: "universe",
    fields: &[
        FieldSpec {
            field: UniverseField::Symbol,
            aliases: &[
                &["Code"],
                &["SecuritiesCompanyCode"],
                &["證券代號"],
                &["股票代號"],
                &["公司代號"],
                &["代號"],
            ],
            required: true,
        },
        FieldSpec {
            field: UniverseField::Name,
            aliases: &[
                &["Name"],
                &["CompanyName"],
                &["證券名稱"],
                &["公司簡稱"],
                &["公司名稱"],
                &["名稱"],
            ],
            required: false,
        },
    ],
};

/// Normalize a raw code to the 4-digit form: exchange suffix stripped,
/// short numeric codes zero-padded, anything else rejected.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches('"').trim();
    let upper = trimmed.to_ascii_uppercase();
    let base = upper
        .strip_suffix(".TWO")
        .or_else(|| upper.strip_suffix(".TW"))
        .unwrap_or(&upper)
        .trim();
    // numeric cells sometimes arrive as "50.0"
    let base = base.strip_suffix(".0").unwrap_or(base);
    if base.is_empty() || !base.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match base.len() {
        1..=3 => Some(format!("{:0>4}", base)),
        4 => Some(base.to_string()),
        _ => None,
    }
}

/// Entries from a resolved universe table
pub fn entries_from_table(table: &RawTable, market: Market) -> Vec<UniverseEntry> {
    let Ok(cols) = table.columns(&UNIVERSE_SCHEMA) else {
        return Vec::new();
    };
    table
        .rows
        .iter()
        .filter_map(|row| {
            let symbol = cols.cell(row, UniverseField::Symbol).and_then(normalize_symbol)?;
            let name = cols.cell(row, UniverseField::Name).map(|s| s.to_string());
            Some(UniverseEntry { symbol, market, name })
        })
        .collect()
}

fn isin_cell_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<td[^>]*>\s*(\d{4,6})[\s\x{3000}]+([^<]+?)\s*</td>").expect("valid regex")
    })
}

fn bare_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4,6})\b").expect("valid regex"))
}

/// Parse the ISIN listing page. Cells read `CODE<fullwidth space>NAME`;
/// when no cell matches (garbled encoding, layout change) every standalone
/// 4–6 digit run is taken as a code without a name.
pub fn parse_isin_page(html: &str, market: Market) -> Vec<UniverseEntry> {
    let mut seen: BTreeMap<String, Option<String>> = BTreeMap::new();

    for caps in isin_cell_regex().captures_iter(html) {
        if let Some(symbol) = normalize_symbol(&caps[1]).filter(|_| caps[1].len() == 4) {
            let name = caps[2].trim().to_string();
            seen.entry(symbol).or_insert(Some(name).filter(|n| !n.is_empty()));
        }
    }

    if seen.is_empty() {
        warn!(market = %market, "ISIN cells not recognized, falling back to bare code extraction");
        for caps in bare_code_regex().captures_iter(html) {
            if caps[1].len() == 4 {
                seen.entry(caps[1].to_string()).or_insert(None);
            }
        }
    }

    seen.into_iter()
        .map(|(symbol, name)| UniverseEntry { symbol, market, name })
        .collect()
}

/// Deduplicated universe plus the (symbol, market) → display name map
#[derive(Debug, Clone, Default)]
pub struct Universe {
    pub keys: Vec<SecurityKey>,
    pub names: HashMap<SecurityKey, String>,
}

impl Universe {
    pub fn from_entries(entries: impl IntoIterator<Item = UniverseEntry>) -> Self {
        let mut map: BTreeMap<SecurityKey, Option<String>> = BTreeMap::new();
        for e in entries {
            let slot = map.entry(SecurityKey::new(e.symbol, e.market)).or_insert(None);
            if slot.is_none() {
                *slot = e.name;
            }
        }
        let mut universe = Universe::default();
        for (key, name) in map {
            if let Some(n) = name {
                universe.names.insert(key.clone(), n);
            }
            universe.keys.push(key);
        }
        universe
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn name(&self, key: &SecurityKey) -> Option<&str> {
        self.names.get(key).map(|s| s.as_str())
    }
}

/// Build the universe from both market chains
pub async fn build_universe(
    primary: &FallbackChain<Vec<UniverseEntry>>,
    secondary: &FallbackChain<Vec<UniverseEntry>>,
    target: NaiveDate,
) -> Universe {
    let mut entries = Vec::new();
    for chain in [primary, secondary] {
        let outcome = chain.resolve(target, |rows| !rows.is_empty()).await;
        if let Some(rows) = outcome.data {
            entries.extend(rows);
        }
    }
    let universe = Universe::from_entries(entries);
    info!(
        count = universe.len(),
        named = universe.names.len(),
        "Universe built"
    );
    universe
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("2330"), Some("2330".to_string()));
        assert_eq!(normalize_symbol(" 2330.TW "), Some("2330".to_string()));
        assert_eq!(normalize_symbol("6488.two"), Some("6488".to_string()));
        assert_eq!(normalize_symbol("50"), Some("0050".to_string()));
        assert_eq!(normalize_symbol("50.0"), Some("0050".to_string()));
        assert_eq!(normalize_symbol("00878"), None);
        assert_eq!(normalize_symbol("2330A"), None);
        assert_eq!(normalize_symbol(""), None);
    }

    #[test]
    fn test_parse_isin_cells() {
        let html = "<tr><td bgcolor=#FAFAD2>1101\u{3000}台泥</td><td>TW0001101004</td></tr>\
                    <tr><td bgcolor=#FAFAD2>2330\u{3000}台積電</td></tr>\
                    <tr><td bgcolor=#FAFAD2>030001\u{3000}某權證</td></tr>";
        let entries = parse_isin_page(html, Market::Primary);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].symbol, "1101");
        assert_eq!(entries[0].name.as_deref(), Some("台泥"));
        assert_eq!(entries[1].symbol, "2330");
    }

    #[test]
    fn test_parse_isin_falls_back_to_bare_codes() {
        let garbled = "??? 2330 ??? 6488 ?? 123456 ?? 12 ?";
        let entries = parse_isin_page(garbled, Market::Secondary);
        let symbols: Vec<&str> = entries.iter().map(|e| e.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["2330", "6488"]);
        assert!(entries.iter().all(|e| e.name.is_none()));
    }

    #[test]
    fn test_universe_dedupes_and_keeps_first_name() {
        let universe = Universe::from_entries(vec![
            UniverseEntry { symbol: "2330".into(), market: Market::Primary, name: None },
            UniverseEntry { symbol: "2330".into(), market: Market::Primary, name: Some("TSMC".into()) },
            UniverseEntry { symbol: "2330".into(), market: Market::Secondary, name: None },
        ]);
        assert_eq!(universe.len(), 2);
        assert_eq!(universe.name(&SecurityKey::new("2330", Market::Primary)), Some("TSMC"));
        assert_eq!(universe.name(&SecurityKey::new("2330", Market::Secondary)), None);
    }

    #[test]
    fn test_entries_from_json_table() {
        let items: Vec<serde_json::Value> = serde_json::from_str(
            r#"[{"Code":"2330","Name":"台積電"},{"Code":"00878","Name":"ETF"},{"Code":"1101","Name":""}]"#,
        )
        .unwrap();
        let entries = entries_from_table(&RawTable::from_json_objects(&items), Market::Primary);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].symbol, "1101");
        assert_eq!(entries[1].name, None);
    }
}
