//! TWSE endpoints: margin balances (OpenAPI latest and the dated report),
//! the listed-company universe, the ISIN listing pages and the official
//! issued-shares CSVs.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::http::{get_json, get_text};
use crate::error::{EngineError, EngineResult};
use crate::ratio::{margin_rows, MarginField};
use crate::schema::{FieldSpec, RawTable, TableSchema};
use crate::sources::{DatedSource, FetchOutcome, Source};
use crate::types::{MarginRow, Market};
use crate::universe::{entries_from_table, normalize_symbol, parse_isin_page, UniverseEntry};

const OPENAPI_BASE: &str = "https://openapi.twse.com.tw/v1";
const WWW_BASE: &str = "https://www.twse.com.tw";
const ISIN_URL: &str = "https://isin.twse.com.tw/isin/C_public.jsp";
const MOPS_OPENDATA: &str = "https://mopsfin.twse.com.tw/opendata";

/// Header aliases for the TWSE margin tables. The dated report repeats bare
/// headers ("買進", "今日餘額", ...) for the margin and short halves; field
/// order makes the margin half claim them first.
pub const TWSE_MARGIN_SCHEMA: TableSchema<MarginField> = TableSchema {
    name: "twse-margin",
    fields: &[
        FieldSpec {
            field: MarginField::Symbol,
            aliases: &[&["股票代號"], &["證券代號"], &["證券代碼"], &["代號"]],
            required: true,
        },
        FieldSpec { field: MarginField::MarginBuy, aliases: &[&["融資買進"], &["買進"]], required: false },
        FieldSpec { field: MarginField::MarginSell, aliases: &[&["融資賣出"], &["賣出"]], required: false },
        FieldSpec {
            field: MarginField::MarginRepay,
            aliases: &[&["融資現金償還"], &["融資償還"], &["現金償還"]],
            required: false,
        },
        FieldSpec { field: MarginField::MarginPrev, aliases: &[&["融資前日餘額"], &["前日餘額"]], required: false },
        FieldSpec {
            field: MarginField::MarginBalance,
            aliases: &[&["融資今日餘額"], &["融資餘額"], &["今日餘額"], &["融資", "今日餘額"]],
            required: true,
        },
        FieldSpec { field: MarginField::ShortBuy, aliases: &[&["融券買進"], &["買進"]], required: false },
        FieldSpec { field: MarginField::ShortSell, aliases: &[&["融券賣出"], &["賣出"]], required: false },
        FieldSpec {
            field: MarginField::ShortRepay,
            aliases: &[&["融券現券償還"], &["融券償還"], &["現券償還"]],
            required: false,
        },
        FieldSpec { field: MarginField::ShortPrev, aliases: &[&["融券前日餘額"], &["前日餘額"]], required: false },
        FieldSpec {
            field: MarginField::ShortBalance,
            aliases: &[&["融券今日餘額"], &["融券餘額"], &["今日餘額"], &["融券", "今日餘額"]],
            required: false,
        },
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharesField {
    Symbol,
    Shares,
}

pub const SHARES_SCHEMA: TableSchema<SharesField> = TableSchema {
    name: "issued-shares",
    fields: &[
        FieldSpec {
            field: SharesField::Symbol,
            aliases: &[&["公司代號"], &["股票代號"], &["證券代號"], &["Security Code"], &["Company Code"], &["代號"]],
            required: true,
        },
        FieldSpec {
            field: SharesField::Shares,
            aliases: &[
                &["已發行普通股數或TDR原股發行股數"],
                &["已發行普通股數"],
                &["已發行股數"],
                &["發行股數"],
                &["Number of Shares"],
                &["已發行", "股"],
                &["發行", "股"],
            ],
            required: true,
        },
    ],
};

// ============================================================================
// Parsing
// ============================================================================

/// Rows from a flat JSON object array (OpenAPI), optionally wrapped in `{"data": [...]}`
pub fn parse_margin_objects(
    payload: &Value,
    schema: &TableSchema<MarginField>,
    market: Market,
) -> EngineResult<Vec<MarginRow>> {
    let items = match payload {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => obj
            .get("data")
            .and_then(|d| d.as_array())
            .map(|v| v.as_slice())
            .unwrap_or(&[]),
        _ => &[],
    };
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let table = RawTable::from_json_objects(items);
    let cols = table.columns(schema)?;
    Ok(margin_rows(&table, &cols, market))
}

/// Rows from the dated report. The stock table is either `fields`/`data` at
/// the top level or one entry of `tables`; the first one whose headers
/// resolve wins. A non-OK `stat` means no report for that day.
pub fn parse_dated_margin_json(payload: &Value) -> EngineResult<Vec<MarginRow>> {
    if let Some(stat) = payload.get("stat").and_then(|s| s.as_str()) {
        if !stat.to_uppercase().contains("OK") {
            debug!(stat, "TWSE report not available for date");
            return Ok(Vec::new());
        }
    }

    let mut candidates: Vec<(&Value, &Value)> = Vec::new();
    if let (Some(f), Some(d)) = (payload.get("fields"), payload.get("data")) {
        candidates.push((f, d));
    }
    if let Some(tables) = payload.get("tables").and_then(|t| t.as_array()) {
        for t in tables {
            if let (Some(f), Some(d)) = (t.get("fields"), t.get("data")) {
                candidates.push((f, d));
            }
        }
    }

    for (fields, data) in candidates {
        let (Some(fields), Some(data)) = (fields.as_array(), data.as_array()) else {
            continue;
        };
        let table = RawTable::from_fields_data(fields, data);
        if table.is_empty() {
            continue;
        }
        if let Ok(cols) = table.columns(&TWSE_MARGIN_SCHEMA) {
            let rows = margin_rows(&table, &cols, Market::Primary);
            if !rows.is_empty() {
                return Ok(rows);
            }
        }
    }
    Ok(Vec::new())
}

/// Rows from the CSV rendition of the dated report. Cells are sometimes
/// written as `="0050"`.
pub fn parse_margin_csv(text: &str) -> EngineResult<Vec<MarginRow>> {
    let cleaned = text.replace("=\"", "\"");
    let table = RawTable::from_csv_text(&cleaned, &TWSE_MARGIN_SCHEMA)?;
    let cols = table.columns(&TWSE_MARGIN_SCHEMA)?;
    Ok(margin_rows(&table, &cols, Market::Primary))
}

/// Issued shares per 4-digit code. Non-positive counts are dropped.
pub fn parse_shares_csv(text: &str) -> EngineResult<HashMap<String, f64>> {
    let head: String = text.chars().take(200).collect::<String>().to_lowercase();
    if head.contains("<html") || head.contains("<!doctype") {
        return Err(EngineError::Parse("issued-shares: got an HTML page".into()));
    }
    let table = RawTable::from_csv_text(text, &SHARES_SCHEMA)?;
    let cols = table.columns(&SHARES_SCHEMA)?;
    Ok(table
        .rows
        .iter()
        .filter_map(|row| {
            let symbol = cols.cell(row, SharesField::Symbol).and_then(normalize_symbol)?;
            let shares = cols.number(row, SharesField::Shares).filter(|s| *s > 0.0)?;
            Some((symbol, shares))
        })
        .collect())
}

// ============================================================================
// Margin sources
// ============================================================================

/// OpenAPI `MI_MARGN`: latest trading day only, ignores the target date
pub struct TwseLatestMargin {
    client: Client,
    attempts: u32,
}

impl TwseLatestMargin {
    pub fn new(client: Client, attempts: u32) -> Self {
        Self { client, attempts: attempts.max(1) }
    }
}

#[async_trait]
impl Source<Vec<MarginRow>> for TwseLatestMargin {
    fn name(&self) -> &str {
        "twse-openapi-mi-margn"
    }

    async fn fetch(&self, _target: NaiveDate) -> FetchOutcome<Vec<MarginRow>> {
        let url = format!("{}/exchangeReport/MI_MARGN", OPENAPI_BASE);
        let mut last_reason = String::from("empty payload");
        for attempt in 1..=self.attempts {
            let result = async {
                let payload = get_json(&self.client, self.name(), &url).await?;
                parse_margin_objects(&payload, &TWSE_MARGIN_SCHEMA, Market::Primary)
            }
            .await;
            match result {
                Ok(rows) if !rows.is_empty() => {
                    info!(rows = rows.len(), "TWSE OpenAPI margin loaded");
                    return FetchOutcome::Success(rows);
                }
                Ok(_) => last_reason = "empty payload".into(),
                Err(e) => {
                    warn!(attempt, error = %e, "TWSE OpenAPI margin fetch failed");
                    last_reason = e.to_string();
                }
            }
        }
        FetchOutcome::Unavailable(last_reason)
    }
}

/// Dated `MI_MARGN` report, JSON first and CSV for the same date
pub struct TwseDatedMargin {
    client: Client,
}

impl TwseDatedMargin {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn url(date: NaiveDate, response: &str) -> String {
        format!(
            "{}/exchangeReport/MI_MARGN?response={}&date={}&selectType=ALL",
            WWW_BASE,
            response,
            date.format("%Y%m%d")
        )
    }

    async fn fetch_json(&self, date: NaiveDate) -> EngineResult<Vec<MarginRow>> {
        let payload = get_json(&self.client, self.name(), &Self::url(date, "json")).await?;
        parse_dated_margin_json(&payload)
    }

    async fn fetch_csv(&self, date: NaiveDate) -> EngineResult<Vec<MarginRow>> {
        let text = get_text(&self.client, self.name(), &Self::url(date, "csv"), Some("big5")).await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        parse_margin_csv(&text)
    }
}

#[async_trait]
impl DatedSource<Vec<MarginRow>> for TwseDatedMargin {
    fn name(&self) -> &str {
        "twse-mi-margn"
    }

    async fn fetch_on(&self, date: NaiveDate) -> FetchOutcome<Vec<MarginRow>> {
        match self.fetch_json(date).await {
            Ok(rows) if !rows.is_empty() => return FetchOutcome::Success(rows),
            Ok(_) => debug!(%date, "TWSE JSON report empty, trying CSV"),
            Err(e) => debug!(%date, error = %e, "TWSE JSON report failed, trying CSV"),
        }
        self.fetch_csv(date).await.into()
    }
}

// ============================================================================
// Universe sources
// ============================================================================

/// OpenAPI `STOCK_DAY_ALL`: every listed security that traded
pub struct TwseUniverse {
    client: Client,
}

impl TwseUniverse {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Source<Vec<UniverseEntry>> for TwseUniverse {
    fn name(&self) -> &str {
        "twse-stock-day-all"
    }

    async fn fetch(&self, _target: NaiveDate) -> FetchOutcome<Vec<UniverseEntry>> {
        let url = format!("{}/exchangeReport/STOCK_DAY_ALL", OPENAPI_BASE);
        let result = async {
            let payload = get_json(&self.client, self.name(), &url).await?;
            let items = payload
                .as_array()
                .ok_or_else(|| EngineError::Parse("STOCK_DAY_ALL: expected an array".into()))?;
            Ok::<_, EngineError>(entries_from_table(&RawTable::from_json_objects(items), Market::Primary))
        }
        .await;
        result.into()
    }
}

/// ISIN listing page (`strMode=2` listed, `strMode=4` OTC), big5 encoded
pub struct IsinUniverse {
    client: Client,
    market: Market,
}

impl IsinUniverse {
    pub fn new(client: Client, market: Market) -> Self {
        Self { client, market }
    }

    fn str_mode(&self) -> u8 {
        match self.market {
            Market::Primary => 2,
            Market::Secondary => 4,
        }
    }
}

#[async_trait]
impl Source<Vec<UniverseEntry>> for IsinUniverse {
    fn name(&self) -> &str {
        match self.market {
            Market::Primary => "isin-listed",
            Market::Secondary => "isin-otc",
        }
    }

    async fn fetch(&self, _target: NaiveDate) -> FetchOutcome<Vec<UniverseEntry>> {
        let url = format!("{}?strMode={}", ISIN_URL, self.str_mode());
        match get_text(&self.client, self.name(), &url, Some("big5")).await {
            Ok(html) => FetchOutcome::Success(parse_isin_page(&html, self.market)),
            Err(e) => FetchOutcome::Unavailable(e.to_string()),
        }
    }
}

// ============================================================================
// Issued shares
// ============================================================================

/// Official `t187ap03_L` (listed) and `t187ap03_O` (OTC) company profiles
pub struct OfficialShares {
    client: Client,
}

impl OfficialShares {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Source<HashMap<String, f64>> for OfficialShares {
    fn name(&self) -> &str {
        "official-shares"
    }

    async fn fetch(&self, _target: NaiveDate) -> FetchOutcome<HashMap<String, f64>> {
        let mut shares = HashMap::new();
        let mut errors = Vec::new();
        for (tag, file) in [("listed", "t187ap03_L.csv"), ("otc", "t187ap03_O.csv")] {
            let url = format!("{}/{}", MOPS_OPENDATA, file);
            let result = async {
                let text = get_text(&self.client, self.name(), &url, None).await?;
                parse_shares_csv(&text)
            }
            .await;
            match result {
                Ok(map) => {
                    info!(tag, count = map.len(), "Issued shares loaded");
                    shares.extend(map);
                }
                Err(e) => {
                    warn!(tag, error = %e, "Issued shares fetch failed");
                    errors.push(format!("{}: {}", tag, e));
                }
            }
        }
        if shares.is_empty() {
            FetchOutcome::Unavailable(errors.join("; "))
        } else {
            FetchOutcome::Success(shares)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratio::tag_row;
    use crate::types::RatioStatus;

    #[test]
    fn test_openapi_payload_derives_missing_short_balance() {
        let payload: Value = serde_json::from_str(
            r#"[
                {"股票代號":"2330","股票名稱":"台積電","融資買進":"100","融資賣出":"50","融資現金償還":"0",
                 "融資前日餘額":"1,950","融資今日餘額":"2,000","融券買進":"5","融券賣出":"30",
                 "融券現券償還":"5","融券前日餘額":"400"},
                {"股票代號":"0050","股票名稱":"元大台灣50","融資今日餘額":"0","融券前日餘額":"10"}
            ]"#,
        )
        .unwrap();
        let rows = parse_margin_objects(&payload, &TWSE_MARGIN_SCHEMA, Market::Primary).unwrap();
        assert_eq!(rows.len(), 2);
        // 400 + 30 - 5 - 5
        assert_eq!(rows[0].short_balance, Some(420.0));
        assert_eq!(rows[0].margin_balance, Some(2000.0));
        assert_eq!(tag_row(&rows[1]).0, RatioStatus::Div0);
    }

    #[test]
    fn test_dated_report_repeated_headers() {
        let payload: Value = serde_json::from_str(
            r#"{
                "stat": "OK",
                "tables": [
                    {"title": "信用交易統計", "fields": ["項目","買進","賣出","現金(券)償還","前日餘額","今日餘額"],
                     "data": [["融資(交易單位)","1","2","3","4","5"]]},
                    {"title": "融資融券彙總",
                     "fields": ["代號","名稱","買進","賣出","現金償還","前日餘額","今日餘額","次一營業日限額",
                                "買進","賣出","現券償還","前日餘額","今日餘額","次一營業日限額","資券互抵","註記"],
                     "data": [["1101","台泥","10","20","0","5,000","4,990","0","1","2","0","300","301","0","0",""]]}
                ]
            }"#,
        )
        .unwrap();
        let rows = parse_dated_margin_json(&payload).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "1101");
        assert_eq!(rows[0].margin_balance, Some(4990.0));
        assert_eq!(rows[0].short_balance, Some(301.0));
    }

    #[test]
    fn test_dated_report_non_ok_stat_is_empty() {
        let payload: Value = serde_json::from_str(r#"{"stat":"很抱歉，沒有符合條件的資料!"}"#).unwrap();
        assert!(parse_dated_margin_json(&payload).unwrap().is_empty());
    }

    #[test]
    fn test_margin_csv_with_preamble_and_formula_cells() {
        let text = "\"113年05月02日 融資融券彙總 (全部)\"\n\
                    \"項目\",\"買進\",\"賣出\",\"現金(券)償還\",\"前日餘額\",\"今日餘額\"\n\
                    \"融資(交易單位)\",\"1\",\"2\",\"3\",\"4\",\"5\"\n\
                    \"股票代號\",\"股票名稱\",\"融資買進\",\"融資賣出\",\"融資現金償還\",\"融資前日餘額\",\"融資今日餘額\",\"融券買進\",\"融券賣出\",\"融券現券償還\",\"融券前日餘額\",\"融券今日餘額\"\n\
                    =\"0050\",\"元大台灣50\",\"1\",\"1\",\"0\",\"1,000\",\"1,000\",\"0\",\"0\",\"0\",\"80\",\"80\"\n\
                    \"說明:\"\n";
        let rows = parse_margin_csv(text).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "0050");
        assert_eq!(rows[0].short_balance, Some(80.0));
    }

    #[test]
    fn test_parse_shares_csv() {
        let text = "出表日期,公司代號,公司名稱,已發行普通股數或TDR原股發行股數\n\
                    1130502,2330,台積電,\"25,932,070,019\"\n\
                    1130502,1101,台泥,0\n";
        let shares = parse_shares_csv(text).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares["2330"], 25_932_070_019.0);
    }

    #[test]
    fn test_parse_shares_rejects_html() {
        assert!(parse_shares_csv("<!DOCTYPE html><html>maintenance</html>").is_err());
    }
}
