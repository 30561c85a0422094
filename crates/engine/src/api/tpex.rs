//! TPEx endpoints: OTC margin balances (OpenAPI latest and the dated
//! `margin_bal_result` report) and the OTC company list.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

use super::http::get_json;
use super::twse::parse_margin_objects;
use crate::error::{EngineError, EngineResult};
use crate::ratio::MarginField;
use crate::schema::{parse_number, FieldSpec, RawTable, TableSchema};
use crate::sources::{DatedSource, FetchOutcome, Source};
use crate::types::{MarginRow, Market};
use crate::universe::{entries_from_table, normalize_symbol, UniverseEntry};

const OPENAPI_BASE: &str = "https://www.tpex.org.tw/openapi/v1";
const MARGIN_REPORT_URL: &str =
    "https://www.tpex.org.tw/web/stock/margin_trading/margin_balance/margin_bal_result.php";

/// Positional columns of `aaData` rows in the dated report
const COL_SYMBOL: usize = 0;
const COL_MARGIN: usize = 2;
const COL_SHORT: usize = 4;

pub const TPEX_MARGIN_SCHEMA: TableSchema<MarginField> = TableSchema {
    name: "tpex-margin",
    fields: &[
        FieldSpec {
            field: MarginField::Symbol,
            aliases: &[&["SecuritiesCompanyCode"], &["股票代號"], &["證券代號"], &["代號"], &["Code"]],
            required: true,
        },
        FieldSpec {
            field: MarginField::MarginPrev,
            aliases: &[&["MarginPurchaseBalancePreviousDay"], &["前資餘額"], &["融資前日餘額"]],
            required: false,
        },
        FieldSpec {
            field: MarginField::MarginBalance,
            aliases: &[
                &["MarginPurchaseBalance"],
                &["資餘額"],
                &["融資今日餘額"],
                &["融資餘額"],
                &["Margin", "Balance"],
            ],
            required: true,
        },
        FieldSpec {
            field: MarginField::ShortBuy,
            aliases: &[&["ShortCovering"], &["券買進"], &["融券買進"]],
            required: false,
        },
        FieldSpec {
            field: MarginField::ShortSell,
            aliases: &[&["ShortSale"], &["券賣出"], &["融券賣出"]],
            required: false,
        },
        FieldSpec {
            field: MarginField::ShortRepay,
            aliases: &[&["StockRedemption"], &["券償還"], &["融券現券償還"]],
            required: false,
        },
        FieldSpec {
            field: MarginField::ShortPrev,
            aliases: &[&["ShortSaleBalancePreviousDay"], &["前券餘額"], &["融券前日餘額"]],
            required: false,
        },
        FieldSpec {
            field: MarginField::ShortBalance,
            aliases: &[
                &["ShortSaleBalance"],
                &["券餘額"],
                &["融券今日餘額"],
                &["融券餘額"],
                &["Short", "Balance"],
            ],
            required: false,
        },
    ],
};

/// `yyy/mm/dd` with the ROC year (Gregorian − 1911)
pub fn roc_date(date: NaiveDate) -> String {
    format!("{}/{:02}/{:02}", date.year() - 1911, date.month(), date.day())
}

/// Positional rows from the dated report: `aaData`, `data`, or the first
/// entry of `tables`. Rows shorter than five cells are skipped.
pub fn parse_dated_margin_report(payload: &Value) -> Vec<MarginRow> {
    let data = payload
        .get("aaData")
        .or_else(|| payload.get("data"))
        .and_then(|d| d.as_array())
        .or_else(|| {
            payload
                .get("tables")
                .and_then(|t| t.as_array())
                .and_then(|t| t.first())
                .and_then(|t| t.get("data"))
                .and_then(|d| d.as_array())
        });
    let Some(data) = data else {
        return Vec::new();
    };

    let cell = |row: &[Value], idx: usize| -> Option<String> {
        row.get(idx).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    };

    data.iter()
        .filter_map(|row| row.as_array())
        .filter(|row| row.len() > COL_SHORT)
        .filter_map(|row| {
            let symbol = cell(row, COL_SYMBOL).as_deref().and_then(normalize_symbol)?;
            Some(MarginRow {
                symbol,
                market: Market::Secondary,
                margin_balance: cell(row, COL_MARGIN).as_deref().and_then(parse_number),
                short_balance: cell(row, COL_SHORT).as_deref().and_then(parse_number),
            })
        })
        .collect()
}

// ============================================================================
// Sources
// ============================================================================

/// OpenAPI `tpex_mainboard_margin_balance`: latest day, no date parameter
pub struct TpexLatestMargin {
    client: Client,
}

impl TpexLatestMargin {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Source<Vec<MarginRow>> for TpexLatestMargin {
    fn name(&self) -> &str {
        "tpex-openapi-margin-balance"
    }

    async fn fetch(&self, _target: NaiveDate) -> FetchOutcome<Vec<MarginRow>> {
        let url = format!("{}/tpex_mainboard_margin_balance", OPENAPI_BASE);
        let result = async {
            let payload = get_json(&self.client, self.name(), &url).await?;
            parse_margin_objects(&payload, &TPEX_MARGIN_SCHEMA, Market::Secondary)
        }
        .await;
        if let Ok(rows) = &result {
            info!(rows = rows.len(), "TPEx OpenAPI margin loaded");
        }
        result.into()
    }
}

/// Dated `margin_bal_result` report
pub struct TpexDatedMargin {
    client: Client,
}

impl TpexDatedMargin {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fetch_report(&self, date: NaiveDate) -> EngineResult<Vec<MarginRow>> {
        let url = format!("{}?l=zh-tw&o=json&d={}&s=0,asc", MARGIN_REPORT_URL, roc_date(date));
        let payload = get_json(&self.client, self.name(), &url).await?;
        let rows = parse_dated_margin_report(&payload);
        debug!(%date, rows = rows.len(), "TPEx dated report parsed");
        Ok(rows)
    }
}

#[async_trait]
impl DatedSource<Vec<MarginRow>> for TpexDatedMargin {
    fn name(&self) -> &str {
        "tpex-margin-bal-result"
    }

    async fn fetch_on(&self, date: NaiveDate) -> FetchOutcome<Vec<MarginRow>> {
        self.fetch_report(date).await.into()
    }
}

/// OpenAPI company profile list for OTC issuers
pub struct TpexUniverse {
    client: Client,
}

impl TpexUniverse {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Source<Vec<UniverseEntry>> for TpexUniverse {
    fn name(&self) -> &str {
        "tpex-company-list"
    }

    async fn fetch(&self, _target: NaiveDate) -> FetchOutcome<Vec<UniverseEntry>> {
        let url = format!("{}/mopsfin_t187ap03_L", OPENAPI_BASE);
        let result = async {
            let payload = get_json(&self.client, self.name(), &url).await?;
            let items = payload
                .as_array()
                .ok_or_else(|| EngineError::Parse("tpex company list: expected an array".into()))?;
            Ok::<_, EngineError>(entries_from_table(&RawTable::from_json_objects(items), Market::Secondary))
        }
        .await;
        result.into()
    }
}
