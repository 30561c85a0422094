//! HTTP adapters for the upstream market-data endpoints

pub mod http;
pub mod tpex;
pub mod twse;
pub mod yahoo;

pub use http::{build_client, retry_rate_limited};
pub use tpex::{TpexDatedMargin, TpexLatestMargin, TpexUniverse};
pub use twse::{IsinUniverse, OfficialShares, TwseDatedMargin, TwseLatestMargin, TwseUniverse};
pub use yahoo::YahooClient;
