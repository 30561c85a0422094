//! Shared HTTP plumbing: client construction, status checks, rate-limit retry

use rand::Rng;
use reqwest::{Client, Response};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::error::{EngineError, EngineResult};

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) squeeze-screener";

/// Build the client every adapter shares
pub fn build_client(config: &FetchConfig) -> EngineResult<Client> {
    let client = Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(!config.ssl_verify)
        .build()?;
    Ok(client)
}

/// Turn a non-success response into an error, mapping 429 to `RateLimited`
pub async fn check_status(source: &str, response: Response) -> EngineResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 429 {
        return Err(EngineError::RateLimited(source.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    debug!(source, status = status.as_u16(), body = %body.chars().take(200).collect::<String>(), "Upstream error body");
    Err(EngineError::Status {
        source_name: source.to_string(),
        status: status.as_u16(),
    })
}

/// GET `url` and return the body, decoded with `charset` when given
pub async fn get_text(
    client: &Client,
    source: &str,
    url: &str,
    charset: Option<&str>,
) -> EngineResult<String> {
    let response = check_status(source, client.get(url).send().await?).await?;
    let text = match charset {
        Some(cs) => response.text_with_charset(cs).await?,
        None => response.text().await?,
    };
    Ok(text)
}

pub async fn get_json(client: &Client, source: &str, url: &str) -> EngineResult<serde_json::Value> {
    let text = get_text(client, source, url, None).await?;
    let text = text.trim_start_matches('\u{feff}');
    serde_json::from_str(text)
        .map_err(|e| EngineError::Parse(format!("{}: invalid JSON ({})", source, e)))
}

/// Whether an error body or message signals throttling
pub fn looks_rate_limited(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("too many requests") || lower.contains("rate limited")
}

/// Run `op` and retry only on `RateLimited`, sleeping `base × attempt`
/// seconds plus up to 500 ms of jitter between attempts.
pub async fn retry_rate_limited<T, F, Fut>(
    label: &str,
    max_attempts: u32,
    backoff_base_secs: f64,
    mut op: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(EngineError::RateLimited(src)) if attempt < max_attempts => {
                let jitter_ms = rand::thread_rng().gen_range(0..=500u64);
                let wait = Duration::from_secs_f64(backoff_base_secs.max(0.0) * attempt as f64)
                    + Duration::from_millis(if backoff_base_secs > 0.0 { jitter_ms } else { 0 });
                warn!(label, source = %src, attempt, wait_ms = wait.as_millis() as u64, "Rate limited, backing off");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_looks_rate_limited() {
        assert!(looks_rate_limited("Error: Too Many Requests"));
        assert!(looks_rate_limited("YFRateLimitError: Rate limited. Try after a while."));
        assert!(!looks_rate_limited("Not Found"));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_rate_limited("t", 4, 0.0, move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(EngineError::RateLimited("yahoo".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_rate_limited() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: EngineResult<()> = retry_rate_limited("t", 4, 0.0, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::RateLimited("yahoo".into()))
        })
        .await;
        assert!(matches!(result, Err(EngineError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: EngineResult<()> = retry_rate_limited("t", 4, 0.0, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Parse("bad".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
