mod client;
mod basic;
mod rate_limit;
pub mod auth;

pub use client::HttpClient;
pub use basic::BasicClient;
pub use rate_limit::{RateLimiter, RateLimiterStatus};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use tracing::{debug, instrument};

use crate::config::ServiceConfig;
use crate::error::FetchError;
use auth::UrlParam;

pub const API_ENDPOINT: &str = "https://api.511.org/transit/StopMonitoring";
pub const API_KEY_PARAM: &str = "api_key";

/// Builds the production client: a timeout-bounded [`BasicClient`] that adds
/// the configured API key to every request.
pub fn connect(config: &ServiceConfig) -> reqwest::Result<UrlParam<BasicClient>> {
    let basic = BasicClient::new(config.request_timeout())?;
    Ok(UrlParam::new(basic, API_KEY_PARAM, config.api_key.clone()))
}

/// Issues one StopMonitoring request per call. Holds no per-stop state.
pub struct StopFetcher<C> {
    client: C,
    endpoint: String,
    agency: String,
    limiter: Arc<RateLimiter>,
}

impl<C: HttpClient> StopFetcher<C> {
    pub fn new(client: C, endpoint: impl Into<String>, agency: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            agency: agency.into(),
            limiter,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Request URL for one stop, without the API key.
    pub fn stop_url(&self, stop_code: &str) -> Result<Url, FetchError> {
        Url::parse_with_params(
            &self.endpoint,
            &[
                ("agency", self.agency.as_str()),
                ("stopcode", stop_code),
                ("format", "json"),
            ],
        )
        .map_err(|e| FetchError::InvalidRequest(e.to_string()))
    }

    /// One attempt: takes a rate-limit token, sends the request and returns
    /// the body of a 2xx response.
    #[instrument(skip(self), fields(agency = %self.agency))]
    pub async fn fetch(&self, stop_code: &str) -> Result<Bytes, FetchError> {
        let url = self.stop_url(stop_code)?;
        self.limiter.acquire().await;
        let body = fetch_bytes(&self.client, url).await?;
        debug!(bytes = body.len(), "Fetched stop predictions");
        Ok(body)
    }
}

pub async fn fetch_bytes<C: HttpClient>(client: &C, url: Url) -> Result<Bytes, FetchError> {
    let mut req = reqwest::Request::new(reqwest::Method::GET, url);
    req.headers_mut()
        .insert(ACCEPT, HeaderValue::from_static("application/json"));

    let resp = client.execute(req).await.map_err(classify_transport)?;
    let status = resp.status();
    if !status.is_success() {
        return Err(classify_status(status, resp.headers(), Utc::now()));
    }
    resp.bytes().await.map_err(classify_transport)
}

/// Maps a non-2xx status to its failure class.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, now: DateTime<Utc>) -> FetchError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::AuthRejected(status.as_u16()),
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited {
            retry_after: retry_after_hint(headers, now),
        },
        _ => FetchError::HttpStatus(status.as_u16()),
    }
}

/// Parses `Retry-After` as delta-seconds or as an HTTP date.
pub fn retry_after_hint(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

// The URL carries the API key once it has gone through UrlParam.
fn classify_transport(err: reqwest::Error) -> FetchError {
    let err = err.without_url();
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::NetworkUnreachable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Reply, ScriptedClient};
    use chrono::TimeZone;

    fn fetcher(client: ScriptedClient) -> StopFetcher<ScriptedClient> {
        StopFetcher::new(
            client,
            API_ENDPOINT,
            "SF",
            Arc::new(RateLimiter::new(60, Duration::from_secs(60))),
        )
    }

    #[test]
    fn test_stop_url_has_query_without_key() {
        let url = fetcher(ScriptedClient::new(vec![])).stop_url("13543").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.511.org/transit/StopMonitoring?agency=SF&stopcode=13543&format=json"
        );
        assert!(!url.as_str().contains("api_key"));
    }

    #[test]
    fn test_bad_endpoint_is_invalid_request() {
        let f = StopFetcher::new(
            ScriptedClient::new(vec![]),
            "not a url",
            "SF",
            Arc::new(RateLimiter::new(1, Duration::from_secs(1))),
        );
        assert!(matches!(f.stop_url("1"), Err(FetchError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_success_returns_body() {
        let client = ScriptedClient::new(vec![Reply::ok(r#"{"ServiceDelivery":{}}"#)]);
        let body = fetcher(client.clone()).fetch("13543").await.unwrap();
        assert_eq!(&body[..], br#"{"ServiceDelivery":{}}"#);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_status_classification() {
        let client = ScriptedClient::new(vec![
            Reply::status(401),
            Reply::status(403),
            Reply::status(404),
            Reply::status(503),
            Reply::status(429).with_header("retry-after", "7"),
        ]);
        let f = fetcher(client);

        assert_eq!(f.fetch("1").await, Err(FetchError::AuthRejected(401)));
        assert_eq!(f.fetch("1").await, Err(FetchError::AuthRejected(403)));
        assert_eq!(f.fetch("1").await, Err(FetchError::HttpStatus(404)));
        assert_eq!(f.fetch("1").await, Err(FetchError::HttpStatus(503)));
        assert_eq!(
            f.fetch("1").await,
            Err(FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            })
        );
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 50).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after_hint(&headers, now), Some(Duration::from_secs(10)));

        // dates in the past mean "now"
        let later = Utc.with_ymd_and_hms(2015, 10, 21, 8, 0, 0).unwrap();
        assert_eq!(retry_after_hint(&headers, later), Some(Duration::ZERO));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after_hint(&headers, now), None);
    }
}
