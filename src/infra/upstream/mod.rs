//! HTTP implementation of [`UpstreamClient`] for the npm registry and GitHub.

mod github;
mod npm;

use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::{RequestBuilder, Response, StatusCode, header::HeaderMap};
use time::Date;
use tracing::{debug, warn};
use url::Url;

use crate::application::upstream::{FetchError, Fetched, UpstreamClient};
use crate::config::UpstreamSettings;
use crate::domain::series::DailySeries;
use crate::domain::stats::{OwnerStats, RepoStats};

use super::error::InfraError;

const METRIC_UPSTREAM_REQUESTS: &str = "libstats_upstream_requests_total";

#[derive(Clone)]
pub struct HttpUpstreamClient {
    http: reqwest::Client,
    settings: UpstreamSettings,
}

impl HttpUpstreamClient {
    pub fn new(settings: UpstreamSettings) -> Result<Self, InfraError> {
        let http = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.timeout)
            .build()
            .map_err(|err| {
                InfraError::configuration(format!("failed to build HTTP client: {err}"))
            })?;
        Ok(Self { http, settings })
    }

    pub(crate) fn settings(&self) -> &UpstreamSettings {
        &self.settings
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Send a request, backing off on rate-limit responses.
    ///
    /// Returns the first response that is not a rate limit. Status handling
    /// beyond that is left to the caller.
    pub(crate) async fn send_with_retry(
        &self,
        upstream: &'static str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, FetchError> {
        let max_attempts = self.settings.max_attempts.get();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let response = build().send().await.map_err(|err| {
                record(upstream, "transport_error");
                if err.is_timeout() {
                    FetchError::Timeout { upstream }
                } else {
                    FetchError::Network {
                        upstream,
                        message: err.to_string(),
                    }
                }
            })?;

            if !is_rate_limited(response.status(), response.headers()) {
                record(upstream, outcome_label(response.status()));
                return Ok(response);
            }

            record(upstream, "rate_limited");
            if attempt >= max_attempts {
                warn!(
                    target = "libstats::upstream",
                    upstream,
                    attempts = attempt,
                    "rate limit persisted; giving up"
                );
                return Err(FetchError::RateLimited {
                    upstream,
                    attempts: attempt,
                });
            }

            let delay = self.backoff_delay(attempt, retry_after(response.headers()));
            debug!(
                target = "libstats::upstream",
                upstream,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "rate limited; backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Delay before the attempt after `attempt` (1-based).
    pub(crate) fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .settings
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        retry_after
            .unwrap_or(exponential)
            .min(self.settings.backoff_max)
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn fetch_npm_downloads(
        &self,
        package: &str,
        from: Date,
        to: Date,
    ) -> Result<Fetched<DailySeries>, FetchError> {
        npm::fetch_downloads(self, package, from, to).await
    }

    async fn fetch_github_repo_stats(
        &self,
        repository: &str,
    ) -> Result<Fetched<RepoStats>, FetchError> {
        github::fetch_repo_stats(self, repository).await
    }

    async fn fetch_github_owner_stats(&self, org: &str) -> Result<Fetched<OwnerStats>, FetchError> {
        github::fetch_owner_stats(self, org).await
    }
}

/// GitHub signals primary rate limits with 403 and an exhausted quota header.
fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN
            && headers
                .get("x-ratelimit-remaining")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.trim() == "0"))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64)
}

fn outcome_label(status: StatusCode) -> &'static str {
    if status.is_success() {
        "ok"
    } else if status == StatusCode::NOT_FOUND {
        "not_found"
    } else if status.is_server_error() {
        "server_error"
    } else {
        "client_error"
    }
}

fn record(upstream: &'static str, outcome: &'static str) {
    counter!(METRIC_UPSTREAM_REQUESTS, "upstream" => upstream, "outcome" => outcome).increment(1);
}

/// Map a non-success, non-404 status to an error.
pub(crate) fn status_error(upstream: &'static str, status: StatusCode) -> FetchError {
    FetchError::Status {
        upstream,
        status: status.as_u16(),
    }
}

pub(crate) fn decode_error(upstream: &'static str, err: impl std::fmt::Display) -> FetchError {
    FetchError::Decode {
        upstream,
        message: err.to_string(),
    }
}

/// Append path segments to a base URL without clobbering its existing path.
pub(crate) fn join_segments<'a>(
    upstream: &'static str,
    base: &Url,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url, FetchError> {
    let mut url = base.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| FetchError::InvalidRequest {
            upstream,
            message: format!("`{base}` cannot be used as a base URL"),
        })?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use reqwest::header::HeaderValue;

    use super::*;

    fn client() -> HttpUpstreamClient {
        HttpUpstreamClient::new(UpstreamSettings {
            npm_base_url: Url::parse("https://api.npmjs.org").unwrap(),
            github_api_url: Url::parse("https://api.github.com").unwrap(),
            github_web_url: Url::parse("https://github.com").unwrap(),
            github_token: None,
            user_agent: "libstats-test".into(),
            timeout: Duration::from_secs(5),
            max_attempts: NonZeroU32::new(4).unwrap(),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(3),
            npm_max_range_days: NonZeroU32::new(540).unwrap(),
        })
        .expect("client")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let client = client();
        assert_eq!(client.backoff_delay(1, None), Duration::from_millis(500));
        assert_eq!(client.backoff_delay(2, None), Duration::from_millis(1000));
        assert_eq!(client.backoff_delay(3, None), Duration::from_millis(2000));
        assert_eq!(client.backoff_delay(4, None), Duration::from_secs(3));
        assert_eq!(client.backoff_delay(40, None), Duration::from_secs(3));
    }

    #[test]
    fn retry_after_header_wins_but_is_capped() {
        let client = client();
        assert_eq!(
            client.backoff_delay(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            client.backoff_delay(1, Some(Duration::from_secs(120))),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn github_quota_exhaustion_counts_as_rate_limit() {
        let mut headers = HeaderMap::new();
        assert!(!is_rate_limited(StatusCode::FORBIDDEN, &headers));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        assert!(is_rate_limited(StatusCode::FORBIDDEN, &headers));
        assert!(is_rate_limited(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new()));
    }

    #[test]
    fn join_keeps_base_path_and_encodes_segments() {
        let base = Url::parse("http://localhost:9000/proxy/").unwrap();
        let url = join_segments("github", &base, ["repos", "TanStack", "query"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/proxy/repos/TanStack/query");
    }
}
