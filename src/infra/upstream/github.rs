use std::{cell::RefCell, rc::Rc};

use lol_html::{RewriteStrSettings, rewrite_str, text};
use reqwest::{RequestBuilder, StatusCode, header::HeaderMap};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::application::upstream::{FetchError, Fetched, GITHUB};
use crate::domain::stats::{OwnerStats, RepoStats};

use super::{HttpUpstreamClient, decode_error, join_segments, status_error};

const REPOS_PER_PAGE: usize = 100;
const MAX_REPO_PAGES: u32 = 50;

#[derive(Debug, Deserialize)]
struct RepoBody {
    stargazers_count: u64,
}

#[derive(Debug, Deserialize)]
struct OrgBody {
    #[serde(default)]
    public_repos: u64,
    #[serde(default)]
    followers: u64,
}

pub(super) async fn fetch_repo_stats(
    client: &HttpUpstreamClient,
    repository: &str,
) -> Result<Fetched<RepoStats>, FetchError> {
    let (owner, name) = split_repository(repository)?;
    let api = &client.settings().github_api_url;

    let url = join_segments(GITHUB, api, ["repos", owner, name])?;
    let response = client
        .send_with_retry(GITHUB, || api_get(client, &url))
        .await?;
    match response.status() {
        StatusCode::NOT_FOUND => return Ok(Fetched::NotFound),
        status if !status.is_success() => return Err(status_error(GITHUB, status)),
        _ => {}
    }
    let repo: RepoBody = response
        .json()
        .await
        .map_err(|err| decode_error(GITHUB, err))?;

    let contributor_count = soften(
        repository,
        "contributors",
        fetch_contributor_count(client, owner, name).await,
    )?;
    let dependent_count = soften(
        repository,
        "dependents",
        fetch_dependent_count(client, owner, name).await,
    )?;

    Ok(Fetched::Found(RepoStats {
        repository: repository.to_string(),
        star_count: repo.stargazers_count,
        contributor_count,
        dependent_count,
    }))
}

pub(super) async fn fetch_owner_stats(
    client: &HttpUpstreamClient,
    org: &str,
) -> Result<Fetched<OwnerStats>, FetchError> {
    let api = &client.settings().github_api_url;

    let url = join_segments(GITHUB, api, ["orgs", org])?;
    let response = client
        .send_with_retry(GITHUB, || api_get(client, &url))
        .await?;
    match response.status() {
        StatusCode::NOT_FOUND => return Ok(Fetched::NotFound),
        status if !status.is_success() => return Err(status_error(GITHUB, status)),
        _ => {}
    }
    let profile: OrgBody = response
        .json()
        .await
        .map_err(|err| decode_error(GITHUB, err))?;

    let mut star_count = 0u64;
    let mut repos_url = join_segments(GITHUB, api, ["orgs", org, "repos"])?;
    for page in 1..=MAX_REPO_PAGES {
        repos_url
            .query_pairs_mut()
            .clear()
            .append_pair("per_page", &REPOS_PER_PAGE.to_string())
            .append_pair("page", &page.to_string());

        let response = client
            .send_with_retry(GITHUB, || api_get(client, &repos_url))
            .await?;
        if !response.status().is_success() {
            return Err(status_error(GITHUB, response.status()));
        }
        let repos: Vec<RepoBody> = response
            .json()
            .await
            .map_err(|err| decode_error(GITHUB, err))?;

        star_count = repos
            .iter()
            .fold(star_count, |acc, repo| acc.saturating_add(repo.stargazers_count));
        if repos.len() < REPOS_PER_PAGE {
            break;
        }
    }

    Ok(Fetched::Found(OwnerStats {
        owner: org.to_string(),
        star_count,
        repository_count: profile.public_repos,
        follower_count: profile.followers,
    }))
}

async fn fetch_contributor_count(
    client: &HttpUpstreamClient,
    owner: &str,
    name: &str,
) -> Result<u64, FetchError> {
    let mut url = join_segments(
        GITHUB,
        &client.settings().github_api_url,
        ["repos", owner, name, "contributors"],
    )?;
    url.query_pairs_mut()
        .append_pair("per_page", "1")
        .append_pair("anon", "1");

    let response = client
        .send_with_retry(GITHUB, || api_get(client, &url))
        .await?;
    match response.status() {
        StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => return Ok(0),
        status if !status.is_success() => return Err(status_error(GITHUB, status)),
        _ => {}
    }

    if let Some(last) = last_page(response.headers()) {
        return Ok(last);
    }

    // Without pagination every contributor fits on the single page.
    let contributors: Vec<serde_json::Value> = response
        .json()
        .await
        .map_err(|err| decode_error(GITHUB, err))?;
    Ok(contributors.len() as u64)
}

async fn fetch_dependent_count(
    client: &HttpUpstreamClient,
    owner: &str,
    name: &str,
) -> Result<u64, FetchError> {
    let url = join_segments(
        GITHUB,
        &client.settings().github_web_url,
        [owner, name, "network", "dependents"],
    )?;

    let response = client
        .send_with_retry(GITHUB, || client.http().get(url.clone()))
        .await?;
    match response.status() {
        StatusCode::NOT_FOUND => return Ok(0),
        status if !status.is_success() => return Err(status_error(GITHUB, status)),
        _ => {}
    }

    let html = response
        .text()
        .await
        .map_err(|err| decode_error(GITHUB, err))?;
    Ok(parse_dependent_count(&html)?.unwrap_or(0))
}

fn api_get(client: &HttpUpstreamClient, url: &Url) -> RequestBuilder {
    let request = client
        .http()
        .get(url.clone())
        .header(reqwest::header::ACCEPT, "application/vnd.github+json")
        .header("X-GitHub-Api-Version", "2022-11-28");
    match client.settings().github_token.as_deref() {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

/// Secondary metrics degrade to zero on non-transient failures.
fn soften(
    repository: &str,
    metric: &'static str,
    result: Result<u64, FetchError>,
) -> Result<u64, FetchError> {
    match result {
        Ok(count) => Ok(count),
        Err(err @ (FetchError::Status { .. } | FetchError::Decode { .. })) => {
            warn!(
                target = "libstats::upstream",
                repository,
                metric,
                error = %err,
                "secondary repository metric unavailable; recording zero"
            );
            Ok(0)
        }
        Err(err) => Err(err),
    }
}

fn split_repository(repository: &str) -> Result<(&str, &str), FetchError> {
    match repository.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => Err(FetchError::InvalidRequest {
            upstream: GITHUB,
            message: format!("repository `{repository}` is not `owner/name`"),
        }),
    }
}

/// Page number of the `rel="last"` link, if present.
pub(super) fn last_page(headers: &HeaderMap) -> Option<u64> {
    let link = headers.get(reqwest::header::LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.split(';').any(|param| param.trim() == r#"rel="last""#) {
            return None;
        }
        let target = target.trim().trim_start_matches('<').trim_end_matches('>');
        let url = Url::parse(target).ok()?;
        url.query_pairs()
            .find(|(key, _)| key == "page")
            .and_then(|(_, value)| value.parse().ok())
    })
}

/// Read the repository count from the selected tab of a dependents page.
pub(super) fn parse_dependent_count(html: &str) -> Result<Option<u64>, FetchError> {
    let captured = Rc::new(RefCell::new(String::new()));

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![text!("a.btn-link.selected", {
                let captured = Rc::clone(&captured);
                move |chunk| {
                    captured.borrow_mut().push_str(chunk.as_str());
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| decode_error(GITHUB, err))?;

    let captured = captured.borrow();
    Ok(captured
        .split_whitespace()
        .find_map(|token| token.replace(',', "").parse::<u64>().ok()))
}
