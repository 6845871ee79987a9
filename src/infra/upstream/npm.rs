use reqwest::StatusCode;
use serde::Deserialize;
use time::{Date, Duration};

use crate::application::upstream::{FetchError, Fetched, NPM};
use crate::domain::series::{DailyDownloads, DailySeries};
use crate::domain::types::{format_date, parse_date};

use super::{HttpUpstreamClient, decode_error, join_segments, status_error};

#[derive(Debug, Deserialize)]
struct RangeBody {
    #[serde(default)]
    downloads: Vec<RangeDay>,
}

#[derive(Debug, Deserialize)]
struct RangeDay {
    day: String,
    downloads: u64,
}

/// Fetch `[from, to]` as consecutive windows no longer than the registry
/// allows and splice them into one series.
pub(super) async fn fetch_downloads(
    client: &HttpUpstreamClient,
    package: &str,
    from: Date,
    to: Date,
) -> Result<Fetched<DailySeries>, FetchError> {
    if from > to {
        return Err(FetchError::InvalidRequest {
            upstream: NPM,
            message: format!("range start {from} is after range end {to}"),
        });
    }

    let window = i64::from(client.settings().npm_max_range_days.get());
    let mut series = DailySeries::default();
    let mut found_any = false;
    let mut start = from;

    loop {
        let end = start.saturating_add(Duration::days(window - 1)).min(to);
        if let Fetched::Found(points) = fetch_window(client, package, start, end).await? {
            found_any = true;
            series.splice(points);
        }
        if end >= to {
            break;
        }
        match end.next_day() {
            Some(next) => start = next,
            None => break,
        }
    }

    Ok(if found_any {
        Fetched::Found(series)
    } else {
        Fetched::NotFound
    })
}

async fn fetch_window(
    client: &HttpUpstreamClient,
    package: &str,
    from: Date,
    to: Date,
) -> Result<Fetched<Vec<DailyDownloads>>, FetchError> {
    let range = format!("{}:{}", format_date(from), format_date(to));
    let mut segments = vec!["downloads", "range", range.as_str()];
    segments.extend(package.split('/'));
    let url = join_segments(NPM, &client.settings().npm_base_url, segments)?;

    let response = client
        .send_with_retry(NPM, || client.http().get(url.clone()))
        .await?;

    match response.status() {
        StatusCode::NOT_FOUND => return Ok(Fetched::NotFound),
        status if !status.is_success() => return Err(status_error(NPM, status)),
        _ => {}
    }

    let body: RangeBody = response
        .json()
        .await
        .map_err(|err| decode_error(NPM, err))?;

    let points = body
        .downloads
        .into_iter()
        .map(|day| {
            Ok(DailyDownloads {
                day: parse_date(&day.day).map_err(|err| decode_error(NPM, err))?,
                downloads: day.downloads,
            })
        })
        .collect::<Result<Vec<_>, FetchError>>()?;

    Ok(Fetched::Found(points))
}
