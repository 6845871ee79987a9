mod common;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use libstats::application::jobs::RefreshSupervisor;
use libstats::application::refresh::RefreshScope;
use libstats::application::stats::StatsService;
use libstats::infra::http::{HttpState, build_router, codes};

use common::{Harness, MockUpstream, fast_config, harness};

const SECRET: &str = "s3cret";

fn router(h: &Harness, secret: Option<&str>) -> Router {
    let supervisor = RefreshSupervisor::start(
        h.orchestrator.clone(),
        NonZeroUsize::MIN,
        NonZeroUsize::new(4).expect("non-zero"),
    );
    build_router(HttpState {
        stats: Arc::new(StatsService::new(h.store.clone(), h.catalog.clone(), 500)),
        orchestrator: h.orchestrator.clone(),
        supervisor,
        refresh_secret: secret.map(Arc::from),
        db: None,
    })
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn refresh_requires_a_configured_secret() {
    let h = harness(MockUpstream::new(10), fast_config(4));
    let app = router(&h, None);

    let (status, body) = send(&app, post_json("/refresh", Some(SECRET), json!({}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_code(&body), codes::REFRESH_DISABLED);
    assert_eq!(h.upstream.npm_calls(), 0);
}

#[tokio::test]
async fn refresh_rejects_missing_or_wrong_bearer() {
    let h = harness(MockUpstream::new(10), fast_config(4));
    let app = router(&h, Some(SECRET));

    let (status, body) = send(&app, post_json("/refresh", None, json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), codes::UNAUTHORIZED);

    let (status, _) = send(&app, post_json("/refresh", Some("nope"), json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.upstream.npm_calls(), 0);
}

#[tokio::test]
async fn read_api_is_unavailable_until_first_refresh() {
    let h = harness(MockUpstream::new(10), fast_config(4));
    let app = router(&h, Some(SECRET));

    let (status, body) = send(&app, get("/api/stats/org")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_code(&body), codes::STATS_UNAVAILABLE);

    let (status, body) = send(&app, post_json("/refresh", Some(SECRET), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scope"], "all");
    assert_eq!(body["failures"], json!([]));
    assert_eq!(body["timed_out"], false);

    let (status, body) = send(&app, get("/api/stats/org")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["org"], "tanstack");
    assert_eq!(body["data"]["total_downloads"], 35_300);
    assert_eq!(body["stale"], false);

    let (status, body) = send(&app, get("/api/stats/libraries/query")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_downloads"], 14_120);
    assert_eq!(body["data"]["repo"]["star_count"], 100);

    let (status, body) = send(&app, get("/api/stats/libraries/unknown")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), codes::NOT_FOUND);
}

#[tokio::test]
async fn scoped_refresh_by_package_list() {
    let h = harness(MockUpstream::new(10), fast_config(4));
    let app = router(&h, Some(SECRET));

    let (status, body) = send(
        &app,
        post_json(
            "/refresh",
            Some(SECRET),
            json!({ "scope": "packages", "packages": ["react-query"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scope"], "packages");
    assert_eq!(body["successes"], json!(["npm:react-query"]));
    assert_eq!(h.upstream.npm_calls(), 2);

    let (status, body) = send(
        &app,
        post_json(
            "/refresh",
            Some(SECRET),
            json!({ "scope": "packages", "packages": [] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), codes::BAD_REQUEST);
}

#[tokio::test]
async fn overlapping_refresh_answers_conflict() {
    let h = harness(MockUpstream::new(10), fast_config(4));
    let app = router(&h, Some(SECRET));
    let _running = h
        .orchestrator
        .active_runs()
        .acquire(RefreshScope::All)
        .expect("guard");

    let (status, body) = send(&app, post_json("/refresh", Some(SECRET), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), codes::ALREADY_RUNNING);
}

#[tokio::test]
async fn background_refresh_can_be_polled_to_completion() {
    let h = harness(MockUpstream::new(10), fast_config(4));
    let app = router(&h, Some(SECRET));

    let (status, body) = send(
        &app,
        post_json("/refresh-background", Some(SECRET), json!({ "scope": "org" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["scope"], "org");
    let status_url = body["status_url"].as_str().expect("status url").to_string();
    assert!(status_url.starts_with("/refresh/runs/"));

    let mut last = Value::Null;
    for _ in 0..200 {
        let request = Request::builder()
            .uri(&status_url)
            .header(header::AUTHORIZATION, format!("Bearer {SECRET}"))
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == "completed" {
            last = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(last["status"], "completed", "run never finished");
    assert_eq!(last["report"]["scope"], "org");
    assert_eq!(last["report"]["failures"], json!([]));
    assert_eq!(h.upstream.owner_calls(), 1);
    assert_eq!(h.upstream.repo_calls(), 0);

    let unknown = Request::builder()
        .uri("/refresh/runs/00000000-0000-0000-0000-000000000000")
        .header(header::AUTHORIZATION, format!("Bearer {SECRET}"))
        .body(Body::empty())
        .expect("request");
    let (status, _) = send(&app, unknown).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn compare_bins_cached_history() {
    let h = harness(MockUpstream::new(10), fast_config(4));
    let app = router(&h, Some(SECRET));
    send(&app, post_json("/refresh", Some(SECRET), json!({}))).await;

    let (status, body) = send(
        &app,
        get("/api/stats/compare?packages=@tanstack/react-query,unknown-pkg&range=7d&bin=daily"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["from"], "2025-11-30");
    assert_eq!(body["data"]["to"], "2025-12-06");
    assert_eq!(body["data"]["missing"], json!(["unknown-pkg"]));
    let series = body["data"]["series"].as_array().expect("series");
    assert_eq!(series.len(), 1);
    assert_eq!(series[0]["package"], "@tanstack/react-query");
    assert_eq!(series[0]["total"], 70);
    assert_eq!(series[0]["points"].as_array().map(Vec::len), Some(7));

    let (status, body) = send(&app, get("/api/stats/compare?preset=query-adapters")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["bin"], "weekly");
    assert_eq!(body["data"]["series"].as_array().map(Vec::len), Some(2));

    let (status, _) = send(&app, get("/api/stats/compare?preset=nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, get("/api/stats/compare?packages=react-query&bin=hourly")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), codes::BAD_REQUEST);
}

#[tokio::test]
async fn catalog_listings_do_not_need_a_refresh() {
    let h = harness(MockUpstream::new(10), fast_config(4));
    let app = router(&h, Some(SECRET));

    let (status, body) = send(&app, get("/api/stats/libraries")).await;
    assert_eq!(status, StatusCode::OK);
    let libraries = body.as_array().expect("libraries");
    assert_eq!(libraries.len(), 2);
    assert_eq!(libraries[0]["id"], "query");
    assert_eq!(libraries[0]["total_downloads"], Value::Null);

    let (status, body) = send(&app, get("/api/stats/presets")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], "query-adapters");

    let (status, body) = send(&app, get("/api/tools")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(5));

    let response = app.clone().oneshot(get("/_health")).await.expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn tools_are_invoked_by_name() {
    let h = harness(MockUpstream::new(10), fast_config(4));
    let app = router(&h, Some(SECRET));
    send(&app, post_json("/refresh", Some(SECRET), json!({}))).await;

    let (status, body) = send(
        &app,
        post_json(
            "/api/tools/invoke",
            None,
            json!({ "tool": "get_library_stats", "arguments": { "library_id": "table" } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["library_id"], "table");

    let (status, body) = send(
        &app,
        post_json("/api/tools/invoke", None, json!({ "tool": "get_org_stats" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["star_count"], 5000);

    let (status, body) = send(
        &app,
        post_json("/api/tools/invoke", None, json!({ "tool": "delete_everything" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), codes::UNKNOWN_TOOL);

    let (status, _) = send(
        &app,
        post_json(
            "/api/tools/invoke",
            None,
            json!({ "tool": "get_library_stats", "arguments": { "library": "table" } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
