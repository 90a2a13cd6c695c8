use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::cli::ServeArgs;
use crate::coverage::{
    CoverageAggregator, CoverageLimits, CoverageOutcome, CoverageQuery, CoverageSource,
    FeatureCollection, parse_locations,
};
use crate::error::CoverageError;
use crate::geo::Point;
use crate::ors::{IsochroneSource, OrsClient, parse_profile};

const CACHE_LONG: &str = "s-maxage=86400, stale-while-revalidate=604800";
const CACHE_SHORT: &str = "s-maxage=3600, stale-while-revalidate=86400";

const X_COVERAGE_SOURCE: &str = "x-coverage-source";
const X_DROPPED_BATCHES: &str = "x-coverage-dropped-batches";

enum Backend<S> {
    Ready(Arc<CoverageAggregator<S>>),
    /// No credential; every coverage request answers 500 with this message.
    Unconfigured(String),
}

struct AppState<S> {
    backend: Arc<Backend<S>>,
    limits: CoverageLimits,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            limits: self.limits,
        }
    }
}

pub async fn run(opts: ServeArgs) -> anyhow::Result<()> {
    let limits = opts.limits.limits();
    let backend = match OrsClient::new(&opts.upstream.settings()) {
        Ok(client) => {
            tracing::info!("Isochrones upstream: {}", client.upstream());
            Backend::Ready(Arc::new(CoverageAggregator::new(client, limits)))
        }
        Err(e) if opts.allow_unconfigured => {
            tracing::warn!("{e}; coverage requests will answer 500");
            Backend::Unconfigured(e.to_string())
        }
        Err(e) => {
            return Err(anyhow!(
                "{e}. Set ORS_API_KEY (or --ors-api-key), or pass --allow-unconfigured"
            ));
        }
    };

    let app = router(AppState {
        backend: Arc::new(backend),
        limits,
    });

    let addr: SocketAddr = format!("{}:{}", opts.host, opts.port)
        .parse()
        .context("parse host:port")?;

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router<S: IsochroneSource>(state: AppState<S>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/coverage", post(api_coverage::<S>))
        .route("/api/isochrones", post(api_coverage::<S>))
        .route("/api/status", get(api_status::<S>))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    configured: bool,
    upstream: Option<String>,
    max_locations: usize,
    batch_size: usize,
}

async fn api_status<S: IsochroneSource>(State(st): State<AppState<S>>) -> impl IntoResponse {
    let upstream = match st.backend.as_ref() {
        Backend::Ready(agg) => Some(agg.source().upstream().to_string()),
        Backend::Unconfigured(_) => None,
    };
    Json(StatusResponse {
        configured: upstream.is_some(),
        upstream,
        max_locations: st.limits.max_locations,
        batch_size: st.limits.batch_size,
    })
}

#[derive(Debug, Deserialize)]
struct CoverageParams {
    minutes: Option<String>,
    profile: Option<String>,
    generalize: Option<String>,
}

fn parse_query(p: &CoverageParams) -> Result<CoverageQuery, CoverageError> {
    let defaults = CoverageQuery::default();

    let minutes = match p.minutes.as_deref().map(str::trim) {
        None | Some("") => defaults.minutes,
        Some(s) => s
            .parse::<u32>()
            .ok()
            .filter(|m| *m > 0)
            .ok_or_else(|| CoverageError::invalid("minutes must be a positive integer"))?,
    };
    let generalize = match p.generalize.as_deref().map(str::trim) {
        None | Some("") => defaults.generalize,
        Some(s) => s
            .parse::<f64>()
            .ok()
            .filter(|g| g.is_finite())
            .ok_or_else(|| CoverageError::invalid("generalize must be a number"))?,
    };

    Ok(CoverageQuery {
        minutes,
        profile: parse_profile(p.profile.as_deref()),
        generalize,
    })
}

async fn api_coverage<S: IsochroneSource>(
    State(st): State<AppState<S>>,
    params: Result<Query<CoverageParams>, QueryRejection>,
    body: Bytes,
) -> Response {
    let aggregator = match st.backend.as_ref() {
        Backend::Ready(agg) => Arc::clone(agg),
        Backend::Unconfigured(msg) => {
            return CoverageError::Configuration(msg.clone()).into_response();
        }
    };
    let p = match params {
        Ok(Query(p)) => p,
        Err(e) => {
            return CoverageError::invalid(format!("invalid query string: {e}")).into_response();
        }
    };
    let query = match parse_query(&p) {
        Ok(q) => q,
        Err(e) => return e.into_response(),
    };
    let locations = match parse_locations(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("coverage request rejected: {e}");
            return e.into_response();
        }
    };

    let task_locations = locations.clone();
    let task = tokio::spawn(async move { aggregator.compute(&task_locations, &query).await });

    match task.await {
        Ok(outcome) => {
            tracing::info!(
                "coverage: {} locations, {} sampled, {} batches ({} dropped, {} retried), {} upstream features, source={}",
                locations.len(),
                outcome.sampled,
                outcome.batches.len(),
                outcome.dropped_batches(),
                outcome.retried_batches(),
                outcome.upstream_features(),
                outcome.source.as_str()
            );
            outcome_response(outcome)
        }
        Err(e) => {
            tracing::warn!("coverage task failed ({e}); serving distance fallback");
            fallback_response(&locations, query.minutes)
        }
    }
}

fn outcome_response(outcome: CoverageOutcome) -> Response {
    let cache = match outcome.source {
        CoverageSource::Synthetic => CACHE_SHORT,
        CoverageSource::Isochrones | CoverageSource::Partial => CACHE_LONG,
    };
    let dropped = outcome.dropped_batches();
    collection_response(outcome.collection, cache, outcome.source, dropped)
}

/// Circles for every input location, sampling included, after the aggregator itself failed.
fn fallback_response(locations: &[Point], minutes: u32) -> Response {
    let collection = FeatureCollection::synthetic(locations, minutes);
    collection_response(collection, CACHE_SHORT, CoverageSource::Synthetic, 0)
}

fn collection_response(
    collection: FeatureCollection,
    cache: &'static str,
    source: CoverageSource,
    dropped: usize,
) -> Response {
    (
        [
            (header::CACHE_CONTROL, HeaderValue::from_static(cache)),
            (
                HeaderName::from_static(X_COVERAGE_SOURCE),
                HeaderValue::from_static(source.as_str()),
            ),
            (
                HeaderName::from_static(X_DROPPED_BATCHES),
                HeaderValue::from(dropped),
            ),
        ],
        Json(collection),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::coverage::testing::FakeSource;
    use crate::error::UpstreamError;
    use crate::ors::{MISSING_API_KEY, Profile};

    fn limits() -> CoverageLimits {
        CoverageLimits {
            rate_limit_backoff: Duration::ZERO,
            ..CoverageLimits::default()
        }
    }

    fn app_with(source: FakeSource) -> (Router, Arc<CoverageAggregator<FakeSource>>) {
        let agg = Arc::new(CoverageAggregator::new(source, limits()));
        let app = router(AppState {
            backend: Arc::new(Backend::Ready(Arc::clone(&agg))),
            limits: limits(),
        });
        (app, agg)
    }

    fn unconfigured_app() -> Router {
        router::<FakeSource>(AppState {
            backend: Arc::new(Backend::Unconfigured(MISSING_API_KEY.to_string())),
            limits: limits(),
        })
    }

    fn locations_body(n: usize) -> String {
        let locations: Vec<[f64; 2]> = (0..n)
            .map(|i| [-87.6 + i as f64 * 0.01, 41.8 + i as f64 * 0.01])
            .collect();
        json!({ "locations": locations }).to_string()
    }

    async fn send_post(app: Router, uri: &str, body: impl Into<Body>) -> (StatusCode, Response) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        (resp.status(), resp)
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn header_str<'a>(resp: &'a Response, name: &str) -> &'a str {
        resp.headers().get(name).unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn missing_locations_is_bad_request() {
        let (app, agg) = app_with(FakeSource::echo());
        let (status, resp) = send_post(app, "/coverage", r#"{"points": []}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(resp).await,
            json!({ "error": "locations array required" })
        );
        assert_eq!(agg.source().call_count(), 0);
    }

    #[tokio::test]
    async fn malformed_point_is_bad_request() {
        let (app, _) = app_with(FakeSource::echo());
        let (status, _) = send_post(app, "/coverage", r#"{"locations": [[1, "x"]]}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bad_minutes_is_bad_request() {
        let (app, _) = app_with(FakeSource::echo());
        let (status, resp) = send_post(app, "/coverage?minutes=soon", locations_body(2)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(resp).await["error"],
            "minutes must be a positive integer"
        );
    }

    #[tokio::test]
    async fn repeated_query_key_is_json_bad_request() {
        let (app, agg) = app_with(FakeSource::echo());
        let uri = "/coverage?minutes=1&minutes=2";
        let (status, resp) = send_post(app, uri, locations_body(2)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(header_str(&resp, "content-type").starts_with("application/json"));
        let body = json_body(resp).await;
        let msg = body["error"].as_str().unwrap();
        assert!(msg.starts_with("invalid query string"), "{msg}");
        assert_eq!(agg.source().call_count(), 0);
    }

    #[tokio::test]
    async fn empty_locations_get_long_cache() {
        let (app, agg) = app_with(FakeSource::unreachable());
        let (status, resp) = send_post(app, "/coverage", r#"{"locations": []}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(header_str(&resp, "cache-control"), CACHE_LONG);
        assert_eq!(header_str(&resp, X_COVERAGE_SOURCE), "isochrones");
        assert_eq!(agg.source().call_count(), 0);
        assert_eq!(
            json_body(resp).await,
            json!({ "type": "FeatureCollection", "features": [] })
        );
    }

    #[tokio::test]
    async fn unreadable_body_is_server_error() {
        let (app, _) = app_with(FakeSource::echo());
        let (status, resp) = send_post(app, "/coverage", "{{{{").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(resp).await,
            json!({ "error": "Failed to generate coverage data" })
        );
    }

    #[tokio::test]
    async fn unconfigured_backend_reports_missing_key() {
        let (status, resp) = send_post(unconfigured_app(), "/coverage", locations_body(3)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(resp).await, json!({ "error": MISSING_API_KEY }));
    }

    #[tokio::test]
    async fn upstream_success_is_cached_long() {
        let (app, agg) = app_with(FakeSource::echo());
        let (status, resp) = send_post(
            app,
            "/api/isochrones?minutes=10&profile=foot-walking&generalize=5",
            locations_body(7),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(header_str(&resp, "cache-control"), CACHE_LONG);
        assert_eq!(header_str(&resp, X_COVERAGE_SOURCE), "isochrones");
        assert_eq!(header_str(&resp, X_DROPPED_BATCHES), "0");
        assert!(header_str(&resp, "content-type").starts_with("application/json"));

        let body = json_body(resp).await;
        assert_eq!(body["type"], "FeatureCollection");
        assert_eq!(body["features"].as_array().unwrap().len(), 7);

        let calls = agg.source().calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].profile, Profile::FootWalking);
        assert_eq!(calls[0].range_seconds, 600);
        assert_eq!(calls[0].smoothing, 5.0);
    }

    #[tokio::test]
    async fn defaults_apply_without_query() {
        let (app, agg) = app_with(FakeSource::echo());
        let (status, _) = send_post(app, "/coverage", locations_body(1)).await;
        assert_eq!(status, StatusCode::OK);
        let calls = agg.source().calls.lock().unwrap();
        assert_eq!(calls[0].profile, Profile::DrivingCar);
        assert_eq!(calls[0].range_seconds, 1200);
        assert_eq!(calls[0].smoothing, 30.0);
    }

    #[tokio::test]
    async fn partial_failure_is_reported_in_headers() {
        let source = FakeSource::echo().then(Err(UpstreamError::Transport("reset".into())));
        let (app, _) = app_with(source);
        let (status, resp) = send_post(app, "/coverage", locations_body(10)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(header_str(&resp, X_COVERAGE_SOURCE), "partial");
        assert_eq!(header_str(&resp, X_DROPPED_BATCHES), "1");
        assert_eq!(json_body(resp).await["features"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn unreachable_upstream_serves_short_lived_fallback() {
        let (app, _) = app_with(FakeSource::unreachable());
        let body = r#"{"locations": [[0, 0]]}"#;
        let (status, resp) = send_post(app, "/coverage?minutes=20", body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(header_str(&resp, "cache-control"), CACHE_SHORT);
        assert_eq!(header_str(&resp, X_COVERAGE_SOURCE), "synthetic");

        let body = json_body(resp).await;
        let features = body["features"].as_array().unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0]["properties"]["value"], 1200);
        assert_eq!(features[0]["properties"]["center"], json!([0.0, 0.0]));
        let ring = features[0]["geometry"]["coordinates"][0].as_array().unwrap();
        assert_eq!(ring.len(), 17);
        assert_eq!(ring.first(), ring.last());
    }

    #[tokio::test]
    async fn aggregator_panic_falls_back_for_every_input_location() {
        let (app, _) = app_with(FakeSource::new(|_| panic!("upstream client exploded")));
        let (status, resp) = send_post(app, "/coverage", locations_body(75)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(header_str(&resp, "cache-control"), CACHE_SHORT);
        // not sampled down to 60
        assert_eq!(json_body(resp).await["features"].as_array().unwrap().len(), 75);
    }

    #[tokio::test]
    async fn status_reports_configuration() {
        let (app, _) = app_with(FakeSource::echo());
        let req = Request::get("/api/status").body(Body::empty()).unwrap();
        let body = json_body(app.oneshot(req).await.unwrap()).await;
        assert_eq!(
            body,
            json!({ "configured": true, "upstream": "fake", "max_locations": 60, "batch_size": 5 })
        );

        let req = Request::get("/api/status").body(Body::empty()).unwrap();
        let body = json_body(unconfigured_app().oneshot(req).await.unwrap()).await;
        assert_eq!(body["configured"], false);
        assert_eq!(body["upstream"], Value::Null);
    }
}
