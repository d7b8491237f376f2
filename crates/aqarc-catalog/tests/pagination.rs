use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aqarc_catalog::{CatalogClient, CatalogError, API_KEY_HEADER};
use aqarc_storage::{BackoffPolicy, HttpClientConfig, RetryPolicy};
use futures::TryStreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn test_config() -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            server_error_attempts: 3,
            server_error_delay: Duration::from_millis(1),
            rate_limit: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            transport: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        },
        ..HttpClientConfig::default()
    }
}

fn client(server: &MockServer) -> CatalogClient {
    CatalogClient::new(server.uri(), "test-key", test_config()).expect("client")
}

fn query_u64(req: &Request, key: &str) -> u64 {
    req.url
        .query_pairs()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0)
}

/// Serves `total` locations in pages of the requested limit; `found` counts from the
/// requested page onward, like the live API.
struct LocationPages {
    total: u64,
    hits: Arc<AtomicUsize>,
    malformed_pages: Vec<u64>,
}

impl Respond for LocationPages {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let limit = query_u64(req, "limit").max(1);
        let page = query_u64(req, "page").max(1);
        if self.malformed_pages.contains(&page) {
            return ResponseTemplate::new(200).set_body_string("{\"results\": [tru");
        }
        let start = (page - 1) * limit;
        let end = (start + limit).min(self.total);
        let results: Vec<_> = (start..end)
            .map(|i| {
                json!({
                    "id": i + 1,
                    "name": format!("site {}", i + 1),
                    "coordinates": {"latitude": 1.0, "longitude": 2.0},
                    "datetimeFirst": {"utc": "2020-01-01T00:00:00Z"},
                    "datetimeLast": {"utc": "2021-06-01T00:00:00Z"},
                    "country": {"id": 155},
                    "sensors": [{"id": 100 + i, "parameter": {"id": 2, "name": "pm25"}}]
                })
            })
            .collect();
        let found = self.total.saturating_sub(start);
        ResponseTemplate::new(200).set_body_json(json!({
            "meta": {"name": "openaq-api", "page": page, "limit": limit, "found": found},
            "results": results
        }))
    }
}

#[tokio::test]
async fn traversal_issues_ceil_of_total_over_page_size_requests() {
    let server = MockServer::start().await;
    let hits = Arc::new(AtomicUsize::new(0));
    Mock::given(method("GET"))
        .and(path("/v3/locations"))
        .and(header(API_KEY_HEADER, "test-key"))
        .and(query_param("countries_id", "155"))
        .respond_with(LocationPages {
            total: 25,
            hits: hits.clone(),
            malformed_pages: Vec::new(),
        })
        .mount(&server)
        .await;

    let client = client(&server);
    let locations: Vec<_> = client
        .list_locations(&[155], 10)
        .try_collect()
        .await
        .expect("traversal");

    assert_eq!(locations.len(), 25);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(locations[0].id, 1);
    assert_eq!(locations[24].id, 25);
    assert_eq!(locations[0].coverage_years(), Some(2020..=2021));
}

#[tokio::test]
async fn exact_multiple_of_page_size_stops_on_found() {
    let server = MockServer::start().await;
    let hits = Arc::new(AtomicUsize::new(0));
    Mock::given(method("GET"))
        .and(path("/v3/locations"))
        .respond_with(LocationPages {
            total: 20,
            hits: hits.clone(),
            malformed_pages: Vec::new(),
        })
        .mount(&server)
        .await;

    let sensors: Vec<_> = client(&server)
        .list_sensors_for_countries(&[155], 10)
        .try_collect()
        .await
        .expect("traversal");

    assert_eq!(sensors.len(), 20);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_page_is_skipped() {
    let server = MockServer::start().await;
    let hits = Arc::new(AtomicUsize::new(0));
    Mock::given(method("GET"))
        .and(path("/v3/locations"))
        .respond_with(LocationPages {
            total: 30,
            hits: hits.clone(),
            malformed_pages: vec![2],
        })
        .mount(&server)
        .await;

    let locations: Vec<_> = client(&server)
        .list_locations(&[], 10)
        .try_collect()
        .await
        .expect("traversal");

    let ids: Vec<_> = locations.iter().map(|l| l.id).collect();
    assert_eq!(ids.len(), 20);
    assert!(ids.contains(&1) && ids.contains(&30));
    assert!(!ids.contains(&11));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn too_many_consecutive_malformed_pages_fail() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/locations"))
        .respond_with(LocationPages {
            total: 100,
            hits: Arc::new(AtomicUsize::new(0)),
            malformed_pages: vec![1, 2, 3, 4],
        })
        .mount(&server)
        .await;

    let err = client(&server)
        .list_locations(&[], 10)
        .try_collect::<Vec<_>>()
        .await
        .expect_err("should give up");
    match err {
        CatalogError::MalformedPages { page, count, .. } => {
            assert_eq!(page, 4);
            assert_eq!(count, 4);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn validation_error_is_fatal_and_carries_the_issue() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/parameters"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "detail": [{
                "type": "less_than_equal",
                "loc": ["query", "limit"],
                "msg": "Input should be less than or equal to 1000",
                "input": "5000"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .list_parameters(5000)
        .try_collect::<Vec<_>>()
        .await
        .expect_err("422");
    assert!(err.is_fatal());
    match err {
        CatalogError::Validation { issue: Some(issue), .. } => {
            assert_eq!(issue.kind, "less_than_equal");
            assert_eq!(issue.msg, "Input should be less than or equal to 1000");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn server_errors_exhaust_into_request_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/countries"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server)
        .list_countries(100)
        .try_collect::<Vec<_>>()
        .await
        .expect_err("5xx");
    assert!(!err.is_fatal());
    assert!(matches!(err, CatalogError::Request { .. }));
}

#[tokio::test]
async fn per_location_sensor_listing_maps_parameters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/locations/42/sensors"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": {"page": 1, "limit": 100, "found": 2},
            "results": [
                {"id": 7, "name": "o3 ppm", "parameter": {"id": 10, "name": "o3", "units": "ppm"}},
                {"id": 8, "name": "no2 ppm", "parameter": {"id": 7, "name": "no2", "units": "ppm"}}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sensors: Vec<_> = client(&server)
        .list_sensors_by_location(42, 100)
        .try_collect()
        .await
        .expect("sensors");
    assert_eq!(sensors.len(), 2);
    assert_eq!(sensors[0].parameter_name, "o3");
    assert_eq!(sensors[1].parameter_id, 7);
}

#[tokio::test]
async fn cancelled_traversal_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = client(&server)
        .with_cancellation(cancel)
        .list_locations(&[], 10)
        .try_collect::<Vec<_>>()
        .await
        .expect_err("cancelled");
    assert!(matches!(err, CatalogError::Cancelled));
}
