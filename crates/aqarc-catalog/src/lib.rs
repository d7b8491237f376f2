//! Paginated client for the air-quality catalog API (locations, sensors, parameters,
//! countries), exposing each listing as a lazy stream.

use std::fmt;

use anyhow::Context;
use aqarc_core::{
    Coordinates, Country, CountryId, Location, LocationId, Parameter, ParameterId, Sensor,
    SensorId,
};
use aqarc_storage::{FetchError, HttpClientConfig, HttpFetcher};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::HeaderValue;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "aqarc-catalog";

pub const DEFAULT_API_BASE: &str = "https://api.openaq.org";
pub const DEFAULT_PAGE_SIZE: u32 = 1000;
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Consecutive undecodable pages tolerated before a traversal gives up.
pub const MAX_MALFORMED_PAGES: usize = 3;

/// First entry of a 422 response body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ValidationIssue {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub loc: Vec<JsonValue>,
    pub msg: String,
    #[serde(default)]
    pub input: Option<JsonValue>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loc = self
            .loc
            .iter()
            .map(|part| match part {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".");
        write!(f, "{} at `{}`: {}", self.kind, loc, self.msg)?;
        if let Some(input) = &self.input {
            write!(f, " (input: {input})")?;
        }
        Ok(())
    }
}

/// Decode the first validation issue from a 422 body. The API documents
/// `{"detail": [...]}`, but some deployments return that list as a JSON-encoded string.
pub fn parse_validation_error(body: &str) -> Option<ValidationIssue> {
    #[derive(Deserialize)]
    struct Envelope {
        detail: Vec<ValidationIssue>,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Payload {
        Envelope(Envelope),
        Bare(Vec<ValidationIssue>),
        Encoded(String),
    }

    match serde_json::from_str::<Payload>(body).ok()? {
        Payload::Envelope(envelope) => envelope.detail.into_iter().next(),
        Payload::Bare(issues) => issues.into_iter().next(),
        Payload::Encoded(inner) => match serde_json::from_str::<Payload>(&inner).ok()? {
            Payload::Envelope(envelope) => envelope.detail.into_iter().next(),
            Payload::Bare(issues) => issues.into_iter().next(),
            Payload::Encoded(_) => None,
        },
    }
}

fn describe_rejection(issue: &Option<ValidationIssue>, raw: &str) -> String {
    match issue {
        Some(issue) => issue.to_string(),
        None => raw.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog rejected request to {endpoint}: {}", describe_rejection(.issue, .raw))]
    Validation {
        endpoint: String,
        issue: Option<ValidationIssue>,
        raw: String,
    },
    #[error("catalog request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: FetchError,
    },
    #[error("{count} consecutive malformed pages from {endpoint} (last page {page}): {source}")]
    MalformedPages {
        endpoint: String,
        page: u32,
        count: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("catalog traversal cancelled")]
    Cancelled,
}

impl CatalogError {
    /// Validation failures mean the request itself is wrong; retrying cannot help and the
    /// whole run should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CatalogError::Validation { .. })
    }

    fn from_fetch(endpoint: &str, err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => CatalogError::Cancelled,
            FetchError::HttpStatus { status: 422, body, .. } => CatalogError::Validation {
                endpoint: endpoint.to_string(),
                issue: parse_validation_error(&body),
                raw: body,
            },
            source => CatalogError::Request {
                endpoint: endpoint.to_string(),
                source,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Found {
    Exact(u64),
    /// Lower bound such as `">1000"`.
    AtLeast(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageMeta {
    pub limit: u32,
    #[serde(default)]
    pub found: Option<Found>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Page<W> {
    pub results: Vec<W>,
    pub meta: PageMeta,
}

impl<W> Page<W> {
    /// `found` counts the results from the current page onward, so an exact value that
    /// fits in one page means nothing follows.
    pub fn is_last(&self) -> bool {
        let limit = self.meta.limit.max(1) as usize;
        if self.results.is_empty() || self.results.len() < limit {
            return true;
        }
        matches!(self.meta.found, Some(Found::Exact(found)) if found <= u64::from(self.meta.limit))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationRecord {
    id: LocationId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    coordinates: Option<CoordinatesRecord>,
    #[serde(default)]
    datetime_first: Option<DatetimeRecord>,
    #[serde(default)]
    datetime_last: Option<DatetimeRecord>,
    #[serde(default)]
    country: Option<CountryRef>,
    #[serde(default)]
    sensors: Vec<SensorRecord>,
}

#[derive(Debug, Clone, Deserialize)]
struct CoordinatesRecord {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct DatetimeRecord {
    utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
struct CountryRef {
    id: CountryId,
}

#[derive(Debug, Clone, Deserialize)]
struct SensorRecord {
    id: SensorId,
    parameter: ParameterRef,
}

#[derive(Debug, Clone, Deserialize)]
struct ParameterRef {
    id: ParameterId,
    name: String,
    #[serde(default)]
    units: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParameterRecord {
    id: ParameterId,
    name: String,
    #[serde(default)]
    units: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountryRecord {
    id: CountryId,
    code: String,
    name: String,
    #[serde(default)]
    datetime_first: Option<DateTime<Utc>>,
    #[serde(default)]
    datetime_last: Option<DateTime<Utc>>,
}

/// A location together with the sensors the catalog lists under it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationDetail {
    pub location: Location,
    pub sensors: Vec<Sensor>,
}

fn location_from_record(record: LocationRecord) -> Vec<Location> {
    vec![location_of(&record)]
}

fn location_of(record: &LocationRecord) -> Location {
    Location {
        id: record.id,
        name: record.name.clone().unwrap_or_default(),
        coordinates: record.coordinates.as_ref().map(|c| Coordinates {
            latitude: c.latitude,
            longitude: c.longitude,
        }),
        first_observed: record.datetime_first.as_ref().map(|d| d.utc),
        last_observed: record.datetime_last.as_ref().map(|d| d.utc),
        country_id: record.country.as_ref().map(|c| c.id),
    }
}

fn detail_from_record(record: LocationRecord) -> Vec<LocationDetail> {
    let location = location_of(&record);
    vec![LocationDetail {
        location,
        sensors: record.sensors.into_iter().map(sensor_from_record).collect(),
    }]
}

fn sensor_from_record(record: SensorRecord) -> Sensor {
    Sensor {
        id: record.id,
        parameter_id: record.parameter.id,
        parameter_name: record.parameter.name,
        parameter_units: record.parameter.units,
    }
}

fn sensors_from_location_record(record: LocationRecord) -> Vec<Sensor> {
    record.sensors.into_iter().map(sensor_from_record).collect()
}

fn sensors_from_sensor_record(record: SensorRecord) -> Vec<Sensor> {
    vec![sensor_from_record(record)]
}

fn parameter_from_record(record: ParameterRecord) -> Vec<Parameter> {
    vec![Parameter {
        id: record.id,
        name: record.name,
        units: record.units,
        display_name: record.display_name,
        description: record.description,
    }]
}

fn country_from_record(record: CountryRecord) -> Vec<Country> {
    vec![Country {
        id: record.id,
        code: record.code,
        name: record.name,
        first_observed: record.datetime_first,
        last_observed: record.datetime_last,
    }]
}

#[derive(Debug, Clone)]
struct PageCursor {
    endpoint: String,
    query: Vec<(&'static str, String)>,
    page_size: u32,
    page: u32,
    malformed_streak: usize,
    done: bool,
}

impl PageCursor {
    fn new(endpoint: String, query: Vec<(&'static str, String)>, page_size: u32) -> Self {
        Self {
            endpoint,
            query,
            page_size: page_size.max(1),
            page: 1,
            malformed_streak: 0,
            done: false,
        }
    }
}

pub struct CatalogClient {
    http: HttpFetcher,
    base_url: String,
}

impl CatalogClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: &str,
        mut http_config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let key = HeaderValue::from_str(api_key).context("API key is not a valid header value")?;
        http_config.default_headers.insert(API_KEY_HEADER, key);
        let http = HttpFetcher::new(http_config)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.http = self.http.with_cancellation(cancel);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn list_locations(
        &self,
        country_ids: &[CountryId],
        page_size: u32,
    ) -> BoxStream<'_, Result<Location, CatalogError>> {
        self.paginate(
            "/v3/locations".to_string(),
            country_filter(country_ids),
            page_size,
            location_from_record,
        )
    }

    /// Locations with their embedded sensors, so a catalog sync needs one traversal.
    pub fn list_location_details(
        &self,
        country_ids: &[CountryId],
        page_size: u32,
    ) -> BoxStream<'_, Result<LocationDetail, CatalogError>> {
        self.paginate(
            "/v3/locations".to_string(),
            country_filter(country_ids),
            page_size,
            detail_from_record,
        )
    }

    /// Sensors embedded in the location listing, in one traversal of the locations.
    pub fn list_sensors_for_countries(
        &self,
        country_ids: &[CountryId],
        page_size: u32,
    ) -> BoxStream<'_, Result<Sensor, CatalogError>> {
        self.paginate(
            "/v3/locations".to_string(),
            country_filter(country_ids),
            page_size,
            sensors_from_location_record,
        )
    }

    pub fn list_sensors_by_location(
        &self,
        location_id: LocationId,
        page_size: u32,
    ) -> BoxStream<'_, Result<Sensor, CatalogError>> {
        self.paginate(
            format!("/v3/locations/{location_id}/sensors"),
            Vec::new(),
            page_size,
            sensors_from_sensor_record,
        )
    }

    pub fn list_parameters(
        &self,
        page_size: u32,
    ) -> BoxStream<'_, Result<Parameter, CatalogError>> {
        self.paginate(
            "/v3/parameters".to_string(),
            Vec::new(),
            page_size,
            parameter_from_record,
        )
    }

    pub fn list_countries(&self, page_size: u32) -> BoxStream<'_, Result<Country, CatalogError>> {
        self.paginate(
            "/v3/countries".to_string(),
            Vec::new(),
            page_size,
            country_from_record,
        )
    }

    fn paginate<W, T>(
        &self,
        endpoint: String,
        query: Vec<(&'static str, String)>,
        page_size: u32,
        extract: fn(W) -> Vec<T>,
    ) -> BoxStream<'_, Result<T, CatalogError>>
    where
        W: DeserializeOwned + Send + 'static,
        T: Send + 'static,
    {
        let cursor = PageCursor::new(endpoint, query, page_size);
        stream::try_unfold(cursor, move |mut cursor| async move {
            let records = self.next_page::<W>(&mut cursor).await?;
            Ok::<_, CatalogError>(records.map(|records| (records, cursor)))
        })
        .map_ok(move |records| {
            stream::iter(records.into_iter().flat_map(extract).map(Ok::<T, CatalogError>))
        })
        .try_flatten()
        .boxed()
    }

    async fn next_page<W: DeserializeOwned>(
        &self,
        cursor: &mut PageCursor,
    ) -> Result<Option<Vec<W>>, CatalogError> {
        loop {
            if cursor.done {
                return Ok(None);
            }
            if self.http.cancellation().is_cancelled() {
                return Err(CatalogError::Cancelled);
            }

            let page = cursor.page;
            let mut query = cursor.query.clone();
            query.push(("limit", cursor.page_size.to_string()));
            query.push(("page", page.to_string()));
            let url = format!("{}{}", self.base_url, cursor.endpoint);

            let response = self
                .http
                .get(&url, &query)
                .await
                .map_err(|err| CatalogError::from_fetch(&cursor.endpoint, err))?;
            cursor.page += 1;

            match serde_json::from_slice::<Page<W>>(&response.body) {
                Ok(parsed) => {
                    cursor.malformed_streak = 0;
                    cursor.done = parsed.is_last();
                    debug!(
                        endpoint = %cursor.endpoint,
                        page,
                        results = parsed.results.len(),
                        last = cursor.done,
                        "catalog page"
                    );
                    return Ok(Some(parsed.results));
                }
                Err(source) => {
                    cursor.malformed_streak += 1;
                    warn!(
                        endpoint = %cursor.endpoint,
                        page,
                        error = %source,
                        "malformed catalog page; skipping"
                    );
                    if cursor.malformed_streak > MAX_MALFORMED_PAGES {
                        return Err(CatalogError::MalformedPages {
                            endpoint: cursor.endpoint.clone(),
                            page,
                            count: cursor.malformed_streak,
                            source,
                        });
                    }
                }
            }
        }
    }
}

fn country_filter(country_ids: &[CountryId]) -> Vec<(&'static str, String)> {
    country_ids
        .iter()
        .map(|id| ("countries_id", id.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_envelope_is_parsed() {
        let body = r#"{"detail":[{"type":"greater_than_equal","loc":["query","limit"],"msg":"Input should be greater than or equal to 1","input":"0"},{"type":"other","loc":[],"msg":"second"}]}"#;
        let issue = parse_validation_error(body).expect("issue");
        assert_eq!(issue.kind, "greater_than_equal");
        assert_eq!(issue.msg, "Input should be greater than or equal to 1");
        assert_eq!(
            issue.to_string(),
            "greater_than_equal at `query.limit`: Input should be greater than or equal to 1 (input: \"0\")"
        );
    }

    #[test]
    fn json_encoded_issue_list_is_parsed() {
        let inner = r#"[{"type":"int_parsing","loc":["path","locations_id"],"msg":"Input should be a valid integer","input":"abc"}]"#;
        let body = serde_json::to_string(inner).unwrap();
        let issue = parse_validation_error(&body).expect("issue");
        assert_eq!(issue.kind, "int_parsing");
        assert_eq!(issue.loc.len(), 2);
    }

    #[test]
    fn unparseable_rejection_keeps_raw_body() {
        assert!(parse_validation_error("<html>bad</html>").is_none());
        let err = CatalogError::from_fetch(
            "/v3/locations",
            FetchError::HttpStatus {
                status: 422,
                url: "http://x/v3/locations".into(),
                body: "<html>bad</html>".into(),
            },
        );
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "catalog rejected request to /v3/locations: <html>bad</html>");
    }

    #[test]
    fn last_page_detection_uses_results_and_found() {
        let page = |n: usize, limit: u32, found: Option<Found>| Page {
            results: vec![0u8; n],
            meta: PageMeta {
                limit,
                found,
            },
        };
        assert!(page(0, 10, None).is_last());
        assert!(page(3, 10, Some(Found::AtLeast(">10".into()))).is_last());
        assert!(page(10, 10, Some(Found::Exact(10))).is_last());
        assert!(!page(10, 10, Some(Found::Exact(11))).is_last());
        assert!(!page(10, 10, Some(Found::AtLeast(">10".into()))).is_last());
        assert!(!page(10, 10, None).is_last());
    }

    #[test]
    fn location_record_maps_nullable_coverage() {
        let json = r#"{
            "id": 2178,
            "name": "Del Norte",
            "coordinates": {"latitude": 35.1353, "longitude": -106.584702},
            "datetimeFirst": null,
            "datetimeLast": {"utc": "2024-01-01T00:00:00Z", "local": "2023-12-31T17:00:00-07:00"},
            "country": {"id": 155, "code": "US", "name": "United States"},
            "sensors": [{"id": 3917, "name": "pm25 µg/m³", "parameter": {"id": 2, "name": "pm25", "units": "µg/m³", "displayName": "PM2.5"}}]
        }"#;
        let record: LocationRecord = serde_json::from_str(json).unwrap();
        let location = location_from_record(record.clone()).remove(0);
        assert_eq!(location.id, 2178);
        assert!(location.first_observed.is_none());
        assert!(location.last_observed.is_some());
        assert_eq!(location.country_id, Some(155));
        assert!(location.coverage_years().is_none());

        let sensors = sensors_from_location_record(record);
        assert_eq!(
            sensors,
            vec![Sensor {
                id: 3917,
                parameter_id: 2,
                parameter_name: "pm25".into(),
                parameter_units: "µg/m³".into(),
            }]
        );
    }
}
