//! Registry client: fetch, validate and persist one country's prefix list.

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

use crate::config::{Config, COUNTRY_PLACEHOLDER};
use crate::context::CallContext;
use crate::error::FetchError;
use crate::prefix_list::{PrefixList, PrefixStore};
use crate::validation::{validate_prefixes, CountryCode};

const RETRY_DELAY_MS: u64 = 2000;

/// Maximum registry response size (16 MB). The largest country list is a
/// few MB as JSON.
const MAX_RESPONSE_SIZE: usize = 16 * 1024 * 1024;

/// Knobs for [`PrefixSource`].
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub url_template: String,
    pub timeout: Duration,
    /// Total attempts per country, including the first.
    pub attempts: u32,
    /// Base delay, doubled after each failed attempt.
    pub retry_delay: Duration,
    pub min_prefixes: usize,
    pub regression_ratio: f64,
    pub max_concurrent: usize,
    pub max_body: usize,
}

impl FetchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url_template: config.registry_url.clone(),
            timeout: config.fetch_timeout(),
            attempts: config.fetch_retries.max(1),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
            min_prefixes: config.min_prefixes,
            regression_ratio: config.regression_ratio,
            max_concurrent: config.max_concurrent_fetches.max(1),
            max_body: MAX_RESPONSE_SIZE,
        }
    }
}

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// New data was validated and stored. `previous` is the list it
    /// replaced, kept so a failed apply can put it back.
    Updated {
        list: PrefixList,
        previous: Option<PrefixList>,
    },
    /// Registry data is not newer than the stored list, which is returned.
    NotModified(PrefixList),
}

impl FetchOutcome {
    pub fn list(&self) -> &PrefixList {
        match self {
            FetchOutcome::Updated { list, .. } | FetchOutcome::NotModified(list) => list,
        }
    }

    pub fn into_list(self) -> PrefixList {
        match self {
            FetchOutcome::Updated { list, .. } | FetchOutcome::NotModified(list) => list,
        }
    }

    pub fn is_modified(&self) -> bool {
        matches!(self, FetchOutcome::Updated { .. })
    }
}

#[derive(Debug, Deserialize)]
struct RegistryResponse {
    status: String,
    data: Option<RegistryData>,
}

#[derive(Debug, Deserialize)]
struct RegistryData {
    query_time: Option<String>,
    resources: Option<RegistryResources>,
}

#[derive(Debug, Deserialize)]
struct RegistryResources {
    ipv4: Option<Vec<serde_json::Value>>,
}

/// The parts of a registry reply the pipeline consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryPayload {
    pub query_time: DateTime<Utc>,
    pub ipv4: Vec<String>,
}

/// Parse a registry body. Errors are reasons suitable for a transient failure.
pub fn parse_response(body: &str) -> Result<RegistryPayload, String> {
    let response: RegistryResponse =
        serde_json::from_str(body).map_err(|e| format!("malformed registry response: {}", e))?;

    if response.status != "ok" {
        return Err(format!("registry status '{}'", response.status));
    }

    let data = response
        .data
        .ok_or_else(|| "registry response has no data".to_string())?;
    let raw_time = data
        .query_time
        .ok_or_else(|| "registry response has no query_time".to_string())?;
    let query_time = parse_query_time(&raw_time)
        .ok_or_else(|| format!("unparseable query_time '{}'", raw_time))?;
    let ipv4 = data
        .resources
        .and_then(|r| r.ipv4)
        .ok_or_else(|| "registry response has no ipv4 resources".to_string())?;

    // non-string entries count as rejects during validation
    let ipv4 = ipv4
        .into_iter()
        .map(|v| match v {
            serde_json::Value::String(s) => s,
            _ => String::new(),
        })
        .collect();

    Ok(RegistryPayload { query_time, ipv4 })
}

/// Parse an ISO-8601 timestamp. A missing zone suffix means UTC.
pub fn parse_query_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Registry URL for one country.
pub fn registry_url(template: &str, country: &CountryCode) -> String {
    template.replace(COUNTRY_PLACEHOLDER, country.as_str())
}

/// Fetches per-country prefix lists and owns their on-disk copies.
pub struct PrefixSource {
    client: Client,
    store: PrefixStore,
    settings: FetchSettings,
}

impl PrefixSource {
    pub fn new(store: PrefixStore, settings: FetchSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(format!("geoallow/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            store,
            settings,
        })
    }

    pub fn store(&self) -> &PrefixStore {
        &self.store
    }

    /// Last stored list for `country`, if any.
    pub fn stored(&self, country: &CountryCode) -> Option<PrefixList> {
        self.store.load(country)
    }

    /// Drop the stored list so a later Add starts without a regression baseline.
    pub fn forget(&self, country: &CountryCode) -> anyhow::Result<()> {
        self.store.remove(country)
    }

    /// Put back the list a fetch replaced, or delete it if there was none.
    ///
    /// Used when the new list never reached the firewall, so the next run
    /// sees the registry data as new again.
    pub fn roll_back(
        &self,
        country: &CountryCode,
        previous: Option<&PrefixList>,
    ) -> anyhow::Result<()> {
        match previous {
            Some(list) => self.store.save(list),
            None => self.store.remove(country),
        }
    }

    /// Fetch, validate, and persist one country's list.
    pub async fn fetch(
        &self,
        ctx: &CallContext,
        country: &CountryCode,
    ) -> Result<FetchOutcome, FetchError> {
        self.fetch_inner(country)
            .instrument(ctx.span("prefix_source"))
            .await
    }

    /// Fetch several countries concurrently, bounded by `max_concurrent`.
    /// Results come back in input order.
    pub async fn fetch_many(
        &self,
        ctx: &CallContext,
        countries: &[CountryCode],
    ) -> Vec<(CountryCode, Result<FetchOutcome, FetchError>)> {
        let mut results: Vec<(usize, CountryCode, Result<FetchOutcome, FetchError>)> =
            stream::iter(countries.iter().enumerate().map(|(i, cc)| async move {
                (i, cc.clone(), self.fetch(ctx, cc).await)
            }))
            .buffer_unordered(self.settings.max_concurrent)
            .collect()
            .await;
        results.sort_by_key(|(i, _, _)| *i);
        results.into_iter().map(|(_, cc, r)| (cc, r)).collect()
    }

    async fn fetch_inner(&self, country: &CountryCode) -> Result<FetchOutcome, FetchError> {
        info!("Fetching {}...", country);
        let url = registry_url(&self.settings.url_template, country);

        let body = self
            .download(&url)
            .await
            .map_err(|reason| FetchError::transient(country, reason))?;

        let payload = parse_response(&body).map_err(|reason| FetchError::transient(country, reason))?;

        let validated = validate_prefixes(&payload.ipv4);
        if validated.rejected > 0 {
            warn!(
                "{}: dropped {} malformed entries ({:.1}%)",
                country,
                validated.rejected,
                validated.rejected_ratio() * 100.0
            );
        }
        if validated.accepted.len() < self.settings.min_prefixes {
            return Err(FetchError::transient(
                country,
                format!(
                    "only {} valid prefixes (minimum {})",
                    validated.accepted.len(),
                    self.settings.min_prefixes
                ),
            ));
        }

        let previous = self.store.load(country);
        if let Some(prev) = &previous {
            if payload.query_time <= prev.source_timestamp {
                info!(
                    "{}: registry data from {} is not newer than stored list",
                    country, payload.query_time
                );
                return Ok(FetchOutcome::NotModified(prev.clone()));
            }

            let floor = prev.len() as f64 * self.settings.regression_ratio;
            if (validated.accepted.len() as f64) < floor {
                return Err(FetchError::permanent(
                    country,
                    format!(
                        "prefix count dropped from {} to {}, probable partial registry data",
                        prev.len(),
                        validated.accepted.len()
                    ),
                ));
            }
        }

        let list = PrefixList {
            country_code: country.clone(),
            source_timestamp: payload.query_time,
            prefixes: validated.accepted,
        };
        self.store
            .save(&list)
            .map_err(|e| FetchError::transient(country, format!("{:#}", e)))?;

        info!("Fetched {} - {} prefixes", country, format_count(list.len()));
        Ok(FetchOutcome::Updated { list, previous })
    }

    /// GET with retry and size limits.
    async fn download(&self, url: &str) -> Result<String, String> {
        let mut last_error = None;

        for attempt in 0..self.settings.attempts {
            if attempt > 0 {
                let delay = self.settings.retry_delay * (1 << (attempt - 1).min(6));
                debug!("Retry {} after {:?} for {}", attempt, delay, url);
                tokio::time::sleep(delay).await;
            }

            match self.client.get(url).send().await {
                Ok(response) => {
                    if !response.status().is_success() {
                        last_error = Some(format!("HTTP {}", response.status()));
                        continue;
                    }
                    if let Some(len) = response.content_length() {
                        if len as usize > self.settings.max_body {
                            return Err(format!(
                                "response too large: {} bytes (max: {} bytes)",
                                len, self.settings.max_body
                            ));
                        }
                    }
                    let body = match response.text().await {
                        Ok(b) => b,
                        Err(e) => {
                            last_error = Some(format!("failed to read response body: {}", e));
                            continue;
                        }
                    };
                    if body.len() > self.settings.max_body {
                        return Err(format!(
                            "downloaded content too large: {} bytes (max: {} bytes)",
                            body.len(),
                            self.settings.max_body
                        ));
                    }
                    return Ok(body);
                }
                Err(e) => {
                    last_error = Some(if e.is_timeout() {
                        format!("timed out after {:?}", self.settings.timeout)
                    } else {
                        format!("request failed: {}", e)
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "no attempt made".to_string()))
    }
}

/// Format count with K/M suffix
pub fn format_count(count: usize) -> String {
    if count >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Action, Trigger};
    use chrono::TimeZone;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn body(status: &str, query_time: &str, prefixes: &[String]) -> serde_json::Value {
        serde_json::json!({
            "status": status,
            "data": {
                "query_time": query_time,
                "resources": { "ipv4": prefixes, "ipv6": [], "asn": [] }
            }
        })
    }

    fn prefixes(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("{}.{}.0.0/16", 1 + i / 256, i % 256))
            .collect()
    }

    fn source(server: &MockServer, dir: &TempDir) -> PrefixSource {
        let settings = FetchSettings {
            url_template: format!(
                "{}/data/country-resource-list/data.json?resource={{country}}",
                server.uri()
            ),
            timeout: Duration::from_secs(5),
            attempts: 2,
            retry_delay: Duration::from_millis(1),
            min_prefixes: 100,
            regression_ratio: 0.9,
            max_concurrent: 2,
            max_body: MAX_RESPONSE_SIZE,
        };
        PrefixSource::new(PrefixStore::new(dir.path()), settings).unwrap()
    }

    async fn serve(server: &MockServer, cc: &str, json: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/data/country-resource-list/data.json"))
            .and(query_param("resource", cc))
            .respond_with(ResponseTemplate::new(200).set_body_json(json))
            .mount(server)
            .await;
    }

    fn ctx() -> CallContext {
        CallContext::new(Action::Add, Trigger::Manual)
    }

    fn us() -> CountryCode {
        "US".parse().unwrap()
    }

    #[test]
    fn test_parse_query_time_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_query_time("2024-03-01T12:00:00"), Some(expected));
        assert_eq!(parse_query_time("2024-03-01T12:00:00Z"), Some(expected));
        assert_eq!(parse_query_time("2024-03-01T14:00:00+02:00"), Some(expected));
        assert!(parse_query_time("2024-03-01T12:00:00.123").is_some());
        assert!(parse_query_time("yesterday").is_none());
    }

    #[test]
    fn test_parse_response_shapes() {
        let ok = body("ok", "2024-03-01T12:00:00", &prefixes(3)).to_string();
        assert_eq!(parse_response(&ok).unwrap().ipv4.len(), 3);

        let bad_status = body("error", "2024-03-01T12:00:00", &[]).to_string();
        assert!(parse_response(&bad_status).unwrap_err().contains("status"));

        assert!(parse_response("{\"status\":\"ok\"}").is_err());
        assert!(parse_response("<html>").is_err());
        assert!(parse_response(
            "{\"status\":\"ok\",\"data\":{\"query_time\":\"2024-03-01T12:00:00\",\"resources\":{}}}"
        )
        .is_err());
    }

    #[test]
    fn test_parse_response_non_string_entries() {
        let json = "{\"status\":\"ok\",\"data\":{\"query_time\":\"2024-03-01T12:00:00\",\"resources\":{\"ipv4\":[\"1.0.0.0/8\", 42]}}}";
        let payload = parse_response(json).unwrap();
        let validated = validate_prefixes(&payload.ipv4);
        assert_eq!(validated.accepted.len(), 1);
        assert_eq!(validated.rejected, 1);
    }

    #[test]
    fn test_registry_url() {
        let url = registry_url(crate::config::DEFAULT_REGISTRY_URL, &us());
        assert!(url.ends_with("resource=US"));
    }

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(500), "500");
        assert_eq!(format_count(1500), "1.5K");
        assert_eq!(format_count(1_500_000), "1.5M");
    }

    #[tokio::test]
    async fn test_fetch_success_stores_list() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        serve(&server, "US", body("ok", "2024-03-01T12:00:00", &prefixes(500))).await;

        let src = source(&server, &dir);
        let outcome = src.fetch(&ctx(), &us()).await.unwrap();
        assert!(outcome.is_modified());
        assert_eq!(outcome.list().len(), 500);

        let stored = src.stored(&us()).unwrap();
        assert_eq!(
            stored.source_timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_fetch_same_data_twice_is_not_modified() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        serve(&server, "US", body("ok", "2024-03-01T12:00:00", &prefixes(200))).await;

        let src = source(&server, &dir);
        assert!(src.fetch(&ctx(), &us()).await.unwrap().is_modified());
        let before = std::fs::read(src.store().path_for(&us())).unwrap();

        let second = src.fetch(&ctx(), &us()).await.unwrap();
        assert!(matches!(second, FetchOutcome::NotModified(_)));
        assert_eq!(std::fs::read(src.store().path_for(&us())).unwrap(), before);
    }

    #[tokio::test]
    async fn test_fetch_registry_error_status_is_transient() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        serve(&server, "US", body("error", "2024-03-01T12:00:00", &[])).await;

        let err = source(&server, &dir).fetch(&ctx(), &us()).await.unwrap_err();
        assert!(matches!(err, FetchError::Transient { .. }));
    }

    #[tokio::test]
    async fn test_fetch_below_floor_is_transient() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let mut entries = prefixes(99);
        entries.push("999.1.1.1/8".to_string());
        serve(&server, "US", body("ok", "2024-03-01T12:00:00", &entries)).await;

        let src = source(&server, &dir);
        let err = src.fetch(&ctx(), &us()).await.unwrap_err();
        assert!(matches!(err, FetchError::Transient { .. }));
        assert!(src.stored(&us()).is_none());
    }

    #[tokio::test]
    async fn test_fetch_http_error_retries_then_fails() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let err = source(&server, &dir).fetch(&ctx(), &us()).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_fetch_regression_keeps_stored_list() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let store = PrefixStore::new(dir.path());
        let previous = PrefixList {
            country_code: us(),
            source_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            prefixes: prefixes(1000).iter().map(|p| p.parse().unwrap()).collect(),
        };
        store.save(&previous).unwrap();

        serve(&server, "US", body("ok", "2024-03-01T12:00:00", &prefixes(899))).await;

        let src = source(&server, &dir);
        let err = src.fetch(&ctx(), &us()).await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent { .. }));
        assert_eq!(src.stored(&us()), Some(previous));
    }

    #[tokio::test]
    async fn test_fetch_at_regression_threshold_is_accepted() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let store = PrefixStore::new(dir.path());
        let previous = PrefixList {
            country_code: us(),
            source_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            prefixes: prefixes(1000).iter().map(|p| p.parse().unwrap()).collect(),
        };
        store.save(&previous).unwrap();

        // exactly 90% of the stored count
        serve(&server, "US", body("ok", "2024-03-01T12:00:00", &prefixes(900))).await;

        let src = source(&server, &dir);
        let outcome = src.fetch(&ctx(), &us()).await.unwrap();
        assert!(outcome.is_modified());
        assert_eq!(outcome.list().len(), 900);
        assert_eq!(src.stored(&us()).unwrap().len(), 900);
        match outcome {
            FetchOutcome::Updated { previous: prev, .. } => assert_eq!(prev, Some(previous)),
            other => panic!("expected Updated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_roll_back_restores_replaced_list() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        serve(&server, "US", body("ok", "2024-03-01T12:00:00", &prefixes(150))).await;

        let src = source(&server, &dir);
        let outcome = src.fetch(&ctx(), &us()).await.unwrap();
        let FetchOutcome::Updated { previous, .. } = outcome else {
            panic!("first fetch must store new data");
        };
        assert!(previous.is_none());

        // nothing to go back to: the list is dropped and the data is new again
        src.roll_back(&us(), previous.as_ref()).unwrap();
        assert!(src.stored(&us()).is_none());
        assert!(src.fetch(&ctx(), &us()).await.unwrap().is_modified());

        let stored = src.stored(&us()).unwrap();
        let older = PrefixList {
            source_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ..stored
        };
        src.roll_back(&us(), Some(&older)).unwrap();
        assert_eq!(src.stored(&us()), Some(older));
    }

    #[tokio::test]
    async fn test_fetch_many_keeps_order_and_isolates_failures() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        serve(&server, "US", body("ok", "2024-03-01T12:00:00", &prefixes(150))).await;
        serve(&server, "XX", body("error", "2024-03-01T12:00:00", &[])).await;
        serve(&server, "DE", body("ok", "2024-03-01T12:00:00", &prefixes(120))).await;

        let countries: Vec<CountryCode> = ["US", "XX", "DE"]
            .iter()
            .map(|c| c.parse().unwrap())
            .collect();
        let results = source(&server, &dir).fetch_many(&ctx(), &countries).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0.as_str(), "US");
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
        assert_eq!(results[2].1.as_ref().unwrap().list().len(), 120);
    }

    #[tokio::test]
    async fn test_forget_removes_stored_list() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        serve(&server, "US", body("ok", "2024-03-01T12:00:00", &prefixes(100))).await;

        let src = source(&server, &dir);
        src.fetch(&ctx(), &us()).await.unwrap();
        src.forget(&us()).unwrap();
        assert!(src.stored(&us()).is_none());
    }
}
