use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::{sync::Arc, time::Duration};
use strum::Display;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::config::TariffConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TariffError {
    #[error("tariff collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Price level of a calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DayColor {
    Normal,
    Peak,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TariffSource: Send + Sync {
    async fn day_color(&self, date: NaiveDate) -> Result<DayColor, TariffError>;
}

/// Used when the tariff integration is switched off.
#[derive(Debug, Default, Clone)]
pub struct DisabledTariff;

#[async_trait]
impl TariffSource for DisabledTariff {
    async fn day_color(&self, _date: NaiveDate) -> Result<DayColor, TariffError> {
        Err(TariffError::Unavailable("tariff integration disabled".to_string()))
    }
}

/// Client for the Tempo day-color API (`/jourTempo/{date}`).
#[derive(Clone)]
pub struct TempoTariffClient {
    base_url: String,
    client: ClientWithMiddleware,
    cache: Arc<RwLock<HashMap<NaiveDate, (Instant, DayColor)>>>,
    ttl: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JourTempo {
    #[serde(default)]
    code_jour: Option<u8>,
    #[serde(default)]
    lib_couleur: Option<String>,
}

impl TempoTariffClient {
    pub fn new(cfg: &TariffConfig) -> anyhow::Result<Self> {
        Self::with_backoff(
            cfg.base_url.clone(),
            Duration::from_secs(cfg.http_timeout_seconds),
            Duration::from_secs(cfg.cache_ttl_seconds),
            cfg.max_retries,
            Duration::from_millis(500),
        )
    }

    pub fn with_backoff(
        base_url: String,
        timeout: Duration,
        ttl: Duration,
        max_retries: u32,
        min_backoff: Duration,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("battery-fleet-controller/", env!("CARGO_PKG_VERSION"))),
        );
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(min_backoff, min_backoff.saturating_mul(20))
            .build_with_max_retries(max_retries);
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Ok(Self {
            base_url,
            client,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        })
    }

    fn url_for(&self, date: NaiveDate) -> String {
        format!(
            "{}/jourTempo/{}",
            self.base_url.trim_end_matches('/'),
            date.format("%Y-%m-%d")
        )
    }

    async fn fetch(&self, date: NaiveDate) -> Result<DayColor, TariffError> {
        let resp = self
            .client
            .get(self.url_for(date))
            .send()
            .await
            .map_err(|e| TariffError::Unavailable(format!("tempo GET failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TariffError::Unavailable(format!("tempo API error: HTTP {status}")));
        }
        let jour: JourTempo = resp
            .json()
            .await
            .map_err(|e| TariffError::Unavailable(format!("tempo JSON parse failed: {e}")))?;
        debug!(%date, code = ?jour.code_jour, color = ?jour.lib_couleur, "tempo day fetched");

        // 1 = blue, 2 = white, 3 = red; 0 means the color is not published yet
        match jour.code_jour {
            Some(3) => Ok(DayColor::Peak),
            Some(1) | Some(2) => Ok(DayColor::Normal),
            other => Err(TariffError::Unavailable(format!(
                "no tempo color for {date} (code {other:?})"
            ))),
        }
    }
}

#[async_trait]
impl TariffSource for TempoTariffClient {
    async fn day_color(&self, date: NaiveDate) -> Result<DayColor, TariffError> {
        {
            let cache = self.cache.read().await;
            if let Some((at, color)) = cache.get(&date) {
                if at.elapsed() < self.ttl {
                    return Ok(*color);
                }
            }
        }

        let color = self.fetch(date).await?;
        self.cache.write().await.insert(date, (Instant::now(), color));
        Ok(color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> TempoTariffClient {
        TempoTariffClient::with_backoff(
            server.uri(),
            Duration::from_secs(2),
            Duration::from_secs(3600),
            2,
            Duration::from_millis(5),
        )
        .unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
    }

    #[tokio::test]
    async fn red_day_is_peak_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jourTempo/2026-01-15"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dateJour": "2026-01-15", "codeJour": 3, "libCouleur": "Rouge"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tariff = client(&server);
        assert_eq!(tariff.day_color(date()).await.unwrap(), DayColor::Peak);
        assert_eq!(tariff.day_color(date()).await.unwrap(), DayColor::Peak);
    }

    #[tokio::test]
    async fn unpublished_color_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dateJour": "2026-01-15", "codeJour": 0, "libCouleur": "Inconnu"
            })))
            .mount(&server)
            .await;

        let err = client(&server).day_color(date()).await.unwrap_err();
        assert!(matches!(err, TariffError::Unavailable(_)));
    }

    #[tokio::test]
    async fn transient_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dateJour": "2026-01-15", "codeJour": 2, "libCouleur": "Blanc"
            })))
            .mount(&server)
            .await;

        assert_eq!(client(&server).day_color(date()).await.unwrap(), DayColor::Normal);
    }

    #[tokio::test]
    async fn disabled_tariff_is_always_unavailable() {
        assert!(DisabledTariff.day_color(date()).await.is_err());
    }
}
