//! HTTP reverse geocoder backed by OpenStreetMap Nominatim.
//!
//! Nominatim's usage policy allows one request per second and requires an
//! identifying User-Agent. Requests are spaced accordingly and retried with
//! exponential backoff on 429.

use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Result, TripError};
use crate::geocode::{Geocoder, ResolvedAddress};

const DEFAULT_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const MIN_REQUEST_SPACING: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 3;

/// Reverse lookup response (only the fields used here)
#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
    error: Option<String>,
}

/// Reverse geocoder for the Nominatim `/reverse` endpoint.
pub struct NominatimGeocoder {
    client: Client,
    base_url: String,
    language: String,
    last_request: Mutex<Option<Instant>>,
}

impl NominatimGeocoder {
    /// Create a geocoder against the public Nominatim instance.
    pub fn new(user_agent: &str) -> Result<Self> {
        Self::with_base_url(user_agent, DEFAULT_BASE_URL)
    }

    /// Create a geocoder against a self-hosted instance.
    pub fn with_base_url(user_agent: &str, base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TripError::Geocoding {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            language: "zh-TW".to_string(),
            last_request: Mutex::new(None),
        })
    }

    /// Preferred response language (`Accept-Language`).
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    /// Map link for a coordinate.
    pub fn maps_url(latitude: f64, longitude: f64) -> String {
        format!(
            "https://www.openstreetmap.org/?mlat={:.6}&mlon={:.6}#map=17/{:.6}/{:.6}",
            latitude, longitude, latitude, longitude
        )
    }

    async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < MIN_REQUEST_SPACING {
                tokio::time::sleep(MIN_REQUEST_SPACING - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn lookup(&self, latitude: f64, longitude: f64) -> Result<ResolvedAddress> {
        let url = format!("{}/reverse", self.base_url);
        let lat = format!("{:.6}", latitude);
        let lon = format!("{:.6}", longitude);
        let mut retries = 0;

        loop {
            self.wait_turn().await;

            let response = self
                .client
                .get(&url)
                .query(&[
                    ("format", "jsonv2"),
                    ("lat", lat.as_str()),
                    ("lon", lon.as_str()),
                    ("zoom", "18"),
                ])
                .header("Accept-Language", &self.language)
                .send()
                .await
                .map_err(|e| TripError::Geocoding {
                    message: e.to_string(),
                })?;

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RETRIES {
                    return Err(TripError::Geocoding {
                        message: "Max retries exceeded (429)".to_string(),
                    });
                }
                // Exponential backoff: 2s, 4s, 8s
                let backoff = Duration::from_millis(1000 * (1 << retries.min(4)));
                warn!(
                    "[NominatimGeocoder] 429, retry {} after {:?}",
                    retries, backoff
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            if !status.is_success() {
                return Err(TripError::Geocoding {
                    message: format!("HTTP {}", status),
                });
            }

            let body: ReverseResponse = response.json().await.map_err(|e| TripError::Geocoding {
                message: format!("Parse error: {}", e),
            })?;

            if let Some(error) = body.error {
                return Err(TripError::Geocoding { message: error });
            }

            let address = body
                .display_name
                .filter(|name| !name.trim().is_empty())
                .ok_or_else(|| TripError::Geocoding {
                    message: "No address in response".to_string(),
                })?;

            debug!("[NominatimGeocoder] ({}, {}) -> {}", lat, lon, address);
            return Ok(ResolvedAddress {
                address,
                maps_url: Some(Self::maps_url(latitude, longitude)),
            });
        }
    }
}

impl Geocoder for NominatimGeocoder {
    fn reverse(&self, latitude: f64, longitude: f64) -> BoxFuture<'_, Result<ResolvedAddress>> {
        Box::pin(self.lookup(latitude, longitude))
    }
}
