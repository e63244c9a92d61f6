//! Current-conditions lookup backed by Open-Meteo
//!
//! Resolves a free-form location name with the geocoding API, then fetches the
//! current conditions for the first match.

use super::ToolError;
use crate::gemini::{Behavior, FunctionDeclaration};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub const GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";
pub const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CURRENT_FIELDS: &str = "temperature_2m,apparent_temperature,relative_humidity_2m,wind_speed_10m,wind_gusts_10m,weather_code";

pub fn declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: "get_weather".to_string(),
        description: "Get current weather conditions for any location worldwide".to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "location": {
                    "type": "STRING",
                    "description": "The city name, e.g. 'New York', 'London', 'Tokyo'"
                }
            },
            "required": ["location"]
        }),
        behavior: Some(Behavior::NonBlocking),
    }
}

#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Option<Vec<GeocodedPlace>>,
}

#[derive(Debug, Deserialize)]
struct GeocodedPlace {
    latitude: f64,
    longitude: f64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: CurrentConditions,
}

#[derive(Debug, Deserialize)]
struct CurrentConditions {
    temperature_2m: f64,
    apparent_temperature: f64,
    relative_humidity_2m: f64,
    wind_speed_10m: f64,
    wind_gusts_10m: f64,
    weather_code: u32,
}

/// Result returned to the model
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeatherReport {
    pub temperature: f64,
    pub feels_like: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub wind_gust: f64,
    pub conditions: String,
    pub location: String,
    pub unit: String,
}

/// WMO weather interpretation code to a label.
pub fn weather_condition(code: u32) -> &'static str {
    match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 => "Fog",
        48 => "Depositing rime fog",
        51 => "Light drizzle",
        53 => "Moderate drizzle",
        55 => "Dense drizzle",
        61 => "Slight rain",
        63 => "Moderate rain",
        65 => "Heavy rain",
        71 => "Slight snow",
        73 => "Moderate snow",
        75 => "Heavy snow",
        80 => "Slight rain showers",
        81 => "Moderate rain showers",
        82 => "Violent rain showers",
        95 => "Thunderstorm",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone)]
pub struct WeatherClient {
    http: reqwest::Client,
    geocoding_url: String,
    forecast_url: String,
}

impl Default for WeatherClient {
    fn default() -> Self {
        Self::with_endpoints(GEOCODING_URL, FORECAST_URL)
    }
}

impl WeatherClient {
    pub fn with_endpoints(geocoding_url: &str, forecast_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            geocoding_url: geocoding_url.to_string(),
            forecast_url: forecast_url.to_string(),
        }
    }

    /// Look up current conditions for `location`.
    pub async fn fetch(&self, location: &str) -> Result<WeatherReport, ToolError> {
        let geocoded: GeocodingResponse = self
            .http
            .get(&self.geocoding_url)
            .query(&[("name", location), ("count", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let place = geocoded
            .results
            .and_then(|r| r.into_iter().next())
            .ok_or_else(|| ToolError::LocationNotFound(location.to_string()))?;

        debug!(
            "Resolved '{}' to {} ({}, {})",
            location, place.name, place.latitude, place.longitude
        );

        let forecast: ForecastResponse = self
            .http
            .get(&self.forecast_url)
            .query(&[
                ("latitude", place.latitude.to_string()),
                ("longitude", place.longitude.to_string()),
                ("current", CURRENT_FIELDS.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let current = forecast.current;
        Ok(WeatherReport {
            temperature: current.temperature_2m,
            feels_like: current.apparent_temperature,
            humidity: current.relative_humidity_2m,
            wind_speed: current.wind_speed_10m,
            wind_gust: current.wind_gusts_10m,
            conditions: weather_condition(current.weather_code).to_string(),
            location: place.name,
            unit: "°C".to_string(),
        })
    }
}
