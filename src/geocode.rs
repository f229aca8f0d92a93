use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::*;
use crate::error::MapError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    display_name: String,
}

/// Look up a city through Nominatim, retrying failed requests.
pub async fn geocode_city(client: &reqwest::Client, city: &str) -> Result<Location, MapError> {
    geocode_with(client, NOMINATIM_URL, GEOCODE_RETRY_DELAY, city).await
}

async fn geocode_with(
    client: &reqwest::Client,
    url: &str,
    retry_delay: Duration,
    city: &str,
) -> Result<Location, MapError> {
    let city = city.trim();
    if city.is_empty() {
        return Err(MapError::InvalidRequest("Enter a city name".into()));
    }

    let mut attempt = 1;
    loop {
        match query_nominatim(client, url, city).await {
            Ok(body) => {
                let location = parse_nominatim(&body, city)?;
                tracing::info!("Successfully geocoded: {city} -> {}", location.address);
                return Ok(location);
            }
            Err(e) if attempt < GEOCODE_RETRIES => {
                tracing::warn!("Geocoding attempt {attempt}/{GEOCODE_RETRIES} failed: {e}");
                tokio::time::sleep(retry_delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!("Geocoding error: {e}");
                return Err(MapError::from_reqwest(e));
            }
        }
    }
}

async fn query_nominatim(
    client: &reqwest::Client,
    url: &str,
    city: &str,
) -> Result<String, reqwest::Error> {
    client
        .get(url)
        .query(&[
            ("q", city),
            ("format", "jsonv2"),
            ("limit", "1"),
            ("addressdetails", "1"),
            ("accept-language", "en"),
        ])
        .timeout(GEOCODE_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}

fn parse_nominatim(body: &str, city: &str) -> Result<Location, MapError> {
    let places: Vec<NominatimPlace> = serde_json::from_str(body)
        .map_err(|e| MapError::Geocode(format!("unexpected geocoder response: {e}")))?;

    let place = places
        .into_iter()
        .next()
        .ok_or_else(|| MapError::CityNotFound(city.to_string()))?;

    let latitude: f64 = place
        .lat
        .parse()
        .map_err(|_| MapError::Geocode(format!("bad latitude '{}'", place.lat)))?;
    let longitude: f64 = place
        .lon
        .parse()
        .map_err(|_| MapError::Geocode(format!("bad longitude '{}'", place.lon)))?;

    Ok(Location {
        address: place.display_name,
        latitude,
        longitude,
    })
}
