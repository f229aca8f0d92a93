use thiserror::Error;

/// Failures a user can see. The display strings are shown verbatim in the UI.
#[derive(Debug, Clone, Error)]
pub enum MapError {
    #[error("City '{0}' not found. Try adding state/country (e.g., 'Paris, France')")]
    CityNotFound(String),
    #[error("Geocoding service timed out. Please try again.")]
    GeocodeTimeout,
    #[error("Cannot connect to geocoding service. Please try again in a moment.")]
    GeocodeConnection,
    #[error("Too many requests. Please wait a minute and try again.")]
    RateLimited,
    #[error("Geocoding error: {0}")]
    Geocode(String),
    #[error("Error creating buffer: {0}")]
    Buffer(String),
    #[error("Error downloading {network} network: {reason}")]
    Download { network: String, reason: String },
    #[error("No networks could be downloaded. Try a different city or smaller radius.")]
    NoNetworks,
    #[error("Error generating map: {0}")]
    Render(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Unsupported coordinate system EPSG:{0}")]
    UnsupportedCrs(u32),
    #[error("Map '{0}' not found or expired. Generate it again.")]
    MapNotFound(String),
}

impl MapError {
    /// Classify a geocoder failure message the way users expect to read it.
    pub fn from_geocode_message(msg: &str) -> Self {
        let lower = msg.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            MapError::GeocodeTimeout
        } else if lower.contains("connection") || lower.contains("connect") {
            MapError::GeocodeConnection
        } else if lower.contains("rate limit") || lower.contains("too many requests") {
            MapError::RateLimited
        } else {
            MapError::Geocode(msg.to_string())
        }
    }

    /// Classify a failed Nominatim request. HTTP statuses are classified
    /// before any message matching, and the request URL is never inspected.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MapError::GeocodeTimeout
        } else if err.is_connect() {
            MapError::GeocodeConnection
        } else if let Some(status) = err.status() {
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                MapError::RateLimited
            } else {
                MapError::Geocode(format!("HTTP {status}"))
            }
        } else {
            MapError::from_geocode_message(&err.without_url().to_string())
        }
    }

    /// True for failures caused by an upstream service rather than the request.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            MapError::GeocodeTimeout
                | MapError::GeocodeConnection
                | MapError::Geocode(_)
                | MapError::Download { .. }
                | MapError::NoNetworks
        )
    }
}
