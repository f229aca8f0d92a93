use std::time::Duration;

pub const USER_AGENT: &str = "city_transport_map_app/0.1";

pub const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";
pub const OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";
pub const OVERPASS_TIMEOUT_S: u32 = 180;

pub const GEOCODE_TIMEOUT: Duration = Duration::from_secs(10);
pub const GEOCODE_RETRIES: u32 = 3;
pub const GEOCODE_RETRY_DELAY: Duration = Duration::from_secs(2);

pub const GEOCODE_TTL: Duration = Duration::from_secs(86_400);
pub const BUFFER_TTL: Duration = Duration::from_secs(3_600);
pub const NETWORK_TTL: Duration = Duration::from_secs(3_600);
pub const MAP_TTL: Duration = Duration::from_secs(3_600);
pub const MAP_CACHE_CAPACITY: u64 = 32;
/// Encoded PNGs kept per (map, DPI), bounded by total size in bytes.
pub const PNG_CACHE_BYTES: u64 = 256 * 1024 * 1024;
/// Rasterizations allowed at once; a 600 DPI pixmap alone takes ~576 MB.
pub const RENDER_SLOTS: usize = 2;

pub const DEFAULT_CITY: &str = "College Station, Texas";
pub const MIN_RADIUS_KM: u32 = 5;
pub const MAX_RADIUS_KM: u32 = 50;
pub const DEFAULT_RADIUS_KM: u32 = 15;
pub const DEFAULT_EPSG: u32 = 2277;

pub const DPI_OPTIONS: [u32; 4] = [72, 150, 300, 600];
pub const DEFAULT_DPI: u32 = 150;
pub const PREVIEW_DPI: u32 = 72;

/// Figure edge length in inches; the image is square.
pub const FIGURE_SIZE_IN: f64 = 20.0;

pub const FONT_URL: &str = "https://github.com/google/fonts/raw/main/ofl/lato/Lato-Regular.ttf";
pub const FONT_FILE: &str = "Lato-Regular.ttf";

pub const DEFAULT_DATA_DIR: &str = "data";
pub const OSM_CACHE_SUBDIR: &str = "osm_cache";
pub const FONT_SUBDIR: &str = "fonts";

pub const DEFAULT_BIND: &str = "0.0.0.0:8501";
