use axum::body::Bytes;
use moka::future::Cache;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer::{StudyArea, create_city_buffer};
use crate::config::*;
use crate::crs::Crs;
use crate::error::MapError;
use crate::geocode::{Location, geocode_city};
use crate::network::StreetNetwork;
use crate::osm::{NetworkType, download_osm_network};
use crate::pipeline::GeneratedMap;

/// Bit patterns of (lat, lon, metres) plus the EPSG code.
type BufferKey = (u64, u64, u64, u32);

/// TTL memoisation around the expensive steps. Only successes are stored, so a
/// failed lookup is retried on the next request.
#[derive(Clone)]
pub struct Caches {
    geocode: Cache<String, Location>,
    buffer: Cache<BufferKey, Arc<StudyArea>>,
    network: Cache<(String, NetworkType), Arc<StreetNetwork>>,
    maps: Cache<String, Arc<GeneratedMap>>,
    png: Cache<(String, u32), Bytes>,
    osm_dir: PathBuf,
}

impl Caches {
    pub fn new(osm_dir: impl Into<PathBuf>) -> Self {
        Self {
            geocode: Cache::builder().time_to_live(GEOCODE_TTL).build(),
            buffer: Cache::builder().time_to_live(BUFFER_TTL).build(),
            network: Cache::builder().time_to_live(NETWORK_TTL).build(),
            maps: Cache::builder()
                .max_capacity(MAP_CACHE_CAPACITY)
                .time_to_live(MAP_TTL)
                .build(),
            png: Cache::builder()
                .weigher(|_, png: &Bytes| u32::try_from(png.len()).unwrap_or(u32::MAX))
                .max_capacity(PNG_CACHE_BYTES)
                .time_to_live(MAP_TTL)
                .build(),
            osm_dir: osm_dir.into(),
        }
    }

    pub fn osm_dir(&self) -> &Path {
        &self.osm_dir
    }

    pub async fn geocode(
        &self,
        client: &reqwest::Client,
        city: &str,
    ) -> Result<Location, MapError> {
        let key = city.trim().to_lowercase();
        self.geocode
            .try_get_with(key, geocode_city(client, city))
            .await
            .map_err(unwrap_shared)
    }

    pub async fn buffer(
        &self,
        latitude: f64,
        longitude: f64,
        buffer_meters: f64,
        crs: Crs,
    ) -> Result<Arc<StudyArea>, MapError> {
        let key = (
            latitude.to_bits(),
            longitude.to_bits(),
            buffer_meters.to_bits(),
            crs.epsg(),
        );
        self.buffer
            .try_get_with(key, async {
                create_city_buffer(latitude, longitude, buffer_meters, crs).map(Arc::new)
            })
            .await
            .map_err(unwrap_shared)
    }

    pub async fn network(
        &self,
        client: &reqwest::Client,
        area: &StudyArea,
        network_type: NetworkType,
    ) -> Result<Arc<StreetNetwork>, MapError> {
        self.network
            .try_get_with((area.wkt(), network_type), async {
                download_osm_network(client, area, network_type, &self.osm_dir)
                    .await
                    .map(Arc::new)
            })
            .await
            .map_err(unwrap_shared)
    }

    pub async fn store_map(&self, id: String, map: Arc<GeneratedMap>) {
        self.maps.insert(id, map).await;
    }

    pub async fn map(&self, id: &str) -> Option<Arc<GeneratedMap>> {
        self.maps.get(id).await
    }

    /// Encoded PNG of map `id` at `dpi`, rendered by `render` on first request.
    /// Concurrent requests for the same image wait for a single render.
    pub async fn png(
        &self,
        id: &str,
        dpi: u32,
        render: impl Future<Output = Result<Vec<u8>, MapError>>,
    ) -> Result<Bytes, MapError> {
        self.png
            .try_get_with((id.to_string(), dpi), async { render.await.map(Bytes::from) })
            .await
            .map_err(unwrap_shared)
    }
}

fn unwrap_shared(err: Arc<MapError>) -> MapError {
    Arc::unwrap_or_clone(err)
}
