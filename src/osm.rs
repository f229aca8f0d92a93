use anyhow::{Context, Result};
use geo_types::Coord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::buffer::StudyArea;
use crate::config::*;
use crate::error::MapError;
use crate::network::{StreetNetwork, Way};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Drive,
    Bike,
    Walk,
    All,
}

impl NetworkType {
    /// Overpass way filter for this network, following OSMnx's definitions.
    fn way_filter(&self) -> &'static str {
        match self {
            Self::Drive => {
                r#"["highway"]["area"!~"yes"]["access"!~"private"]["highway"!~"abandoned|bridleway|bus_guideway|construction|corridor|cycleway|elevator|escalator|footway|no|path|pedestrian|planned|platform|proposed|raceway|razed|service|steps|track"]["motor_vehicle"!~"no"]["motorcar"!~"no"]["service"!~"alley|driveway|emergency_access|parking|parking_aisle|private"]"#
            }
            Self::Bike => {
                r#"["highway"]["area"!~"yes"]["access"!~"private"]["highway"!~"abandoned|bus_guideway|construction|corridor|elevator|escalator|footway|motor|no|planned|platform|proposed|raceway|razed|steps"]["bicycle"!~"no"]["service"!~"private"]"#
            }
            Self::Walk => {
                r#"["highway"]["area"!~"yes"]["access"!~"private"]["highway"!~"abandoned|bus_guideway|construction|cycleway|motor|no|planned|platform|proposed|raceway|razed"]["foot"!~"no"]["service"!~"private"]"#
            }
            Self::All => {
                r#"["highway"]["area"!~"yes"]["access"!~"private"]["highway"!~"abandoned|construction|no|planned|platform|proposed|raceway|razed"]["service"!~"private"]"#
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Drive => "drive",
            Self::Bike => "bike",
            Self::Walk => "walk",
            Self::All => "all",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Drive => "Drive",
            Self::Bike => "Bike",
            Self::Walk => "Walk",
            Self::All => "All",
        }
    }

    /// Word used in progress messages ("Downloading driving network").
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Drive => "driving",
            Self::Bike => "bike",
            Self::Walk => "walking",
            Self::All => "all",
        }
    }

    fn bidirectional(&self) -> bool {
        matches!(self, Self::Walk)
    }
}

#[derive(Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    remark: Option<String>,
    elements: Vec<OverpassElement>,
}

#[derive(Deserialize)]
struct OverpassElement {
    #[serde(rename = "type")]
    elem_type: String,
    id: i64,
    #[serde(default)]
    nodes: Vec<i64>,
    #[serde(default)]
    tags: Option<HashMap<String, String>>,
    #[serde(default)]
    geometry: Option<Vec<Option<OverpassLatLon>>>,
}

#[derive(Deserialize)]
struct OverpassLatLon {
    lat: f64,
    lon: f64,
}

pub fn clear_cache(cache_dir: &Path) {
    if cache_dir.exists() {
        if let Err(e) = fs::remove_dir_all(cache_dir) {
            tracing::warn!("Failed to remove {}: {e}", cache_dir.display());
        } else {
            tracing::info!("Cleared OSM cache at {}", cache_dir.display());
        }
    }
}

pub fn build_query(area: &StudyArea, network_type: NetworkType) -> String {
    format!(
        "[out:json][timeout:{OVERPASS_TIMEOUT_S}];\n(\n  way{filter}(poly:\"{poly}\");\n);\nout geom;",
        filter = network_type.way_filter(),
        poly = area.overpass_poly(),
    )
}

/// Download one network type inside the study area, truncated and simplified.
pub async fn download_osm_network(
    client: &reqwest::Client,
    area: &StudyArea,
    network_type: NetworkType,
    cache_dir: &Path,
) -> Result<StreetNetwork, MapError> {
    let download_err = |reason: String| MapError::Download {
        network: network_type.name().to_string(),
        reason,
    };

    let query = build_query(area, network_type);
    let body = fetch_cached(client, OVERPASS_URL, &query, cache_dir)
        .await
        .map_err(|e| download_err(format!("{e:#}")))?;
    let ways = parse_overpass_json(&body).map_err(|e| download_err(format!("{e:#}")))?;

    let mut network =
        StreetNetwork::from_ways(&ways, Some(&area.polygon), network_type.bidirectional());
    network.retain_largest_component();
    if network.is_empty() {
        return Err(download_err(
            "no street data found within the study area".into(),
        ));
    }
    tracing::info!(
        "Downloaded {} network within {:.0} m (EPSG:{}): {} nodes, {} edges, {} named streets",
        network_type.name(),
        area.radius_m,
        area.crs.epsg(),
        network.node_count(),
        network.edge_count(),
        network.named_street_count(),
    );
    Ok(network)
}

/// Disk cache file for a query; the name depends only on the query text.
pub(crate) fn cache_path(cache_dir: &Path, query: &str) -> PathBuf {
    let hash = xxhash_rust::xxh3::xxh3_64(query.as_bytes());
    cache_dir.join(format!("{hash:016x}.json"))
}

async fn fetch_cached(
    client: &reqwest::Client,
    url: &str,
    query: &str,
    cache_dir: &Path,
) -> Result<String> {
    let path = cache_path(cache_dir, query);
    if path.exists() {
        tracing::debug!("Loading cached Overpass response from {}", path.display());
        return fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()));
    }

    tracing::info!("Fetching network from Overpass API...");
    let resp = client
        .post(url)
        .form(&[("data", query)])
        .send()
        .await
        .context("Failed to query Overpass API")?;

    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        anyhow::bail!("Overpass API returned HTTP {status}");
    }
    // Check before caching so a failed query is not replayed from disk.
    parse_overpass_json(&body)?;

    fs::create_dir_all(cache_dir)?;
    fs::write(&path, &body).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::debug!("Cached Overpass response to {}", path.display());
    Ok(body)
}

pub fn parse_overpass_json(json: &str) -> Result<Vec<Way>> {
    let response: OverpassResponse =
        serde_json::from_str(json).context("Failed to parse Overpass JSON")?;

    if let Some(remark) = response
        .remark
        .as_deref()
        .filter(|r| r.contains("runtime error"))
    {
        anyhow::bail!("Overpass API: {remark}");
    }

    let ways: Vec<Way> = response
        .elements
        .into_iter()
        .filter(|e| e.elem_type == "way")
        .filter_map(|elem| {
            // Nodes outside the query area may come back as nulls; drop the way.
            let geometry: Option<Vec<Coord<f64>>> = elem
                .geometry?
                .into_iter()
                .map(|p| p.map(|p| Coord { x: p.lon, y: p.lat }))
                .collect();
            let geometry = geometry?;
            if geometry.len() < 2 || geometry.len() != elem.nodes.len() {
                return None;
            }
            Some(Way {
                id: elem.id,
                nodes: elem.nodes,
                geometry,
                tags: elem.tags.unwrap_or_default(),
            })
        })
        .collect();

    tracing::debug!("Parsed {} ways from OSM", ways.len());
    Ok(ways)
}
